//! Bounded row hand-off between a source and a target.
//!
//! The source pushes through a [`RowSender`], the target pulls from a
//! [`RowReceiver`]. A full channel blocks the source, so a slow target
//! slows the read. The stream is only complete once the sender finishes
//! explicitly: a receiver that sees the channel close without the end
//! marker reports an error, which keeps the target from committing a
//! partial stream.

use std::sync::Arc;

use loadstar_types::error::ConnectorError;
use loadstar_types::record::{record_size, Record};
use tokio::sync::mpsc;

use crate::checkpoint::HighWaterMark;
use crate::context::RunContext;

/// Code of the error a source gets when the target stopped pulling rows.
pub const CONSUMER_STOPPED: &str = "CONSUMER_STOPPED";
/// Code of the error a target gets when the source ended without finishing.
pub const STREAM_ABORTED: &str = "STREAM_ABORTED";

pub(crate) enum Frame {
    Row(Record),
    End,
}

/// Receives per-row progress from a [`RowSender`].
pub trait ProgressSink: Send + Sync {
    fn record_row(&self, bytes: u64);
}

/// Sink that ignores progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn record_row(&self, _bytes: u64) {}
}

/// Create a connected sender/receiver pair.
///
/// `high_water` tracks the update key of every row sent.
#[must_use]
pub fn row_channel(
    capacity: usize,
    ctx: RunContext,
    progress: Arc<dyn ProgressSink>,
    high_water: Option<HighWaterMark>,
) -> (RowSender, RowReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RowSender {
            tx,
            ctx: ctx.clone(),
            progress,
            high_water,
            sent: 0,
        },
        RowReceiver {
            rx,
            ctx,
            done: false,
            received: 0,
        },
    )
}

/// Source side of the hand-off. Blocking: call from a blocking thread.
pub struct RowSender {
    tx: mpsc::Sender<Frame>,
    ctx: RunContext,
    progress: Arc<dyn ProgressSink>,
    high_water: Option<HighWaterMark>,
    sent: u64,
}

impl RowSender {
    /// Hand one row to the target.
    ///
    /// # Errors
    ///
    /// Returns a cancelled error once the run is cancelled, or
    /// [`CONSUMER_STOPPED`] if the target is gone.
    pub fn send(&mut self, record: Record) -> Result<(), ConnectorError> {
        if let Some(reason) = self.ctx.cancellation_reason() {
            return Err(ConnectorError::cancelled(reason));
        }
        let bytes = record_size(&record);
        if let Some(hwm) = self.high_water.as_mut() {
            hwm.observe(&record);
        }
        self.tx.blocking_send(Frame::Row(record)).map_err(|_| {
            ConnectorError::internal(CONSUMER_STOPPED, "target stopped consuming rows")
        })?;
        self.sent += 1;
        self.progress.record_row(bytes);
        Ok(())
    }

    /// Whether the run has been cancelled. Sources with long gaps between
    /// rows should poll this.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    #[must_use]
    pub fn rows_sent(&self) -> u64 {
        self.sent
    }

    /// Mark the stream complete and return the tracked high-water mark.
    ///
    /// # Errors
    ///
    /// Returns [`CONSUMER_STOPPED`] if the target is gone.
    pub fn finish(self) -> Result<Option<HighWaterMark>, ConnectorError> {
        self.tx.blocking_send(Frame::End).map_err(|_| {
            ConnectorError::internal(CONSUMER_STOPPED, "target stopped before end of stream")
        })?;
        Ok(self.high_water)
    }
}

/// Target side of the hand-off. Blocking: call from a blocking thread.
pub struct RowReceiver {
    rx: mpsc::Receiver<Frame>,
    ctx: RunContext,
    done: bool,
    received: u64,
}

impl RowReceiver {
    /// Next row, or `None` once the source finished the stream.
    ///
    /// # Errors
    ///
    /// Returns a cancelled error once the run is cancelled, or
    /// [`STREAM_ABORTED`] if the source went away without finishing.
    pub fn next_row(&mut self) -> Result<Option<Record>, ConnectorError> {
        if self.done {
            return Ok(None);
        }
        if let Some(reason) = self.ctx.cancellation_reason() {
            return Err(ConnectorError::cancelled(reason));
        }
        match self.rx.blocking_recv() {
            Some(Frame::Row(record)) => {
                self.received += 1;
                Ok(Some(record))
            }
            Some(Frame::End) => {
                self.done = true;
                Ok(None)
            }
            None => Err(ConnectorError::read(
                STREAM_ABORTED,
                "source ended before completing the stream",
            )),
        }
    }

    #[must_use]
    pub fn rows_received(&self) -> u64 {
        self.received
    }
}

impl Iterator for RowReceiver {
    type Item = Result<Record, ConnectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counting(AtomicU64);

    impl ProgressSink for Counting {
        fn record_row(&self, _bytes: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r
    }

    #[test]
    fn finished_stream_ends_cleanly() {
        let progress = Arc::new(Counting::default());
        let (mut tx, rx) = row_channel(
            2,
            RunContext::new(),
            progress.clone(),
            Some(HighWaterMark::new("id", None)),
        );
        let reader = std::thread::spawn(move || rx.collect::<Result<Vec<_>, _>>());
        for id in 1..=5 {
            tx.send(record(id)).unwrap();
        }
        assert_eq!(tx.rows_sent(), 5);
        let hwm = tx.finish().unwrap().unwrap();
        let rows = reader.join().unwrap().unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(hwm.value(), Some("5"));
        assert_eq!(progress.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn dropped_sender_aborts_the_stream() {
        let (mut tx, mut rx) = row_channel(4, RunContext::new(), Arc::new(NoProgress), None);
        tx.send(record(1)).unwrap();
        drop(tx);
        assert!(rx.next_row().unwrap().is_some());
        let err = rx.next_row().unwrap_err();
        assert_eq!(err.code, STREAM_ABORTED);
        assert_eq!(rx.rows_received(), 1);
    }

    #[test]
    fn dropped_receiver_stops_the_source() {
        let (mut tx, rx) = row_channel(4, RunContext::new(), Arc::new(NoProgress), None);
        drop(rx);
        assert_eq!(tx.send(record(1)).unwrap_err().code, CONSUMER_STOPPED);
    }

    #[test]
    fn cancellation_observed_on_both_sides() {
        let ctx = RunContext::new();
        let (mut tx, mut rx) = row_channel(4, ctx.clone(), Arc::new(NoProgress), None);
        tx.send(record(1)).unwrap();
        ctx.cancel("interrupted");
        assert!(tx.is_cancelled());
        assert!(tx.send(record(2)).unwrap_err().is_cancelled());
        assert!(rx.next_row().unwrap_err().is_cancelled());
    }
}
