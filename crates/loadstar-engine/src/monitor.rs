//! Periodic sampling of a running task: throughput over a trailing window
//! and an advisory stall flag.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::settings::EngineSettings;
use crate::task::TaskExecution;

/// Progress message while target pre-statements run.
pub const PRE_SQL_PHASE: &str = "executing pre-sql";
/// Progress message while target post-statements run.
pub const POST_SQL_PHASE: &str = "executing post-sql";

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Pre/post statements may legitimately run long without moving rows.
#[must_use]
pub fn is_auxiliary_phase(progress: &str) -> bool {
    let progress = progress.to_ascii_lowercase();
    progress.contains("pre-sql") || progress.contains("post-sql")
}

/// True when counters have not moved for longer than `window`.
#[must_use]
pub fn is_stalled(last_increment: Instant, now: Instant, window: Duration, progress: &str) -> bool {
    !is_auxiliary_phase(progress) && now.saturating_duration_since(last_increment) > window
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct Rates {
    pub rows_per_sec: f64,
    pub bytes_per_sec: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    rows: u64,
    bytes: u64,
}

/// Rates over a trailing window of counter samples.
#[derive(Debug)]
pub struct RateTracker {
    window: Duration,
    samples: VecDeque<Sample>,
}

impl RateTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record counters observed at `at` and return the current rates.
    ///
    /// A window of zero length yields zero rates.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&mut self, at: Instant, rows: u64, bytes: u64) -> Rates {
        self.samples.push_back(Sample { at, rows, bytes });
        while self.samples.len() > 1
            && self
                .samples
                .front()
                .is_some_and(|s| at.saturating_duration_since(s.at) > self.window)
        {
            self.samples.pop_front();
        }

        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return Rates::default();
        };
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return Rates::default();
        }
        Rates {
            rows_per_sec: last.rows.saturating_sub(first.rows) as f64 / elapsed,
            bytes_per_sec: last.bytes.saturating_sub(first.bytes) as f64 / elapsed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub stall_window: Duration,
    pub rate_window: Duration,
    pub show_progress: bool,
}

impl From<&EngineSettings> for MonitorConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            sample_interval: settings.sample_interval,
            stall_window: settings.stall_window,
            rate_window: settings.rate_window,
            show_progress: settings.show_progress,
        }
    }
}

/// Running monitor loop.
pub struct MonitorHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!(error = %e, "Monitor task ended abnormally");
        }
    }
}

/// Sample `execution` every `config.sample_interval` until stopped or
/// until the execution is finalized.
pub fn spawn(execution: TaskExecution, config: MonitorConfig) -> MonitorHandle {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let task = tokio::spawn(async move {
        let mut tracker = RateTracker::new(config.rate_window);
        let mut ticker = tokio::time::interval(config.sample_interval.max(MIN_SAMPLE_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(status) = execution.sample(&mut tracker, Instant::now(), config.stall_window)
            else {
                break;
            };
            if config.show_progress {
                tracing::info!(
                    stream = execution.stream_name(),
                    progress = %status.progress,
                    rows = status.rows,
                    bytes = status.bytes,
                    rows_per_sec = format!("{:.1}", status.rates.rows_per_sec),
                    stalled = status.stalled,
                    "Progress"
                );
            }
        }
    });
    MonitorHandle { stop, task }
}
