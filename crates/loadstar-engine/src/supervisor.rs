//! Maps process signals onto cooperative cancellation of the active run.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::RunContext;

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Reason recorded on the run context when an interrupt arrives.
pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ctrl-C: cancel and wait for cleanup.
    Interrupt,
    /// Termination request: stop immediately.
    Terminate,
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    /// Interrupted, and the run finalized within the grace period.
    Interrupted,
    /// The run did not finalize within the grace period.
    Forced,
    Terminated,
}

impl ExitStatus {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Forced => 111,
            Self::Interrupted => 130,
            Self::Terminated => 143,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
        }
    }
}

impl Supervisor {
    #[must_use]
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run `work` on its own task while listening for `signals`.
    ///
    /// `work` resolves to whether the run succeeded. An interrupt cancels
    /// `ctx` and waits up to the grace period for `work` to finish; a
    /// termination request aborts it at once.
    pub async fn run<F>(
        &self,
        ctx: &RunContext,
        mut signals: mpsc::Receiver<ProcessSignal>,
        work: F,
    ) -> ExitStatus
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let mut work = tokio::spawn(work);
        let mut listening = true;
        loop {
            tokio::select! {
                joined = &mut work => {
                    return match joined {
                        Ok(true) => ExitStatus::Success,
                        Ok(false) => ExitStatus::Failure,
                        Err(e) => {
                            tracing::error!(error = %e, "Run ended abnormally");
                            ExitStatus::Failure
                        }
                    };
                }
                signal = signals.recv(), if listening => match signal {
                    Some(ProcessSignal::Interrupt) => {
                        tracing::warn!(
                            grace_secs = self.grace.as_secs_f64(),
                            "Interrupt received, cancelling active run"
                        );
                        ctx.cancel(INTERRUPTED);
                        return match tokio::time::timeout(self.grace, &mut work).await {
                            Ok(_) => ExitStatus::Interrupted,
                            Err(_) => {
                                tracing::error!("Run did not stop within the grace period, forcing exit");
                                work.abort();
                                ExitStatus::Forced
                            }
                        };
                    }
                    Some(ProcessSignal::Terminate) => {
                        tracing::warn!("Termination requested, exiting immediately");
                        ctx.cancel("terminated");
                        work.abort();
                        return ExitStatus::Terminated;
                    }
                    None => listening = false,
                },
            }
        }
    }
}

/// Forward OS interrupt and termination signals.
#[must_use]
pub fn os_signals() -> mpsc::Receiver<ProcessSignal> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for termination signals");
                    None
                }
            };
        loop {
            #[cfg(unix)]
            let terminated = async {
                match terminate.as_mut() {
                    Some(stream) => {
                        if stream.recv().await.is_none() {
                            std::future::pending::<()>().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let terminated = std::future::pending::<()>();

            let signal = tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => ProcessSignal::Interrupt,
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot listen for interrupts");
                        break;
                    }
                },
                () = terminated => ProcessSignal::Terminate,
            };
            if tx.send(signal).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            ExitStatus::Success,
            ExitStatus::Failure,
            ExitStatus::Interrupted,
            ExitStatus::Forced,
            ExitStatus::Terminated,
        ]
        .map(ExitStatus::code);
        assert_eq!(codes[0], 0);
        let unique: std::collections::BTreeSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[tokio::test]
    async fn work_result_decides_status() {
        let (_tx, rx) = mpsc::channel(1);
        let status = Supervisor::default()
            .run(&RunContext::new(), rx, async { false })
            .await;
        assert_eq!(status, ExitStatus::Failure);
    }

    #[tokio::test]
    async fn closed_signal_channel_keeps_waiting_for_work() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let status = Supervisor::default()
            .run(&RunContext::new(), rx, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                true
            })
            .await;
        assert_eq!(status, ExitStatus::Success);
    }
}
