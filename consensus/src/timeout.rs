//! Monotonic per-(height, round, step) timeout scheduling.
//!
//! The ticker holds a single pending slot: scheduling a new timeout cancels
//! any outstanding one. Expiry hands the `TimeoutInfo` back to the state
//! machine through the shared event queue.

use core::time::Duration;

use reimint_types::{Height, Round, RoundStep};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
}

pub struct TimeoutTicker {
    schedule_tx: mpsc::UnboundedSender<TimeoutInfo>,
    task: JoinHandle<()>,
}

impl TimeoutTicker {
    /// Spawn the ticker task; `on_timeout` fires on expiry (it pushes the
    /// event into the state-machine queue).
    pub fn spawn<F>(on_timeout: F) -> Self
    where
        F: Fn(TimeoutInfo) + Send + 'static,
    {
        let (schedule_tx, mut schedule_rx) = mpsc::unbounded_channel::<TimeoutInfo>();

        let task = tokio::spawn(async move {
            let mut pending: Option<(Instant, TimeoutInfo)> = None;
            loop {
                match pending {
                    None => match schedule_rx.recv().await {
                        Some(info) => pending = Some((Instant::now() + info.duration, info)),
                        None => break,
                    },
                    Some((deadline, info)) => {
                        tokio::select! {
                            next = schedule_rx.recv() => match next {
                                Some(next) => {
                                    debug!(
                                        height = info.height,
                                        round = info.round,
                                        step = %info.step,
                                        "replacing pending timeout"
                                    );
                                    pending = Some((Instant::now() + next.duration, next));
                                }
                                None => break,
                            },
                            () = sleep_until(deadline) => {
                                on_timeout(info);
                                pending = None;
                            }
                        }
                    }
                }
            }
        });

        Self { schedule_tx, task }
    }

    /// Schedule a timeout, replacing any outstanding one.
    pub fn schedule(&self, info: TimeoutInfo) {
        let _ = self.schedule_tx.send(info);
    }

    /// Cancel the pending timer and stop the task.
    pub fn stop(&self) {
        self.task.abort();
    }
}
