use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::event_loop::EventLoopShared;
use crate::settings::CommitStrategy;

/// Drives `EventLoopShared::schedule_commit_if_required` on whatever cadence
/// `CommitStrategy` calls for (`spec.md` §4.7). Runs as a standalone tokio
/// task for the lifetime of the subscription; cancelled at shutdown.
pub(crate) struct CommitScheduler {
    event_loop: Arc<EventLoopShared>,
    batch_signal: mpsc::Receiver<()>,
    strategy: CommitStrategy,
    cancel: oneshot::Receiver<()>,
}

impl CommitScheduler {
    pub(crate) fn new(
        event_loop: Arc<EventLoopShared>,
        batch_signal: mpsc::Receiver<()>,
        strategy: CommitStrategy,
        cancel: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            event_loop,
            batch_signal,
            strategy,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.strategy {
            CommitStrategy::BySize(_) => self.run_size_only().await,
            CommitStrategy::ByTime(interval) => self.run_time_only(interval).await,
            CommitStrategy::BySizeOrTime(_, interval) => self.run_size_or_time(interval).await,
        }
    }

    async fn run_size_only(&mut self) {
        loop {
            tokio::select! {
                biased;
                _ = &mut self.cancel => return,
                signal = self.batch_signal.recv() => {
                    match signal {
                        Some(()) => self.event_loop.schedule_commit_if_required(),
                        None => return,
                    }
                }
            }
        }
    }

    async fn run_time_only(&mut self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; that's not a meaningful "time elapsed"
        // signal yet, so burn it before entering the real loop.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = &mut self.cancel => return,
                _ = ticker.tick() => self.event_loop.schedule_commit_if_required(),
            }
        }
    }

    async fn run_size_or_time(&mut self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = &mut self.cancel => return,
                signal = self.batch_signal.recv() => {
                    match signal {
                        Some(()) => {
                            self.event_loop.schedule_commit_if_required();
                            ticker.reset();
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => self.event_loop.schedule_commit_if_required(),
            }
        }
    }
}
