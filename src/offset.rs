use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::committable_batch::{CommitWaiter, CommittableBatch};
use crate::error::CommitError;
use crate::settings::CommitStrategy;
use crate::topic_partition::TopicPartition;

/// Shared state an [`Offset`] needs to reach back into the owning event loop
/// without holding a reference to it directly.
pub(crate) struct OffsetContext {
    pub batch: Arc<CommittableBatch>,
    pub commit_batch_size: Option<u64>,
    /// Non-blocking rendezvous signal consumed by the `CommitScheduler`'s
    /// `BySize`/`BySizeOrTime` wake-up path.
    pub commit_batch_signal: tokio::sync::mpsc::Sender<()>,
    pub closed: Arc<AtomicBool>,
}

impl OffsetContext {
    pub fn from_strategy(
        batch: Arc<CommittableBatch>,
        strategy: &CommitStrategy,
        commit_batch_signal: tokio::sync::mpsc::Sender<()>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let commit_batch_size = match strategy {
            CommitStrategy::BySize(n) | CommitStrategy::BySizeOrTime(n, _) => Some(*n),
            CommitStrategy::ByTime(_) => None,
        };
        Self {
            batch,
            commit_batch_size,
            commit_batch_signal,
            closed,
        }
    }
}

/// Per-record acknowledge/commit primitive exposed to downstream consumers
/// (`spec.md` §3/§4.4). Thread-safe; callable from arbitrary tasks. Neither
/// `acknowledge()` nor `commit()` performs a commit synchronously — they only
/// update the batch and, for `commit()`, register a waiter.
pub struct Offset {
    topic_partition: TopicPartition,
    offset: i64,
    acknowledged: AtomicBool,
    context: Arc<OffsetContext>,
}

impl Offset {
    pub(crate) fn new(topic_partition: TopicPartition, offset: i64, context: Arc<OffsetContext>) -> Self {
        Self {
            topic_partition,
            offset,
            acknowledged: AtomicBool::new(false),
            context,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Marks this offset eligible to be committed. The first call updates the
    /// batch and, if a size threshold is configured and now met, emits a
    /// non-blocking signal to wake the `CommitScheduler`. Subsequent calls
    /// are silent no-ops.
    pub fn acknowledge(&self) {
        if self.acknowledged.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.context.closed.load(Ordering::Acquire) {
            return;
        }

        let pending = self.context.batch.acknowledge(&self.topic_partition, self.offset);

        if let Some(threshold) = self.context.commit_batch_size {
            if threshold >= 1 && pending >= threshold {
                let _ = self.context.commit_batch_signal.try_send(());
            }
        }
    }

    /// Marks this offset eligible to be committed and returns a future that
    /// resolves once the next commit containing it succeeds, or rejects on a
    /// terminal commit failure. Repeat calls return immediately with no new
    /// waiter registered.
    pub async fn commit(&self) -> Result<(), CommitError> {
        if self.acknowledged.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.context.closed.load(Ordering::Acquire) {
            return Err(CommitError::Closed);
        }

        let pending = self.context.batch.acknowledge(&self.topic_partition, self.offset);
        if let Some(threshold) = self.context.commit_batch_size {
            if threshold >= 1 && pending >= threshold {
                let _ = self.context.commit_batch_signal.try_send(());
            }
        }

        let (waiter, rx) = CommitWaiter::new(self.topic_partition.clone());
        self.context.batch.add_continuation(waiter);

        rx.await.unwrap_or(Err(CommitError::Closed))
    }
}
