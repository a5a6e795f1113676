use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::CommitError;
use crate::topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};

/// A one-shot completion registered by `Offset::commit()`, resumed exactly
/// once the next time its partition's offsets are successfully committed,
/// fail terminally, or are revoked. Modeled as a plain oneshot sender rather
/// than a language-level coroutine per `spec.md` §9.
pub struct CommitWaiter {
    pub partition: TopicPartition,
    sender: tokio::sync::oneshot::Sender<Result<(), CommitError>>,
}

impl CommitWaiter {
    pub fn new(
        partition: TopicPartition,
    ) -> (Self, tokio::sync::oneshot::Receiver<Result<(), CommitError>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Self { partition, sender: tx }, rx)
    }

    /// Resolves the waiter. A dropped receiver (the caller cancelled) makes
    /// this a harmless no-op — `spec.md` §5's cancellation contract is
    /// satisfied without the waiter needing to remove itself explicitly.
    pub fn resolve(self, result: Result<(), CommitError>) {
        let _ = self.sender.send(result);
    }
}

/// A snapshot of everything that was pending in a [`CommittableBatch`] at the
/// moment it was drained, per `spec.md` §3.
#[derive(Default)]
pub struct CommitArgs {
    pub offsets: HashMap<TopicPartition, OffsetAndMetadata>,
    pub partitions_to_counts: HashMap<TopicPartition, u64>,
    pub waiters: Vec<CommitWaiter>,
}

impl CommitArgs {
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Resolves every waiter with the same terminal result.
    pub fn resolve_all(self, result: Result<(), CommitError>) {
        for waiter in self.waiters {
            waiter.resolve(result.clone());
        }
    }
}

#[derive(Default)]
struct State {
    latest_offsets: HashMap<TopicPartition, i64>,
    pending_counts: HashMap<TopicPartition, u64>,
    uncommitted: HashMap<TopicPartition, BTreeSet<i64>>,
    waiters: Vec<CommitWaiter>,
}

/// Accumulates per-partition max-offset-to-commit plus pending
/// commit-completion waiters (`spec.md` §3/§4.2). All operations are
/// internally synchronized and callable from any thread.
pub struct CommittableBatch {
    state: Mutex<State>,
    max_deferred_commits: u64,
}

impl CommittableBatch {
    pub fn new(max_deferred_commits: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_deferred_commits,
        }
    }

    /// Raises `latest_offsets[tp]` to `max(existing, offset)`, increments
    /// `pending_counts[tp]`, and returns the total pending count across all
    /// partitions (used to compare against `commitBatchSize`).
    pub fn update_offset(&self, tp: &TopicPartition, offset: i64) -> u64 {
        let mut state = self.state.lock().unwrap();
        let entry = state.latest_offsets.entry(tp.clone()).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
        *state.pending_counts.entry(tp.clone()).or_insert(0) += 1;
        state.pending_counts.values().sum()
    }

    pub fn batch_size(&self) -> u64 {
        self.state.lock().unwrap().pending_counts.values().sum()
    }

    pub fn deferred_count(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .uncommitted
            .values()
            .map(|s| s.len() as u64)
            .sum()
    }

    /// Records polled-but-not-yet-acknowledged offsets. Only meaningful (and
    /// only called) when `max_deferred_commits > 0`.
    pub fn add_uncommitted(&self, records: &[ConsumerRecord]) {
        if self.max_deferred_commits == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for record in records {
            state
                .uncommitted
                .entry(record.topic_partition.clone())
                .or_default()
                .insert(record.offset);
        }
    }

    /// Acknowledgement path for deferred-commit gating: removes the exact
    /// offset from the uncommitted set in addition to raising the watermark.
    pub fn acknowledge(&self, tp: &TopicPartition, offset: i64) -> u64 {
        if self.max_deferred_commits > 0 {
            let mut state = self.state.lock().unwrap();
            if let Some(set) = state.uncommitted.get_mut(tp) {
                set.remove(&offset);
            }
        }
        self.update_offset(tp, offset)
    }

    pub fn add_continuation(&self, waiter: CommitWaiter) {
        self.state.lock().unwrap().waiters.push(waiter);
    }

    /// Atomically snapshots `latest_offsets` (as offset+1 per partition) and
    /// `pending_counts`, drains `waiters`, and resets both maps. Returns an
    /// empty [`CommitArgs`] if nothing was pending.
    pub fn get_and_clear_offsets(&self) -> CommitArgs {
        let mut state = self.state.lock().unwrap();

        let offsets = std::mem::take(&mut state.latest_offsets)
            .into_iter()
            .map(|(tp, offset)| (tp, OffsetAndMetadata::next_read_position(offset)))
            .collect();
        let partitions_to_counts = std::mem::take(&mut state.pending_counts);
        let waiters = std::mem::take(&mut state.waiters);

        CommitArgs {
            offsets,
            partitions_to_counts,
            waiters,
        }
    }

    /// On commit failure, merges a drained [`CommitArgs`] back into state:
    /// re-raises `latest_offsets[tp]` to `max(current, args_offset - 1)`,
    /// adds back `pending_counts`, and — if `restore_waiters` — re-queues the
    /// waiters at the head so they are resumed before newer registrations.
    pub fn restore_offsets(&self, args: CommitArgs, restore_waiters: bool) {
        let mut state = self.state.lock().unwrap();

        for (tp, oam) in &args.offsets {
            let restored_offset = oam.offset - 1;
            let entry = state.latest_offsets.entry(tp.clone()).or_insert(restored_offset);
            if restored_offset > *entry {
                *entry = restored_offset;
            }
        }
        for (tp, count) in args.partitions_to_counts {
            *state.pending_counts.entry(tp).or_insert(0) += count;
        }

        if restore_waiters {
            let mut waiters = args.waiters;
            waiters.append(&mut state.waiters);
            state.waiters = waiters;
        }
    }

    /// Called only from [`AtMostOnceOffsets::undo_commit_ahead`]: for each
    /// partition already sync-committed ahead of this batch's accumulated
    /// offset, drops that partition's pending state so shutdown does not
    /// redundantly re-commit it. Returns whether anything was corrected.
    pub fn supersede_if_committed_ahead(
        &self,
        committed_ahead: &HashMap<TopicPartition, i64>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let mut corrected = false;
        for (tp, ahead_offset) in committed_ahead {
            if let Some(latest) = state.latest_offsets.get(tp) {
                if *ahead_offset > *latest {
                    state.latest_offsets.remove(tp);
                    state.pending_counts.remove(tp);
                    corrected = true;
                }
            }
        }
        corrected
    }

    /// Drops state for revoked partitions. Waiters tied exclusively to them
    /// are resumed: successfully if nothing was left pending for that
    /// partition (nothing was lost), with `CommitError::PartitionsRevoked`
    /// otherwise — see DESIGN.md for why this branch was picked over the
    /// spec's other documented option.
    pub fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        let revoked: std::collections::HashSet<&TopicPartition> = partitions.iter().collect();
        let mut state = self.state.lock().unwrap();

        let mut remaining_waiters = Vec::new();
        let mut to_resolve = Vec::new();
        for waiter in std::mem::take(&mut state.waiters) {
            if revoked.contains(&waiter.partition) {
                to_resolve.push(waiter);
            } else {
                remaining_waiters.push(waiter);
            }
        }
        state.waiters = remaining_waiters;

        let had_pending: std::collections::HashSet<TopicPartition> = partitions
            .iter()
            .filter(|tp| state.pending_counts.contains_key(*tp))
            .cloned()
            .collect();

        for tp in partitions {
            state.latest_offsets.remove(tp);
            state.pending_counts.remove(tp);
            state.uncommitted.remove(tp);
        }

        for waiter in to_resolve {
            let result = if had_pending.contains(&waiter.partition) {
                Err(CommitError::PartitionsRevoked(vec![waiter.partition.clone()]))
            } else {
                Ok(())
            };
            waiter.resolve(result);
        }
    }
}
