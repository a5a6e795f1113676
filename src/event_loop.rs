use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::at_most_once::AtMostOnceOffsets;
use crate::client::KafkaClient;
use crate::commit_scheduler::CommitScheduler;
use crate::committable_batch::{CommitArgs, CommittableBatch};
use crate::consumer_thread::{ConsumerThread, ConsumerThreadHandle};
use crate::error::{CommitError, KafkaClientError, ReceiverError};
use crate::offset::{Offset, OffsetContext};
use crate::settings::{AckMode, ReceiverSettings};
use crate::topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};

/// Invoked by the Kafka client on the consumer thread whenever a rebalance
/// happens (`spec.md` §4.5 "Rebalance listener").
pub trait RebalanceListener: Send + Sync + 'static {
    fn on_partitions_assigned(&self, partitions: Vec<TopicPartition>);
    fn on_partitions_revoked(&self, partitions: Vec<TopicPartition>);
}

/// Adapts a `Weak<EventLoopShared>` into a `RebalanceListener`, so the
/// listener can be handed to the Kafka client *before* the `Arc<EventLoopShared>`
/// it calls back into has finished being constructed (`Arc::new_cyclic`).
struct WeakRebalanceListener(Weak<EventLoopShared>);

impl RebalanceListener for WeakRebalanceListener {
    fn on_partitions_assigned(&self, partitions: Vec<TopicPartition>) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_partitions_assigned(partitions);
        }
    }

    fn on_partitions_revoked(&self, partitions: Vec<TopicPartition>) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_partitions_revoked(partitions);
        }
    }
}

/// The poll/pause/resume/commit state machine described in `spec.md` §4.5.
///
/// Every method documented below as "consumer-thread" must only run on the
/// worker spawned by [`ConsumerThread`]; `ConsumerThreadHandle::assert_on_consumer_thread`
/// enforces this in debug builds. Everything else is safe to call from any
/// thread or async task.
pub(crate) struct EventLoopShared {
    client: Arc<dyn KafkaClient>,
    consumer_thread: ConsumerThreadHandle,
    // Owns the worker thread's `JoinHandle` for the lifetime of the event
    // loop; its `Drop` joins the thread once the last `ConsumerThreadHandle`
    // sender is dropped and the worker's recv loop exits.
    _consumer_thread_owner: ConsumerThread,
    settings: ReceiverSettings,
    batch: Arc<CommittableBatch>,
    at_most_once: AtMostOnceOffsets,
    runtime: tokio::runtime::Handle,

    records_tx: Mutex<Option<mpsc::Sender<Vec<ConsumerRecord>>>>,
    fatal_error: Mutex<Option<oneshot::Sender<ReceiverError>>>,
    closed: Arc<AtomicBool>,

    commit_batch_signal_tx: mpsc::Sender<()>,
    commit_batch_signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    scheduler_cancel: Mutex<Option<oneshot::Sender<()>>>,

    is_polling: AtomicBool,
    is_paused: AtomicBool,
    scheduled: AtomicBool,
    commit_pending: AtomicBool,
    async_commits_in_progress: AtomicU32,
    consecutive_commit_failures: AtomicU32,
    is_retrying_commit: AtomicBool,
    awaiting_transaction: AtomicBool,
    paused_partitions_by_user: Mutex<HashSet<TopicPartition>>,

    started: AtomicBool,
}

pub(crate) struct EventLoop {
    pub(crate) shared: Arc<EventLoopShared>,
}

impl EventLoop {
    /// Builds the event loop. `client_factory` receives a `RebalanceListener`
    /// it must hand to the underlying Kafka client's rebalance callback
    /// machinery — this indirection is what lets the client and the event
    /// loop that owns it be constructed in one pass (`Arc::new_cyclic`).
    pub fn new(
        settings: ReceiverSettings,
        runtime: tokio::runtime::Handle,
        client_factory: impl FnOnce(Arc<dyn RebalanceListener>) -> Arc<dyn KafkaClient>,
    ) -> Self {
        let (consumer_thread, consumer_thread_handle) = ConsumerThread::spawn(&settings.group_id);

        let (commit_batch_signal_tx, commit_batch_signal_rx) = mpsc::channel(1);
        let max_deferred_commits = settings.max_deferred_commits;

        let shared = Arc::new_cyclic(|weak: &Weak<EventLoopShared>| {
            let listener: Arc<dyn RebalanceListener> = Arc::new(WeakRebalanceListener(weak.clone()));
            let client = client_factory(listener);

            EventLoopShared {
                client,
                consumer_thread: consumer_thread_handle,
                _consumer_thread_owner: consumer_thread,
                batch: Arc::new(CommittableBatch::new(max_deferred_commits)),
                at_most_once: AtMostOnceOffsets::new(),
                runtime,
                records_tx: Mutex::new(None),
                fatal_error: Mutex::new(None),
                closed: Arc::new(AtomicBool::new(false)),
                commit_batch_signal_tx,
                commit_batch_signal_rx: Mutex::new(Some(commit_batch_signal_rx)),
                scheduler_cancel: Mutex::new(None),
                is_polling: AtomicBool::new(true),
                is_paused: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                commit_pending: AtomicBool::new(false),
                async_commits_in_progress: AtomicU32::new(0),
                consecutive_commit_failures: AtomicU32::new(0),
                is_retrying_commit: AtomicBool::new(false),
                awaiting_transaction: AtomicBool::new(false),
                paused_partitions_by_user: Mutex::new(HashSet::new()),
                started: AtomicBool::new(false),
                settings,
            }
        });

        Self { shared }
    }
}

impl EventLoopShared {
    // ---- entry points callable from any thread ----

    /// Starts the loop exactly once: subscribes, schedules the first poll,
    /// and starts the `CommitScheduler`. Safe to call repeatedly; only the
    /// first call has an effect.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let topics = self.settings.topics.clone();
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            if let Err(e) = this.client.subscribe(&topics) {
                this.close_with_fatal_error(ReceiverError::Subscribe(e.to_string()));
                return;
            }
            this.schedule_poll();
        });

        if matches!(self.settings.ack_mode, AckMode::ManualAck | AckMode::AutoAck) {
            let rx = self.commit_batch_signal_rx.lock().unwrap().take();
            if let Some(rx) = rx {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                *self.scheduler_cancel.lock().unwrap() = Some(cancel_tx);
                let scheduler = CommitScheduler::new(
                    Arc::clone(self),
                    rx,
                    self.settings.commit_strategy.clone(),
                    cancel_rx,
                );
                self.runtime.spawn(scheduler.run());
            }
        }
    }

    /// If not currently retrying and `commit_pending` transitions false->true,
    /// enqueues a `commit()` onto the consumer thread.
    pub(crate) fn schedule_commit_if_required(self: &Arc<Self>) {
        if self.is_retrying_commit.load(Ordering::Acquire) {
            return;
        }
        if self.commit_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || this.commit());
    }

    pub(crate) fn offset_context(self: &Arc<Self>) -> Arc<OffsetContext> {
        Arc::new(OffsetContext::from_strategy(
            Arc::clone(&self.batch),
            &self.settings.commit_strategy,
            self.commit_batch_signal_tx.clone(),
            Arc::clone(&self.closed),
        ))
    }

    pub(crate) fn make_offset(self: &Arc<Self>, tp: TopicPartition, offset: i64) -> Offset {
        Offset::new(tp, offset, self.offset_context())
    }

    /// Externally set by whatever coordinates transactional delivery
    /// (out of scope for this crate, per `spec.md` §1's Non-goals — only the
    /// pause/resume mechanism this flag drives is in scope). While true, the
    /// next poll cycle pauses consumption the same way a full records-channel
    /// backpressures it; flipping it back to false resumes exactly
    /// `assignment() \ paused_partitions_by_user` (`spec.md` §3, §8 "Pause
    /// idempotence").
    pub(crate) fn set_awaiting_transaction(self: &Arc<Self>, awaiting: bool) {
        self.awaiting_transaction.store(awaiting, Ordering::Release);
        if !awaiting {
            // A currently blocking poll won't notice the flag flipped back
            // until its next iteration; nothing to wake here since resuming
            // is driven by the next natural poll cycle, not urgently.
            return;
        }
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            if this.pause_and_wakeup_if_needed() {
                let Ok(assignment) = this.client.assignment() else {
                    return;
                };
                let user_paused: Vec<TopicPartition> = this.client.paused();
                *this.paused_partitions_by_user.lock().unwrap() = user_paused.into_iter().collect();
                if let Err(e) = this.client.pause(&assignment) {
                    tracing::warn!("failed to pause assignment for transaction: {e}");
                }
            }
        });
    }

    pub(crate) fn pause_user_partitions(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        {
            let mut guard = self.paused_partitions_by_user.lock().unwrap();
            guard.extend(partitions.iter().cloned());
        }
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            if let Err(e) = this.client.pause(&partitions) {
                tracing::warn!("failed to pause partitions: {e}");
            }
        });
    }

    pub(crate) fn resume_user_partitions(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        {
            let mut guard = self.paused_partitions_by_user.lock().unwrap();
            for p in &partitions {
                guard.remove(p);
            }
        }
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            if this.is_paused.load(Ordering::Acquire) {
                // Global backpressure is still in effect; leave these paused
                // at the broker until the next poll cycle resumes everything.
                return;
            }
            if let Err(e) = this.client.resume(&partitions) {
                tracing::warn!("failed to resume partitions: {e}");
            }
        });
    }

    // ---- consumer-thread operations ----

    /// Debounced: submits a task that clears `scheduled` and, if the channel
    /// is still open, invokes `poll()`.
    pub(crate) fn schedule_poll(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            this.scheduled.store(false, Ordering::Release);
            if this.closed.load(Ordering::Acquire) {
                return;
            }
            this.poll();
        });
    }

    pub(crate) fn poll(self: &Arc<Self>) {
        self.consumer_thread.assert_on_consumer_thread();

        if !self.is_retrying_commit.load(Ordering::Acquire) {
            self.run_commit_if_required(false);
        }

        let pause_for_deferred_commit = self.settings.max_deferred_commits > 0
            && self.batch.deferred_count() >= self.settings.max_deferred_commits;
        let should_poll = self.is_polling.load(Ordering::Acquire)
            && !pause_for_deferred_commit
            && !self.is_retrying_commit.load(Ordering::Acquire);

        if should_poll {
            if !self.awaiting_transaction.load(Ordering::Acquire) {
                if self.is_paused.swap(false, Ordering::AcqRel) {
                    self.resume_after_pause();
                }
            } else {
                self.pause_for_backpressure();
            }
        } else {
            self.pause_for_backpressure();
        }

        let records = match self.client.poll(self.settings.poll_timeout) {
            Ok(records) => records,
            Err(e) if e.is_wakeup() => Vec::new(),
            Err(e) => {
                self.close_with_fatal_error(ReceiverError::Poll(e.to_string()));
                return;
            }
        };

        if records.is_empty() {
            self.schedule_poll();
            return;
        }

        if self.settings.ack_mode == AckMode::AtMostOnce {
            if !self.commit_before_delivery(&records) {
                return;
            }
        } else if self.settings.max_deferred_commits > 0 {
            self.batch.add_uncommitted(&records);
        }

        self.dispatch_records(records);
    }

    /// `AckMode::AtMostOnce` commits the polled batch's offsets synchronously
    /// before it is ever handed downstream, so a crash after delivery never
    /// redelivers (`spec.md` §4.3). Returns whether delivery should proceed.
    fn commit_before_delivery(self: &Arc<Self>, records: &[ConsumerRecord]) -> bool {
        let mut offsets: HashMap<TopicPartition, OffsetAndMetadata> = HashMap::new();
        for record in records {
            let candidate = OffsetAndMetadata::next_read_position(record.offset);
            let entry = offsets
                .entry(record.topic_partition.clone())
                .or_insert(candidate);
            if candidate.offset > entry.offset {
                *entry = candidate;
            }
        }

        match self.client.commit_sync(&offsets) {
            Ok(()) => {
                self.at_most_once.on_commit(&offsets);
                true
            }
            Err(e) => {
                self.close_with_fatal_error(ReceiverError::FatalCommit(e.to_string()));
                false
            }
        }
    }

    /// `is_paused` false -> true transition on the backpressure/transaction
    /// path: pauses whatever wasn't already user-paused. A fresh transition
    /// also snapshots the user-paused set and pauses the full assignment.
    fn pause_for_backpressure(self: &Arc<Self>) {
        if self.pause_and_wakeup_if_needed() {
            let Ok(assignment) = self.client.assignment() else {
                return;
            };
            let user_paused: Vec<TopicPartition> = self.client.paused();
            *self.paused_partitions_by_user.lock().unwrap() = user_paused.into_iter().collect();
            if let Err(e) = self.client.pause(&assignment) {
                tracing::warn!("failed to pause assignment: {e}");
            }
        }
    }

    fn resume_after_pause(self: &Arc<Self>) {
        let Ok(assignment) = self.client.assignment() else {
            return;
        };
        let user_paused = std::mem::take(&mut *self.paused_partitions_by_user.lock().unwrap());
        let resume_set: Vec<TopicPartition> = assignment
            .into_iter()
            .filter(|tp| !user_paused.contains(tp))
            .collect();
        if let Err(e) = self.client.resume(&resume_set) {
            tracing::warn!("failed to resume partitions: {e}");
        }
    }

    /// Atomically sets `is_paused` true; returns whether the transition was
    /// fresh. A fresh transition wakes a currently blocking poll so the state
    /// machine re-enters promptly, unless a commit retry is already driving
    /// that wakeup itself.
    fn pause_and_wakeup_if_needed(self: &Arc<Self>) -> bool {
        let fresh = !self.is_paused.swap(true, Ordering::AcqRel);
        if fresh
            && self.is_polling.load(Ordering::Acquire)
            && !self.is_retrying_commit.load(Ordering::Acquire)
        {
            self.client.wakeup();
        }
        fresh
    }

    fn dispatch_records(self: &Arc<Self>, records: Vec<ConsumerRecord>) {
        let sender = self.records_tx.lock().unwrap().clone();
        let Some(sender) = sender else {
            tracing::debug!("records channel closed; dropping polled batch");
            return;
        };

        match sender.try_send(records) {
            Ok(()) => self.schedule_poll(),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("records channel closed during send; shutdown path will run");
            }
            Err(mpsc::error::TrySendError::Full(records)) => {
                self.is_polling.store(false, Ordering::Release);
                let this = Arc::clone(self);
                self.runtime.spawn(async move {
                    if sender.send(records).await.is_ok() {
                        if this.is_paused.load(Ordering::Acquire) {
                            this.client.wakeup();
                        }
                        this.is_polling.store(true, Ordering::Release);
                        this.schedule_poll();
                    }
                });
            }
        }
    }

    // ---- rebalance listener ----

    fn handle_partitions_assigned(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        if partitions.is_empty() {
            return;
        }
        if self.is_paused.load(Ordering::Acquire) {
            if let Err(e) = self.client.pause(&partitions) {
                tracing::warn!("failed to re-pause assigned partitions: {e}");
            }
            return;
        }

        let user_paused_snapshot: Vec<TopicPartition> = {
            let guard = self.paused_partitions_by_user.lock().unwrap();
            guard.iter().cloned().collect()
        };
        if user_paused_snapshot.is_empty() {
            return;
        }

        let assigned: HashSet<&TopicPartition> = partitions.iter().collect();
        let to_repause: Vec<TopicPartition> = user_paused_snapshot
            .iter()
            .filter(|tp| assigned.contains(tp))
            .cloned()
            .collect();

        {
            let mut guard = self.paused_partitions_by_user.lock().unwrap();
            guard.retain(|tp| assigned.contains(tp));
        }

        if !to_repause.is_empty() {
            if let Err(e) = self.client.pause(&to_repause) {
                tracing::warn!("failed to re-pause user-paused partitions: {e}");
            }
        }
    }

    fn handle_partitions_revoked(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        if self.settings.ack_mode != AckMode::AtMostOnce && !partitions.is_empty() {
            self.run_commit_if_required(true);
        }
        self.batch.on_partitions_revoked(&partitions);
    }

    // ---- commit orchestration ----

    fn run_commit_if_required(self: &Arc<Self>, force: bool) {
        if force || self.commit_pending.load(Ordering::Acquire) {
            self.commit_pending.store(true, Ordering::Release);
            self.commit();
        }
    }

    fn commit(self: &Arc<Self>) {
        self.consumer_thread.assert_on_consumer_thread();

        if !self.commit_pending.swap(false, Ordering::AcqRel) {
            return;
        }

        let args = self.batch.get_and_clear_offsets();
        if args.is_empty() {
            self.commit_success(args);
            return;
        }

        match self.settings.ack_mode {
            AckMode::ManualAck | AckMode::AutoAck => self.dispatch_commit_async(args),
            AckMode::AtMostOnce => self.dispatch_commit_sync(args),
            AckMode::ExactlyOnce => {
                // Delegated to a transactional producer; resolve waiters as a
                // local no-op so callers awaiting `commit()` aren't stuck.
                self.commit_success(args);
            }
        }
    }

    fn dispatch_commit_async(self: &Arc<Self>, args: CommitArgs) {
        self.async_commits_in_progress.fetch_add(1, Ordering::AcqRel);

        let offsets = args.offsets.clone();
        let this_for_callback = Arc::clone(self);
        let args = Arc::new(Mutex::new(Some(args)));
        let args_for_callback = Arc::clone(&args);

        let result = self.client.commit_async(
            &offsets,
            Box::new(move |result| {
                this_for_callback.async_commits_in_progress.fetch_sub(1, Ordering::AcqRel);
                let Some(args) = args_for_callback.lock().unwrap().take() else {
                    return;
                };
                match result {
                    Ok(()) => this_for_callback.commit_success(args),
                    Err(e) => this_for_callback.commit_failure(args, e),
                }
            }),
        );

        if let Err(e) = result {
            self.async_commits_in_progress.fetch_sub(1, Ordering::AcqRel);
            if let Some(args) = args.lock().unwrap().take() {
                self.commit_failure(args, e);
            }
        }

        // The client requires a poll to drive async commit callback delivery.
        self.poll();
    }

    fn dispatch_commit_sync(self: &Arc<Self>, args: CommitArgs) {
        match self.client.commit_sync(&args.offsets) {
            Ok(()) => {
                self.at_most_once.on_commit(&args.offsets);
                self.commit_success(args);
            }
            Err(e) => self.commit_failure(args, e),
        }
    }

    fn commit_success(self: &Arc<Self>, args: CommitArgs) {
        if !args.offsets.is_empty() {
            self.consecutive_commit_failures.store(0, Ordering::Release);
        }
        if self.is_retrying_commit.swap(false, Ordering::AcqRel) {
            self.poll();
        }
        args.resolve_all(Ok(()));
    }

    fn commit_failure(self: &Arc<Self>, args: CommitArgs, error: KafkaClientError) {
        let attempts = self.consecutive_commit_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let retryable = (self.settings.is_retryable_commit_error)(&error);

        // Corrected, non-inverted check per `spec.md` §9 (see DESIGN.md):
        // retry only while the error is retryable *and* the attempt budget
        // isn't exhausted; otherwise surface/close. The source's inverted
        // branch (retrying once the budget is exhausted instead of
        // surfacing) is deliberately not implemented.
        if retryable && attempts < self.settings.max_commit_attempts {
            self.retry_commit(args, error);
            return;
        }

        if args.waiters.is_empty() {
            self.close_with_fatal_error(ReceiverError::FatalCommit(error.to_string()));
            return;
        }
        let waiters_err = CommitError::Commit(error.to_string());
        self.batch.restore_offsets(
            CommitArgs {
                offsets: args.offsets,
                partitions_to_counts: args.partitions_to_counts,
                waiters: Vec::new(),
            },
            false,
        );
        self.commit_pending.store(false, Ordering::Release);
        for waiter in args.waiters {
            waiter.resolve(Err(waiters_err.clone()));
        }
    }

    fn retry_commit(self: &Arc<Self>, args: CommitArgs, error: KafkaClientError) {
        tracing::warn!("commit failed, scheduling retry: {error}");
        self.batch.restore_offsets(args, true);
        self.commit_pending.store(true, Ordering::Release);
        self.is_retrying_commit.store(true, Ordering::Release);
        self.poll();

        let this = Arc::clone(self);
        let interval = self.settings.commit_retry_interval;
        self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            this.consumer_thread.submit(move || this.commit());
        });
    }

    // ---- shutdown ----

    fn close_with_fatal_error(self: &Arc<Self>, error: ReceiverError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            // Already closed once; route to the outer uncaught-exception sink
            // rather than silently dropping a second fatal error.
            tracing::error!("receiver already closed; dropping subsequent fatal error: {error}");
            return;
        }
        *self.records_tx.lock().unwrap() = None;
        if let Some(tx) = self.fatal_error.lock().unwrap().take() {
            let _ = tx.send(error);
        }
    }

    /// Runs the shutdown sequence described in `spec.md` §4.8. Must run on
    /// the consumer thread.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        self.consumer_thread.assert_on_consumer_thread();

        let close_end_time = std::time::Instant::now() + self.settings.close_timeout;

        let force_commit = if self.settings.ack_mode == AckMode::AtMostOnce {
            self.at_most_once.undo_commit_ahead(&self.batch)
        } else {
            true
        };

        if self.settings.ack_mode != AckMode::ExactlyOnce {
            self.run_commit_if_required(force_commit);
            while self.async_commits_in_progress.load(Ordering::Acquire) > 0
                && std::time::Instant::now() < close_end_time
            {
                let _ = self.client.poll(Duration::from_millis(1));
            }
        }

        let remaining = close_end_time.saturating_duration_since(std::time::Instant::now());
        self.client.close(remaining);

        if let Some(tx) = self.scheduler_cancel.lock().unwrap().take() {
            let _ = tx.send(());
        }
        *self.records_tx.lock().unwrap() = None;
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn request_shutdown(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.consumer_thread.submit(move || {
            this.client.wakeup();
            this.shutdown();
        });
    }

    pub(crate) fn take_records_rx_setup(
        self: &Arc<Self>,
    ) -> (mpsc::Receiver<Vec<ConsumerRecord>>, oneshot::Receiver<ReceiverError>) {
        let (tx, rx) = mpsc::channel(1);
        *self.records_tx.lock().unwrap() = Some(tx);
        let (err_tx, err_rx) = oneshot::channel();
        *self.fatal_error.lock().unwrap() = Some(err_tx);
        (rx, err_rx)
    }
}
