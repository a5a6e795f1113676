use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::KafkaClient;
use crate::error::KafkaClientError;
use crate::event_loop::RebalanceListener;
use crate::topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};

type PendingCommitCallback = Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>;

enum ScriptedPoll {
    Records(Vec<ConsumerRecord>),
    Empty,
    Wakeup,
    Error(String),
}

enum RebalanceEvent {
    Revoked(Vec<TopicPartition>),
    Assigned(Vec<TopicPartition>),
}

#[derive(Default)]
struct State {
    poll_queue: VecDeque<ScriptedPoll>,
    assignment: Vec<TopicPartition>,
    paused: HashSet<TopicPartition>,
    subscribed_topics: Vec<String>,
    pending_commits: VecDeque<PendingCommitCallback>,
    ready_to_fire: VecDeque<(PendingCommitCallback, Result<(), KafkaClientError>)>,
    pending_rebalance_events: VecDeque<RebalanceEvent>,
    commit_log: Vec<HashMap<TopicPartition, OffsetAndMetadata>>,
    commit_sync_log: Vec<HashMap<TopicPartition, OffsetAndMetadata>>,
    woken: bool,
    closed: bool,
    next_commit_result: Option<Result<(), KafkaClientError>>,
    next_commit_sync_result: Option<Result<(), KafkaClientError>>,
}

/// Scriptable [`KafkaClient`] double. Tests drive it by pre-loading poll
/// results with [`MockKafkaClient::push_records`]/`push_wakeup`/`push_error`
/// and by inspecting `commit_log`/`commit_sync_log` after the fact, mirroring
/// how the teacher crate's `source/counter.rs` tests poke a `Source` through
/// a channel rather than a real broker connection.
pub(crate) struct MockKafkaClient {
    state: Mutex<State>,
    rebalance_listener: Arc<dyn RebalanceListener>,
}

impl MockKafkaClient {
    pub fn new(rebalance_listener: Arc<dyn RebalanceListener>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            rebalance_listener,
        })
    }

    pub fn set_assignment(&self, partitions: Vec<TopicPartition>) {
        self.state.lock().unwrap().assignment = partitions;
    }

    pub fn push_records(&self, records: Vec<ConsumerRecord>) {
        self.state.lock().unwrap().poll_queue.push_back(ScriptedPoll::Records(records));
    }

    pub fn push_empty(&self) {
        self.state.lock().unwrap().poll_queue.push_back(ScriptedPoll::Empty);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .poll_queue
            .push_back(ScriptedPoll::Error(message.into()));
    }

    pub fn set_next_commit_result(&self, result: Result<(), KafkaClientError>) {
        self.state.lock().unwrap().next_commit_result = Some(result);
    }

    pub fn set_next_commit_sync_result(&self, result: Result<(), KafkaClientError>) {
        self.state.lock().unwrap().next_commit_sync_result = Some(result);
    }

    /// Marks the oldest registered `commit_async` callback ready to fire.
    /// It actually runs on the next `poll()` call, not synchronously here —
    /// matching `rdkafka`, whose `commit_callback` only ever fires from
    /// inside `poll()` on the consumer thread, never from whatever thread
    /// happened to cause the broker ack.
    pub fn complete_next_commit(&self, result: Result<(), KafkaClientError>) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.pending_commits.pop_front() {
            Some(callback) => {
                state.ready_to_fire.push_back((callback, result));
                true
            }
            None => false,
        }
    }

    pub fn pending_commit_count(&self) -> usize {
        self.state.lock().unwrap().pending_commits.len()
    }

    pub fn commit_log(&self) -> Vec<HashMap<TopicPartition, OffsetAndMetadata>> {
        self.state.lock().unwrap().commit_log.clone()
    }

    pub fn commit_sync_log(&self) -> Vec<HashMap<TopicPartition, OffsetAndMetadata>> {
        self.state.lock().unwrap().commit_sync_log.clone()
    }

    pub fn paused_snapshot(&self) -> HashSet<TopicPartition> {
        self.state.lock().unwrap().paused.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Queues a revoke notification. Like `pre_rebalance`/`post_rebalance` in
    /// real `rdkafka`, this only actually fires from inside the next `poll()`
    /// call on the consumer thread, never synchronously here.
    pub fn fire_partitions_revoked(&self, partitions: Vec<TopicPartition>) {
        self.state
            .lock()
            .unwrap()
            .pending_rebalance_events
            .push_back(RebalanceEvent::Revoked(partitions));
    }

    pub fn fire_partitions_assigned(&self, partitions: Vec<TopicPartition>) {
        self.state
            .lock()
            .unwrap()
            .pending_rebalance_events
            .push_back(RebalanceEvent::Assigned(partitions));
    }
}

impl KafkaClient for MockKafkaClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaClientError> {
        self.state.lock().unwrap().subscribed_topics = topics.to_vec();
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<ConsumerRecord>, KafkaClientError> {
        let mut state = self.state.lock().unwrap();

        let ready: Vec<_> = state.ready_to_fire.drain(..).collect();
        let rebalance_events: Vec<_> = state.pending_rebalance_events.drain(..).collect();
        drop(state);
        for (callback, result) in ready {
            callback(result);
        }
        for event in rebalance_events {
            match event {
                RebalanceEvent::Revoked(partitions) => {
                    self.rebalance_listener.on_partitions_revoked(partitions)
                }
                RebalanceEvent::Assigned(partitions) => {
                    self.rebalance_listener.on_partitions_assigned(partitions)
                }
            }
        }
        let mut state = self.state.lock().unwrap();

        if std::mem::take(&mut state.woken) {
            return Err(KafkaClientError::Wakeup);
        }

        match state.poll_queue.pop_front() {
            Some(ScriptedPoll::Records(records)) => Ok(records),
            Some(ScriptedPoll::Wakeup) => Err(KafkaClientError::Wakeup),
            Some(ScriptedPoll::Error(message)) => Err(KafkaClientError::Client(message)),
            Some(ScriptedPoll::Empty) | None => {
                // A real broker poll blocks up to `timeout` rather than
                // returning instantly; without this, an idle consumer thread
                // would busy-loop `schedule_poll -> poll -> empty` at full CPU.
                drop(state);
                std::thread::sleep(timeout);
                Ok(Vec::new())
            }
        }
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        self.state.lock().unwrap().paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        let mut state = self.state.lock().unwrap();
        for p in partitions {
            state.paused.remove(p);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, KafkaClientError> {
        Ok(self.state.lock().unwrap().assignment.clone())
    }

    fn paused(&self) -> Vec<TopicPartition> {
        self.state.lock().unwrap().paused.iter().cloned().collect()
    }

    fn commit_async(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        on_complete: Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>,
    ) -> Result<(), KafkaClientError> {
        let mut state = self.state.lock().unwrap();
        state.commit_log.push(offsets.clone());
        if let Some(result) = state.next_commit_result.take() {
            drop(state);
            on_complete(result);
        } else {
            state.pending_commits.push_back(on_complete);
        }
        Ok(())
    }

    fn commit_sync(&self, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) -> Result<(), KafkaClientError> {
        let mut state = self.state.lock().unwrap();
        state.commit_sync_log.push(offsets.clone());
        state.next_commit_sync_result.take().unwrap_or(Ok(()))
    }

    fn wakeup(&self) {
        self.state.lock().unwrap().woken = true;
    }

    fn close(&self, _timeout: Duration) {
        self.state.lock().unwrap().closed = true;
    }
}
