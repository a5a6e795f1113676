use std::sync::Arc;
use std::time::Duration;

use crate::error::KafkaClientError;

/// How a commit should be triggered independent of explicit `Offset::commit()`
/// calls: by accumulated batch size, by a wall-clock interval, or by whichever
/// of the two comes first.
#[derive(Clone)]
pub enum CommitStrategy {
    BySize(u64),
    ByTime(Duration),
    BySizeOrTime(u64, Duration),
}

impl CommitStrategy {
    fn default_size() -> u64 {
        5_000
    }

    fn default_interval() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for CommitStrategy {
    fn default() -> Self {
        CommitStrategy::BySizeOrTime(Self::default_size(), Self::default_interval())
    }
}

/// Delivery-guarantee mode and its associated commit mechanism (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// User acknowledges/commits explicitly; commits are async.
    ManualAck,
    /// As `ManualAck`, but the stream layer acknowledges transparently once
    /// downstream has consumed a record.
    AutoAck,
    /// A synchronous commit runs before each record is handed downstream.
    AtMostOnce,
    /// Commits are delegated entirely to a transactional producer; this loop
    /// never commits.
    ExactlyOnce,
}

/// Configuration for a [`KafkaReceiver`](crate::receiver::KafkaReceiver).
///
/// Mirrors the `spec.md` §6 `ReceiverSettings` table. Field names are plain
/// and public, in the style the teacher crate's own `Config`/`Kafka` structs
/// use (`src/config.rs` in the teacher), rather than a fluent builder.
#[derive(Clone)]
pub struct ReceiverSettings {
    pub group_id: String,
    pub bootstrap_servers: Vec<String>,
    pub topics: Vec<String>,
    pub poll_timeout: Duration,
    pub commit_strategy: CommitStrategy,
    pub commit_retry_interval: Duration,
    pub max_commit_attempts: u32,
    pub max_deferred_commits: u64,
    pub close_timeout: Duration,
    pub ack_mode: AckMode,
    pub is_retryable_commit_error: Arc<dyn Fn(&KafkaClientError) -> bool + Send + Sync>,
}

impl ReceiverSettings {
    fn default_poll_timeout() -> Duration {
        Duration::from_millis(100)
    }

    fn default_commit_retry_interval() -> Duration {
        Duration::from_millis(500)
    }

    fn default_max_commit_attempts() -> u32 {
        5
    }

    fn default_close_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Treats everything but an explicit fatal/unexpected client error as
    /// retryable. Callers with a real broker client should supply a predicate
    /// that inspects the underlying `rdkafka::error::RDKafkaErrorCode`.
    pub fn new(group_id: impl Into<String>, bootstrap_servers: Vec<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            bootstrap_servers,
            topics,
            poll_timeout: Self::default_poll_timeout(),
            commit_strategy: CommitStrategy::default(),
            commit_retry_interval: Self::default_commit_retry_interval(),
            max_commit_attempts: Self::default_max_commit_attempts(),
            max_deferred_commits: 0,
            close_timeout: Self::default_close_timeout(),
            ack_mode: AckMode::ManualAck,
            is_retryable_commit_error: Arc::new(|e| !matches!(e, KafkaClientError::Wakeup)),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.commit_strategy = strategy;
        self
    }

    pub fn with_max_deferred_commits(mut self, max: u64) -> Self {
        self.max_deferred_commits = max;
        self
    }
}
