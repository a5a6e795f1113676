use thiserror::Error;

use crate::topic_partition::TopicPartition;

/// Errors surfaced by the [`KafkaClient`](crate::client::KafkaClient) contract.
///
/// `Wakeup` is not a client library failure: it is the sanctioned signal that
/// interrupts a blocking `poll`, and callers treat it as "poll returned no
/// records" rather than propagating it as a fault.
#[derive(Debug, Error, Clone)]
pub enum KafkaClientError {
    #[error("wakeup during poll")]
    Wakeup,
    #[error("kafka client error: {0}")]
    Client(String),
}

impl KafkaClientError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, KafkaClientError::Wakeup)
    }
}

/// Errors completing a pending `Offset::commit()` waiter.
#[derive(Debug, Error, Clone)]
pub enum CommitError {
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("partitions revoked before commit completed: {0:?}")]
    PartitionsRevoked(Vec<TopicPartition>),
    #[error("receiver closed before commit completed")]
    Closed,
}

/// Fatal or near-fatal errors for the event loop as a whole. Any of these
/// close the records channel exactly once; see `spec.md` §7's propagation rule.
#[derive(Debug, Error, Clone)]
pub enum ReceiverError {
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("unexpected error while polling: {0}")]
    Poll(String),
    #[error("commit failed with no pending waiters to notify: {0}")]
    FatalCommit(String),
    #[error("receiver has already been closed")]
    Closed,
}
