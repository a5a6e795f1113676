use std::sync::Arc;

/// A (topic, partition) pair. Cheaply cloneable: the topic name is shared via
/// `Arc<str>` since the same handful of topic names recur across every record,
/// offset, and commit structure the event loop touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// The offset a consumer group's next read of a partition should resume from,
/// i.e. one past the last offset actually committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
}

impl OffsetAndMetadata {
    /// Encodes "the next offset to read is one past the highest offset seen",
    /// per the consumer's next-read-position commit semantics.
    pub fn next_read_position(last_seen_offset: i64) -> Self {
        Self {
            offset: last_seen_offset + 1,
        }
    }
}

/// A single polled record, detached from the client library's borrow of the
/// underlying buffer so it can cross the rendezvous channel to downstream.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic_partition: TopicPartition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}
