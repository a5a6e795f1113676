mod rdkafka_client;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::time::Duration;

pub use rdkafka_client::RdKafkaClient;

use crate::error::KafkaClientError;
use crate::topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};

/// The contract the event loop needs from a Kafka consumer client, matching
/// `spec.md` §6 exactly: `subscribe`, `poll`, `pause`, `resume`, `assignment`,
/// `paused`, async/sync commit, `wakeup`, `close`.
///
/// All methods are blocking/synchronous by design — the event loop only ever
/// calls this trait from the dedicated consumer thread (`spec.md` §4.1), so
/// there is no value in an `async fn` here and doing so would invite callers
/// to await it from the wrong thread.
pub trait KafkaClient: Send + Sync + 'static {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaClientError>;

    fn poll(&self, timeout: Duration) -> Result<Vec<ConsumerRecord>, KafkaClientError>;

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError>;

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError>;

    fn assignment(&self) -> Result<Vec<TopicPartition>, KafkaClientError>;

    /// Partitions currently paused by this process. `rdkafka` has no
    /// broker-side query for this; implementations track it locally.
    fn paused(&self) -> Vec<TopicPartition>;

    /// Enqueues an async commit. `on_complete` runs later, on the consumer
    /// thread, once the client has driven the callback to completion — on
    /// `rdkafka` that happens inside a subsequent call to `poll()`.
    fn commit_async(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        on_complete: Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>,
    ) -> Result<(), KafkaClientError>;

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaClientError>;

    /// Interrupts an in-progress (or the next) blocking `poll`.
    fn wakeup(&self);

    fn close(&self, timeout: Duration);
}
