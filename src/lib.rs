//! A back-pressured, concurrency-safe reactive Kafka consumer runtime.
//!
//! [`KafkaReceiver`] owns a dedicated consumer thread and exposes polled
//! records as a lazily-driven [`tokio_stream::Stream`] of batches, gated on
//! downstream consumption so a slow subscriber pauses the underlying
//! partitions instead of the client buffering unboundedly in memory.
//! Acknowledgement and commit orchestration are driven through the
//! [`Offset`](offset::Offset) handle attached to each
//! [`ReceivedRecord`](receiver::ReceivedRecord).

mod at_most_once;
mod client;
mod commit_scheduler;
mod committable_batch;
mod consumer_thread;
mod error;
mod event_loop;
mod offset;
mod receiver;
mod settings;
mod topic_partition;

pub use client::{KafkaClient, RdKafkaClient};
pub use error::{CommitError, KafkaClientError, ReceiverError};
pub use offset::Offset;
pub use receiver::{KafkaReceiver, PartitionControl, ReceivedRecord};
pub use settings::{AckMode, CommitStrategy, ReceiverSettings};
pub use topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};
