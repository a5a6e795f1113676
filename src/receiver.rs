use std::sync::Arc;

use async_stream::stream;
use tokio_stream::Stream;

use crate::client::{KafkaClient, RdKafkaClient};
use crate::error::{KafkaClientError, ReceiverError};
use crate::event_loop::{EventLoop, EventLoopShared, RebalanceListener};
use crate::offset::Offset;
use crate::settings::ReceiverSettings;
use crate::topic_partition::{ConsumerRecord, TopicPartition};

/// A single record handed to a [`KafkaReceiver`] consumer, paired with the
/// [`Offset`] handle used to acknowledge or commit it (`spec.md` §3/§4.4).
pub struct ReceivedRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub offset: Offset,
}

/// A pause/resume handle over the partitions currently assigned to a
/// [`KafkaReceiver`], decoupled from the record stream itself so a downstream
/// consumer can react to its own load without threading state through every
/// `poll()` iteration. Supplements `spec.md`'s explicit pause/resume
/// operations with a type dedicated to holding them.
#[derive(Clone)]
pub struct PartitionControl {
    event_loop: Arc<EventLoopShared>,
}

impl PartitionControl {
    pub fn pause(&self, partitions: Vec<TopicPartition>) {
        self.event_loop.pause_user_partitions(partitions);
    }

    pub fn resume(&self, partitions: Vec<TopicPartition>) {
        self.event_loop.resume_user_partitions(partitions);
    }

    /// Signals that consumption should pause because a transactional
    /// producer is mid-flight (`spec.md` §3/§4.5's `awaiting_transaction`
    /// flag). Coordinating with that producer is outside this crate's scope
    /// (`spec.md` §1 Non-goals); this only flips the gate the poll loop
    /// already honors.
    pub fn set_awaiting_transaction(&self, awaiting: bool) {
        self.event_loop.set_awaiting_transaction(awaiting);
    }
}

/// The back-pressured, concurrency-safe reactive Kafka consumer runtime's
/// public entry point (`spec.md` §3).
///
/// Construct one per logical subscription. `receive()` can only be called
/// once — the underlying consumer thread, commit scheduler, and records
/// channel are all set up on first poll and torn down when the returned
/// stream is dropped or runs to completion.
pub struct KafkaReceiver {
    event_loop: Arc<EventLoopShared>,
}

impl KafkaReceiver {
    /// Builds a receiver backed by a real `rdkafka` consumer.
    pub fn connect(settings: ReceiverSettings) -> Result<Self, KafkaClientError> {
        let runtime = tokio::runtime::Handle::current();
        let group_id = settings.group_id.clone();
        let bootstrap_servers = settings.bootstrap_servers.clone();

        let event_loop = EventLoop::new(settings, runtime, move |listener| {
            // `RdKafkaClient::new` is fallible; a construction failure here
            // has no good synchronous recovery path inside the cyclic
            // closure, so it is reported by immediately closing the records
            // channel with a `Subscribe` error on first poll instead.
            match RdKafkaClient::new(&group_id, &bootstrap_servers, listener) {
                Ok(client) => Arc::new(client) as Arc<dyn KafkaClient>,
                Err(e) => Arc::new(FailedClient(e.to_string())) as Arc<dyn KafkaClient>,
            }
        });

        Ok(Self { event_loop: event_loop.shared })
    }

    #[cfg(test)]
    pub(crate) fn with_mock(
        settings: ReceiverSettings,
        runtime: tokio::runtime::Handle,
    ) -> (Self, Arc<crate::client::mock::MockKafkaClient>) {
        use std::sync::Mutex;

        let captured: Arc<Mutex<Option<Arc<crate::client::mock::MockKafkaClient>>>> =
            Arc::new(Mutex::new(None));
        let captured_for_factory = Arc::clone(&captured);

        let event_loop = EventLoop::new(settings, runtime, move |listener| {
            let mock = crate::client::mock::MockKafkaClient::new(listener);
            *captured_for_factory.lock().unwrap() = Some(Arc::clone(&mock));
            mock as Arc<dyn KafkaClient>
        });

        let mock = captured.lock().unwrap().take().expect("factory always runs synchronously");
        (Self { event_loop: event_loop.shared }, mock)
    }

    /// Returns a pause/resume handle for the partitions this receiver manages.
    pub fn partition_control(&self) -> PartitionControl {
        PartitionControl {
            event_loop: Arc::clone(&self.event_loop),
        }
    }

    /// Starts the subscription and returns the lazy stream of polled batches.
    /// Each item is a `Vec<ReceivedRecord>` in broker order; the stream ends
    /// with `Err` on a fatal error, or silently once the receiver is closed.
    pub fn receive(&self) -> impl Stream<Item = Result<Vec<ReceivedRecord>, ReceiverError>> + '_ {
        let event_loop = Arc::clone(&self.event_loop);
        let (mut records_rx, fatal_error_rx) = event_loop.take_records_rx_setup();
        event_loop.start();

        stream! {
            let _guard = ShutdownGuard { event_loop: Arc::clone(&event_loop) };
            tokio::pin!(fatal_error_rx);

            loop {
                tokio::select! {
                    biased;
                    fatal = &mut fatal_error_rx => {
                        if let Ok(err) = fatal {
                            yield Err(err);
                        }
                        return;
                    }
                    batch = records_rx.recv() => {
                        match batch {
                            Some(records) => {
                                let received = records
                                    .into_iter()
                                    .map(|record| to_received_record(&event_loop, record))
                                    .collect();
                                yield Ok(received);
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

fn to_received_record(event_loop: &Arc<EventLoopShared>, record: ConsumerRecord) -> ReceivedRecord {
    let offset = event_loop.make_offset(record.topic_partition, record.offset);
    ReceivedRecord {
        key: record.key,
        payload: record.payload,
        timestamp: record.timestamp,
        offset,
    }
}

/// Runs the shutdown sequence exactly once, whether the stream was dropped
/// (consumer cancelled) or ran to completion (fatal error/channel closed).
struct ShutdownGuard {
    event_loop: Arc<EventLoopShared>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.event_loop.request_shutdown();
    }
}

/// Stand-in [`KafkaClient`] used only when the real `rdkafka` consumer failed
/// to construct; every operation reports the original construction error so
/// the receiver's first `poll()` surfaces it through the normal fatal-error
/// path instead of panicking mid-`Arc::new_cyclic`.
struct FailedClient(String);

impl KafkaClient for FailedClient {
    fn subscribe(&self, _topics: &[String]) -> Result<(), KafkaClientError> {
        Err(KafkaClientError::Client(self.0.clone()))
    }
    fn poll(&self, _timeout: std::time::Duration) -> Result<Vec<ConsumerRecord>, KafkaClientError> {
        Err(KafkaClientError::Client(self.0.clone()))
    }
    fn pause(&self, _partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        Ok(())
    }
    fn resume(&self, _partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        Ok(())
    }
    fn assignment(&self) -> Result<Vec<TopicPartition>, KafkaClientError> {
        Ok(Vec::new())
    }
    fn paused(&self) -> Vec<TopicPartition> {
        Vec::new()
    }
    fn commit_async(
        &self,
        _offsets: &std::collections::HashMap<TopicPartition, crate::topic_partition::OffsetAndMetadata>,
        on_complete: Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>,
    ) -> Result<(), KafkaClientError> {
        on_complete(Err(KafkaClientError::Client(self.0.clone())));
        Ok(())
    }
    fn commit_sync(
        &self,
        _offsets: &std::collections::HashMap<TopicPartition, crate::topic_partition::OffsetAndMetadata>,
    ) -> Result<(), KafkaClientError> {
        Err(KafkaClientError::Client(self.0.clone()))
    }
    fn wakeup(&self) {}
    fn close(&self, _timeout: std::time::Duration) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::poll;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::settings::{AckMode, CommitStrategy};

    fn settings() -> ReceiverSettings {
        let mut settings =
            ReceiverSettings::new("test-group", vec!["localhost:9092".into()], vec!["orders".into()])
                .with_commit_strategy(CommitStrategy::BySize(1));
        settings.poll_timeout = Duration::from_millis(5);
        settings
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(tp: &TopicPartition, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic_partition: tp.clone(),
            offset,
            key: None,
            payload: Some(format!("payload-{offset}").into_bytes()),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn delivers_records_in_order_and_commits_on_acknowledge() {
        let tp = TopicPartition::new("orders", 0);
        let (receiver, mock) = KafkaReceiver::with_mock(settings(), tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);
        mock.push_records(vec![record(&tp, 0), record(&tp, 1)]);

        let stream = receiver.receive();
        tokio::pin!(stream);

        let batch = stream.next().await.expect("stream ended early").expect("fatal error");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset.offset(), 0);
        assert_eq!(batch[1].offset.offset(), 1);

        batch[1].offset.acknowledge();

        wait_until(|| !mock.commit_log().is_empty()).await;
        let committed = &mock.commit_log()[0];
        assert_eq!(committed.get(&tp).unwrap().offset, 2);
    }

    #[tokio::test]
    async fn commit_waits_for_broker_acknowledgement() {
        let tp = TopicPartition::new("orders", 0);
        let (receiver, mock) = KafkaReceiver::with_mock(settings(), tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);
        mock.push_records(vec![record(&tp, 0)]);

        let stream = receiver.receive();
        tokio::pin!(stream);
        let batch = stream.next().await.unwrap().unwrap();

        let commit_fut = batch[0].offset.commit();
        tokio::pin!(commit_fut);
        // `commit()` doesn't run its body until polled; drive it once up to
        // the point it registers a waiter and returns `Pending`.
        let _ = poll!(&mut commit_fut);

        wait_until(|| mock.pending_commit_count() == 1).await;
        assert!(mock.complete_next_commit(Ok(())));

        commit_fut.await.expect("commit should succeed");
    }

    #[tokio::test]
    async fn retryable_commit_failure_is_retried_until_success() {
        let tp = TopicPartition::new("orders", 0);
        let mut s = settings();
        s.commit_retry_interval = Duration::from_millis(10);
        let (receiver, mock) = KafkaReceiver::with_mock(s, tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);
        mock.push_records(vec![record(&tp, 0)]);

        let stream = receiver.receive();
        tokio::pin!(stream);
        let batch = stream.next().await.unwrap().unwrap();
        batch[0].offset.acknowledge();

        wait_until(|| mock.pending_commit_count() == 1).await;
        mock.complete_next_commit(Err(KafkaClientError::Client("broker unavailable".into())));

        wait_until(|| mock.pending_commit_count() == 1).await;
        assert!(mock.complete_next_commit(Ok(())));

        wait_until(|| mock.commit_log().len() >= 2).await;
    }

    #[tokio::test]
    async fn revoked_partition_resolves_pending_waiter_with_error() {
        let tp = TopicPartition::new("orders", 0);
        let (receiver, mock) = KafkaReceiver::with_mock(settings(), tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);
        mock.push_records(vec![record(&tp, 0)]);

        let stream = receiver.receive();
        tokio::pin!(stream);
        let batch = stream.next().await.unwrap().unwrap();

        let commit_fut = batch[0].offset.commit();
        tokio::pin!(commit_fut);
        let _ = poll!(&mut commit_fut);

        wait_until(|| mock.pending_commit_count() == 1).await;
        mock.fire_partitions_revoked(vec![tp.clone()]);

        let result = commit_fut.await;
        assert!(matches!(result, Err(CommitError::PartitionsRevoked(_))));
    }

    #[tokio::test]
    async fn partition_control_pauses_and_resumes_assignment() {
        let tp = TopicPartition::new("orders", 0);
        let (receiver, mock) = KafkaReceiver::with_mock(settings(), tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);

        let control = receiver.partition_control();
        control.pause(vec![tp.clone()]);
        wait_until(|| mock.paused_snapshot().contains(&tp)).await;

        control.resume(vec![tp.clone()]);
        wait_until(|| !mock.paused_snapshot().contains(&tp)).await;
    }

    #[tokio::test]
    async fn awaiting_transaction_pauses_and_resumes_assignment() {
        let tp = TopicPartition::new("orders", 0);
        let (receiver, mock) = KafkaReceiver::with_mock(settings(), tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);

        let stream = receiver.receive();
        tokio::pin!(stream);

        let control = receiver.partition_control();
        control.set_awaiting_transaction(true);
        wait_until(|| mock.paused_snapshot().contains(&tp)).await;

        control.set_awaiting_transaction(false);
        wait_until(|| !mock.paused_snapshot().contains(&tp)).await;
    }

    #[tokio::test]
    async fn at_most_once_commits_synchronously_before_delivery() {
        let tp = TopicPartition::new("orders", 0);
        let s = settings().with_ack_mode(AckMode::AtMostOnce);
        let (receiver, mock) = KafkaReceiver::with_mock(s, tokio::runtime::Handle::current());
        mock.set_assignment(vec![tp.clone()]);
        mock.push_records(vec![record(&tp, 0)]);

        let stream = receiver.receive();
        tokio::pin!(stream);
        let _batch = stream.next().await.unwrap().unwrap();

        wait_until(|| !mock.commit_sync_log().is_empty()).await;
    }
}
