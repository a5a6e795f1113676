use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::{ClientConfig, ClientContext, Message, Offset};

use super::KafkaClient;
use crate::error::KafkaClientError;
use crate::event_loop::RebalanceListener;
use crate::topic_partition::{ConsumerRecord, OffsetAndMetadata, TopicPartition};

type PendingCommitCallback = Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>;

/// `rdkafka`'s `ConsumerContext::commit_callback` fires on whatever thread is
/// currently inside `poll()` once the commit has actually round-tripped to
/// the broker. It carries no per-call token, so callbacks registered by
/// `commit_async` are matched to callback firings in FIFO order — commits are
/// acknowledged by the broker in the order they were issued, so this is safe.
struct EventLoopContext {
    pending_callbacks: Mutex<VecDeque<PendingCommitCallback>>,
    paused: Mutex<HashSet<TopicPartition>>,
    rebalance_listener: Arc<dyn RebalanceListener>,
}

impl ClientContext for EventLoopContext {}

impl ConsumerContext for EventLoopContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.rebalance_listener
                .on_partitions_revoked(tpl_to_partitions(tpl));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            self.rebalance_listener
                .on_partitions_assigned(tpl_to_partitions(tpl));
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        _offsets: &TopicPartitionList,
    ) {
        let callback = self.pending_callbacks.lock().unwrap().pop_front();
        if let Some(callback) = callback {
            callback(result.map_err(|e| KafkaClientError::Client(e.to_string())));
        } else {
            tracing::warn!("received commit callback with no registered waiter");
        }
    }
}

fn tpl_to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic().to_owned(), e.partition()))
        .collect()
}

fn partitions_to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for p in partitions {
        tpl.add_partition(&p.topic, p.partition);
    }
    tpl
}

fn offsets_to_tpl(offsets: &HashMap<TopicPartition, OffsetAndMetadata>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for (tp, oam) in offsets {
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(oam.offset))
            .expect("offset within i64 range is always a valid rdkafka::Offset");
    }
    tpl
}

/// Production [`KafkaClient`] backed by `rdkafka::consumer::BaseConsumer`.
///
/// `BaseConsumer` (not `StreamConsumer`) is used deliberately: the event loop
/// drives polling itself on its own dedicated thread, so it needs direct
/// control over `poll`/`pause`/`resume` rather than the `Stream` adapter the
/// teacher crate uses for its simpler "no commits, just relay" Kafka source.
pub struct RdKafkaClient {
    inner: BaseConsumer<EventLoopContext>,
    /// `rdkafka`'s `BaseConsumer` has no public wakeup primitive (unlike the
    /// Java client this spec is modeled on). Per `spec.md` §9's explicit
    /// fallback ("substitute an internal cancellation token ... retain the
    /// wakeup -> next poll returns empty contract"), a flag is checked at the
    /// top of every `poll()` before blocking; `close()` also sets it so a
    /// concurrent shutdown racing a poll still observes it.
    woken: Arc<AtomicBool>,
}

impl RdKafkaClient {
    pub fn new(
        group_id: &str,
        bootstrap_servers: &[String],
        rebalance_listener: Arc<dyn RebalanceListener>,
    ) -> Result<Self, KafkaClientError> {
        let context = EventLoopContext {
            pending_callbacks: Mutex::new(VecDeque::new()),
            paused: Mutex::new(HashSet::new()),
            rebalance_listener,
        };

        let inner: BaseConsumer<EventLoopContext> = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", bootstrap_servers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .create_with_context(context)
            .map_err(|e| KafkaClientError::Client(e.to_string()))?;

        Ok(Self {
            inner,
            woken: Arc::new(AtomicBool::new(false)),
        })
    }

    fn record_from_message(message: &BorrowedMessage<'_>) -> ConsumerRecord {
        ConsumerRecord {
            topic_partition: TopicPartition::new(message.topic().to_owned(), message.partition()),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()),
            timestamp: message.timestamp().to_millis(),
        }
    }
}

impl KafkaClient for RdKafkaClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaClientError> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.inner
            .subscribe(&topic_refs)
            .map_err(|e| KafkaClientError::Client(e.to_string()))
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<ConsumerRecord>, KafkaClientError> {
        if self.woken.swap(false, Ordering::AcqRel) {
            return Err(KafkaClientError::Wakeup);
        }

        match self.inner.poll(timeout) {
            Some(Ok(message)) => Ok(vec![Self::record_from_message(&message)]),
            Some(Err(KafkaError::Canceled)) => Err(KafkaClientError::Wakeup),
            Some(Err(e)) => Err(KafkaClientError::Client(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        self.inner
            .pause(&partitions_to_tpl(partitions))
            .map_err(|e| KafkaClientError::Client(e.to_string()))?;
        let mut paused = self.inner.context().paused.lock().unwrap();
        paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), KafkaClientError> {
        self.inner
            .resume(&partitions_to_tpl(partitions))
            .map_err(|e| KafkaClientError::Client(e.to_string()))?;
        let mut paused = self.inner.context().paused.lock().unwrap();
        for p in partitions {
            paused.remove(p);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, KafkaClientError> {
        self.inner
            .assignment()
            .map(|tpl| tpl_to_partitions(&tpl))
            .map_err(|e| KafkaClientError::Client(e.to_string()))
    }

    fn paused(&self) -> Vec<TopicPartition> {
        self.inner.context().paused.lock().unwrap().iter().cloned().collect()
    }

    fn commit_async(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        on_complete: Box<dyn FnOnce(Result<(), KafkaClientError>) + Send>,
    ) -> Result<(), KafkaClientError> {
        // Only register the callback once `commit()` itself has actually
        // accepted the request — if it returns `Err` synchronously (no
        // callback will ever fire for it), registering first would leave an
        // orphaned callback in the FIFO queue that a *later* commit's
        // `commit_callback` would wrongly pop and resolve.
        self.inner
            .commit(&offsets_to_tpl(offsets), rdkafka::consumer::CommitMode::Async)
            .map_err(|e| KafkaClientError::Client(e.to_string()))?;
        self.inner.context().pending_callbacks.lock().unwrap().push_back(on_complete);
        Ok(())
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaClientError> {
        self.inner
            .commit(&offsets_to_tpl(offsets), rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| KafkaClientError::Client(e.to_string()))
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::Release);
    }

    fn close(&self, timeout: Duration) {
        let _ = timeout;
        self.woken.store(true, Ordering::Release);
        self.inner.unsubscribe();
    }
}
