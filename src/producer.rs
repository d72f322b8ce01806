//! Buffered, batching producer with delivery reports.
//!
//! [`Producer::produce`] only serializes the value and appends it to a
//! client-side buffer. Two background tasks do the rest:
//!
//! - **flush** (every `buffering_interval`): drains the buffer, picks a
//!   partition per record, groups records per partition in send order,
//!   compresses each group into a [`RecordBatch`] and sends it, retrying
//!   transient broker errors.
//! - **poll** (every `poll_interval`): hands queued delivery reports to the
//!   listener. Reports stay queued until the producer is polled.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use logbridge::config::ProducerConfig;
//! use logbridge::producer::Producer;
//! use serde_json::json;
//!
//! # async fn run() -> logbridge::Result<()> {
//! let producer = Producer::create(ProducerConfig::from_env()?).await?;
//! let mut reports = producer.listen().expect("first listener");
//!
//! producer.produce("contributions", Some("tx1"), &json!({"txHash": "tx1", "amount": 5}))?;
//!
//! if let Some(Ok(report)) = reports.next().await {
//!     println!("written at {}-{}@{}", report.topic, report.partition, report.offset);
//! }
//! producer.close().await
//! # }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Cluster;
use crate::config::ProducerConfig;
use crate::connection::{BrokerConnection, Link};
use crate::constants::DELIVERY_REPORT_CHANNEL_CAPACITY;
use crate::error::{Error, Result};
use crate::message::{BatchRecord, ProducerRecord, RecordBatch};
use crate::metrics;
use crate::partitioner::Partitioner;
use crate::retry;
use crate::stream::{self, EventSender, EventStream, Subscription};
use crate::tasks::BackgroundTaskRegistry;
use crate::types::{Offset, PartitionIndex};

/// Receipt for a durably written record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: PartitionIndex,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub timestamp: i64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Short label for the delivery failure metric.
fn reason_label(error: &Error) -> String {
    match error {
        Error::Broker(code) => format!("{:?}", code),
        Error::Connection(_) => "connection".to_string(),
        Error::Serialization(_) => "serialization".to_string(),
        _ => "other".to_string(),
    }
}

/// State shared between the producer handle and its tasks.
struct ProducerShared {
    config: ProducerConfig,
    link: Link,
    buffer: Mutex<VecDeque<ProducerRecord>>,
    reports: Mutex<VecDeque<Result<DeliveryReport>>>,
    listener: Mutex<Option<EventSender<DeliveryReport>>>,
    subscription: Subscription,
    partitioner: Partitioner,
    partition_counts: DashMap<String, i32>,
    /// Serializes flushes so batches for a partition go out in order.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ProducerShared {
    fn enqueue(&self, record: ProducerRecord) -> Result<()> {
        if let Some(reason) = self.link.disconnect_reason() {
            return Err(Error::Connection(reason));
        }

        let mut buffer = lock(&self.buffer);
        if buffer.len() >= self.config.queue_buffering_max_messages {
            drop(buffer);
            warn!(topic = %record.topic, "Producer queue full, dropping record");
            self.fail(&record.topic, record.key.clone(), "queue full".to_string(), "queue_full");
            return Ok(());
        }
        buffer.push_back(record);
        metrics::PRODUCER_QUEUE_DEPTH.set(buffer.len() as i64);
        Ok(())
    }

    fn queued(&self) -> usize {
        lock(&self.buffer).len()
    }

    fn fail(&self, topic: &str, key: Option<Bytes>, reason: String, label: &str) {
        metrics::record_delivery_failure(topic, label);
        lock(&self.reports).push_back(Err(Error::Delivery {
            topic: topic.to_string(),
            key,
            reason,
        }));
    }

    fn fail_all(&self, topic: &str, records: Vec<ProducerRecord>, error: &Error) {
        warn!(topic, count = records.len(), error = %error, "Delivery failed");
        let label = reason_label(error);
        for record in records {
            self.fail(topic, record.key, error.to_string(), &label);
        }
    }

    async fn resolve_partition(&self, record: &ProducerRecord) -> Result<PartitionIndex> {
        if record.partition.is_valid() {
            return Ok(record.partition);
        }

        let cached = self.partition_counts.get(&record.topic).map(|c| *c);
        let count = match cached {
            Some(count) => count,
            None => {
                let count = self
                    .link
                    .observe(self.link.cluster().partition_count(&record.topic).await)?;
                self.partition_counts.insert(record.topic.clone(), count);
                count
            }
        };
        Ok(self.partitioner.partition(record.key.as_deref(), count))
    }

    /// Drain the buffer and send everything in it. Returns the number of
    /// records taken from the buffer.
    async fn flush_once(&self) -> usize {
        let _flushing = self.flush_lock.lock().await;

        let records: Vec<ProducerRecord> = {
            let mut buffer = lock(&self.buffer);
            let drained = buffer.drain(..).collect();
            metrics::PRODUCER_QUEUE_DEPTH.set(0);
            drained
        };
        if records.is_empty() {
            return 0;
        }
        let taken = records.len();

        let mut batches: BTreeMap<(String, PartitionIndex), Vec<ProducerRecord>> = BTreeMap::new();
        for record in records {
            match self.resolve_partition(&record).await {
                Ok(partition) => batches
                    .entry((record.topic.clone(), partition))
                    .or_default()
                    .push(record),
                Err(e) => {
                    let topic = record.topic.clone();
                    self.fail_all(&topic, vec![record], &e);
                }
            }
        }

        for ((topic, partition), records) in batches {
            self.send_batch(&topic, partition, records).await;
        }

        debug!(records = taken, "Flushed producer buffer");
        taken
    }

    async fn send_batch(&self, topic: &str, partition: PartitionIndex, records: Vec<ProducerRecord>) {
        if let Some(reason) = self.link.disconnect_reason() {
            self.fail_all(topic, records, &Error::Connection(reason));
            return;
        }

        let batch_records: Vec<BatchRecord> =
            records.iter().map(ProducerRecord::to_batch_record).collect();
        let batch = match RecordBatch::encode(&batch_records, self.config.client.compression) {
            Ok(batch) => batch,
            Err(e) => {
                self.fail_all(topic, records, &e);
                return;
            }
        };

        let cluster: Arc<dyn Cluster> = self.link.cluster().clone();
        let attempts = AtomicUsize::new(0);
        let result = retry::with_policy(
            retry::delivery_policy(self.config.client.retries),
            "produce",
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                let cluster = cluster.clone();
                let batch = batch.clone();
                let topic = topic.to_string();
                async move { cluster.produce(&topic, partition, batch).await }
            },
        )
        .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        if retries > 0 {
            metrics::PRODUCE_RETRIES
                .with_label_values(&[topic])
                .inc_by(retries as u64);
        }

        match self.link.observe(result) {
            Ok(base) => {
                let count = records.len();
                metrics::PRODUCE_BATCH_SIZE
                    .with_label_values(&[topic])
                    .observe(count as f64);
                metrics::RECORDS_PRODUCED
                    .with_label_values(&[topic])
                    .inc_by(count as u64);

                let mut reports = lock(&self.reports);
                for (i, record) in records.into_iter().enumerate() {
                    reports.push_back(Ok(DeliveryReport {
                        topic: topic.to_string(),
                        partition,
                        offset: Offset(base.value() + i as i64),
                        key: record.key,
                        timestamp: record.timestamp,
                    }));
                }
                debug!(topic, partition = %partition, base_offset = %base, count, "Batch delivered");
            }
            Err(e) => self.fail_all(topic, records, &e),
        }
    }

    /// Forward queued reports to the listener, if any. Returns how many
    /// reports were taken off the queue.
    ///
    /// Never waits: reports that do not fit in the listener's stream stay
    /// queued for the next poll.
    fn poll(&self) -> usize {
        let sender = lock(&self.listener).clone();
        let mut reports = lock(&self.reports);
        let Some(sender) = sender else {
            let count = reports.len();
            reports.clear();
            return count;
        };

        let mut taken = 0;
        while let Some(report) = reports.pop_front() {
            match sender.try_send(report) {
                Ok(()) => taken += 1,
                Err(_) if sender.is_closed() => {
                    debug!("Delivery listener dropped");
                    taken += reports.len() + 1;
                    reports.clear();
                    break;
                }
                Err(report) => {
                    reports.push_front(report);
                    break;
                }
            }
        }
        drop(reports);

        {
            let mut listener = lock(&self.listener);
            if listener.as_ref().is_some_and(|s| s.is_closed()) {
                *listener = None;
            }
        }

        if let Some(reason) = self.link.disconnect_reason() {
            self.terminate_listener(reason);
        }
        taken
    }

    fn terminate_listener(&self, reason: String) {
        let sender = lock(&self.listener).take();
        if let Some(sender) = sender {
            sender.fail(Error::Connection(reason));
            debug!("Delivery listener terminated");
        }
    }
}

/// Publishes records to topics.
///
/// Owns one [`BrokerConnection`]. Dropping the producer without
/// [`close`](Self::close) stops its tasks and loses buffered records.
pub struct Producer {
    shared: Arc<ProducerShared>,
    connection: BrokerConnection,
    tasks: BackgroundTaskRegistry,
}

impl Producer {
    /// Connect to `config.client.brokers` and start the background tasks.
    pub async fn create(config: ProducerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        let connection = BrokerConnection::connect(&config.client).await?;
        Ok(Self::start(config, connection))
    }

    /// Like [`create`](Self::create), over an existing transport.
    pub async fn with_cluster(config: ProducerConfig, cluster: Arc<dyn Cluster>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        let connection = BrokerConnection::with_cluster(&config.client, cluster).await?;
        Ok(Self::start(config, connection))
    }

    fn start(config: ProducerConfig, connection: BrokerConnection) -> Self {
        let buffering_interval = config.client.buffering_interval;
        let poll_interval = config.poll_interval;

        let shared = Arc::new(ProducerShared {
            config,
            link: connection.link(),
            buffer: Mutex::new(VecDeque::new()),
            reports: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
            subscription: Subscription::new(),
            partitioner: Partitioner::new(),
            partition_counts: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        });

        let mut tasks = BackgroundTaskRegistry::new();

        let flusher = shared.clone();
        tasks.spawn_periodic("producer-flush", buffering_interval, move |_| {
            let shared = flusher.clone();
            async move {
                shared.flush_once().await;
            }
        });

        let poller = shared.clone();
        tasks.spawn_periodic("producer-poll", poll_interval, move |_| {
            let shared = poller.clone();
            async move {
                shared.poll();
            }
        });

        info!(client_id = %connection.client_id(), "Producer ready");

        Self {
            shared,
            connection,
            tasks,
        }
    }

    /// Serialize `value` as JSON and buffer it for `topic`.
    ///
    /// Never waits on the network. Fails with [`Error::Serialization`] if
    /// `value` cannot be encoded, in which case nothing is buffered and no
    /// delivery report will follow.
    pub fn produce<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<()> {
        let record = ProducerRecord::json(topic, key, value)?;
        self.shared.enqueue(record)
    }

    /// Buffer a prepared record.
    pub fn produce_record(&self, record: ProducerRecord) -> Result<()> {
        self.shared.enqueue(record)
    }

    /// Deliver queued reports to the listener now.
    pub async fn poll(&self) -> usize {
        self.shared.poll()
    }

    /// Send everything buffered, waiting at most `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            while self.shared.flush_once().await > 0 {}
        })
        .await
        .map_err(|_| Error::Connection(format!("flush timed out after {:?}", timeout)))
    }

    /// Subscribe to delivery reports.
    ///
    /// Returns `None` while another listener is alive. The stream ends with an
    /// [`Error::Connection`] once the connection is lost or closed.
    pub fn listen(&self) -> Option<EventStream<DeliveryReport>> {
        if !self.shared.subscription.try_acquire() {
            debug!("Producer already has a listener");
            return None;
        }
        let (tx, rx) = stream::channel(DELIVERY_REPORT_CHANNEL_CAPACITY);
        *lock(&self.shared.listener) = Some(tx);
        Some(rx.with_subscription(self.shared.subscription.clone()))
    }

    /// Records buffered and not yet sent.
    pub fn queued(&self) -> usize {
        self.shared.queued()
    }

    /// Reports waiting for the next poll.
    pub fn pending_reports(&self) -> usize {
        lock(&self.shared.reports).len()
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Flush, stop the tasks, close the connection and hand the last reports
    /// to the listener. Never waits on the listener: reports that do not fit
    /// in its stream are dropped.
    pub async fn close(mut self) -> Result<()> {
        let flushed = self.flush(self.shared.config.client.connect_timeout).await;
        if let Err(e) = &flushed {
            warn!(error = %e, "Flush on close failed");
        }
        self.tasks.shutdown_all().await;
        self.connection.close().await;
        self.shared.poll();
        info!("Producer closed");
        flushed
    }
}
