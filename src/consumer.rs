//! Group consumer with manual commits.
//!
//! A [`Consumer`] joins a consumer group, owns whatever partitions the group
//! assigns it, and runs two background tasks:
//!
//! - **poll loop** (every `poll_interval`): while a listener is attached,
//!   fetches at most `batch_size` records across the owned partitions and
//!   pushes them into the listener's bounded stream. Without a listener the
//!   cycle is skipped and records stay in the broker.
//! - **group heartbeat** (every `group_heartbeat_interval`): keeps the
//!   membership alive and, when the coordinator reports a rebalance, revokes
//!   the current partitions, rejoins and takes the new assignment.
//!
//! Offsets are never committed automatically. After processing a record the
//! caller invokes [`Consumer::commit`], which stores `offset + 1` as the
//! group's position for that partition.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use logbridge::config::ConsumerConfig;
//! use logbridge::consumer::Consumer;
//!
//! # async fn run() -> logbridge::Result<()> {
//! let consumer = Consumer::create(ConsumerConfig::from_env()?, "contributions", "worker-1").await?;
//! let mut records = consumer.listen("contributions", |_| false).await;
//!
//! while let Some(Ok(record)) = records.next().await {
//!     let payload: serde_json::Value = record.json()?;
//!     // apply side effects, then
//!     consumer.commit(&record).await;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::broker::{Cluster, JoinGroupRequest};
use crate::config::{ConsumerConfig, OffsetReset};
use crate::connection::{BrokerConnection, Link};
use crate::constants::GROUP_JOIN_ATTEMPTS;
use crate::error::{BrokerCode, Error, Result};
use crate::message::Message;
use crate::metrics;
use crate::rebalance::{AssignmentTarget, ConsumerGroupMembership, RebalanceCoordinator};
use crate::stream::{self, EventSender, EventStream};
use crate::tasks::BackgroundTaskRegistry;
use crate::types::{GenerationId, Offset, TopicPartition};

/// Predicate run after each forwarded record; `true` completes the stream.
pub type FinishCheck = Box<dyn FnMut(&Message) -> bool + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fetch positions for the owned partitions.
///
/// A position of `None` is resolved on the next poll from the committed
/// offset or the reset policy. Every assign or revoke bumps the epoch so a
/// poll cycle that straddles a rebalance does not write stale positions.
struct Assignment {
    link: Link,
    positions: Mutex<BTreeMap<TopicPartition, Option<Offset>>>,
    epoch: AtomicU64,
}

impl Assignment {
    fn snapshot(&self) -> (u64, Vec<(TopicPartition, Option<Offset>)>) {
        let positions = lock(&self.positions);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let owned = positions.iter().map(|(tp, p)| (tp.clone(), *p)).collect();
        (epoch, owned)
    }

    fn advance(&self, tp: &TopicPartition, offset: Offset, epoch: u64) {
        let mut positions = lock(&self.positions);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if let Some(position) = positions.get_mut(tp) {
            *position = Some(offset);
        }
    }

    /// Move a position back so undelivered records are fetched again.
    fn rewind(&self, tp: &TopicPartition, offset: Offset) {
        let mut positions = lock(&self.positions);
        if let Some(Some(position)) = positions.get_mut(tp) {
            if offset < *position {
                *position = offset;
            }
        }
    }
}

#[async_trait]
impl AssignmentTarget for Assignment {
    async fn assign(&self, partitions: &[TopicPartition]) -> Result<()> {
        {
            let mut positions = lock(&self.positions);
            *positions = partitions.iter().map(|tp| (tp.clone(), None)).collect();
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        match self.link.disconnect_reason() {
            Some(reason) => Err(Error::Connection(reason)),
            None => Ok(()),
        }
    }

    async fn unassign(&self) -> Result<()> {
        lock(&self.positions).clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Group membership of this consumer.
struct GroupSession {
    topic: String,
    member_id: String,
    generation: GenerationId,
}

/// The attached listener.
struct ListenerSlot {
    sender: EventSender<Message>,
    check_if_finished: Mutex<FinishCheck>,
    retired: AtomicBool,
    retire_notify: Notify,
}

impl ListenerSlot {
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.retire_notify.notify_one();
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

struct ConsumerShared {
    config: ConsumerConfig,
    client_id: String,
    link: Link,
    coordinator: RebalanceCoordinator,
    assignment: Assignment,
    group: tokio::sync::Mutex<GroupSession>,
    listener: Mutex<Option<Arc<ListenerSlot>>>,
    /// Highest offset handed to the application, per partition.
    delivered: Mutex<HashMap<TopicPartition, Offset>>,
    /// Rotates the first partition fetched each cycle.
    cursor: AtomicUsize,
    /// One poll cycle at a time.
    poll_lock: tokio::sync::Mutex<()>,
}

impl ConsumerShared {
    fn cluster(&self) -> &Arc<dyn Cluster> {
        self.link.cluster()
    }

    fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Make sure `topic` exists so the group has partitions to assign.
    async fn ensure_topic(&self, topic: &str) -> Result<i32> {
        self.link.observe(self.cluster().partition_count(topic).await)
    }

    /// Join (or rejoin) the group and take this member's assignment.
    async fn join_and_sync(&self, session: &mut GroupSession) -> Result<()> {
        for attempt in 0..GROUP_JOIN_ATTEMPTS {
            let joined = self.link.observe(
                self.cluster()
                    .join_group(JoinGroupRequest {
                        group_id: self.config.group_id.clone(),
                        member_id: session.member_id.clone(),
                        client_id: self.client_id.clone(),
                        topics: vec![session.topic.clone()],
                        session_timeout_ms: self.config.session_timeout.as_millis() as u64,
                    })
                    .await,
            )?;
            session.member_id = joined.member_id;
            session.generation = joined.generation;

            let synced = self.link.observe(
                self.cluster()
                    .sync_group(&self.config.group_id, &session.member_id, session.generation)
                    .await,
            );

            match synced {
                Ok(partitions) => {
                    info!(
                        group = %self.config.group_id,
                        member_id = %session.member_id,
                        generation = %session.generation,
                        partitions = partitions.len(),
                        "Joined consumer group"
                    );
                    self.coordinator
                        .on_rebalance(
                            &self.assignment,
                            BrokerCode::AssignPartitions.as_i32(),
                            &partitions,
                        )
                        .await;
                    return Ok(());
                }
                Err(Error::Broker(BrokerCode::IllegalGeneration | BrokerCode::RebalanceInProgress)) => {
                    debug!(attempt, group = %self.config.group_id, "Group moved on during sync, rejoining");
                }
                Err(Error::Broker(BrokerCode::UnknownMemberId)) => {
                    debug!(attempt, group = %self.config.group_id, "Membership lost during sync, rejoining");
                    session.member_id.clear();
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Broker(BrokerCode::RebalanceInProgress))
    }

    async fn revoke(&self) {
        self.coordinator
            .on_rebalance(&self.assignment, BrokerCode::RevokePartitions.as_i32(), &[])
            .await;
    }

    /// One heartbeat; runs the rebalance sequence when the coordinator asks.
    async fn group_heartbeat(&self) {
        if !self.link.is_connected() {
            return;
        }

        let mut session = self.group.lock().await;
        if session.member_id.is_empty() {
            if let Err(e) = self.join_and_sync(&mut session).await {
                warn!(group = %self.config.group_id, error = %e, "Rejoin failed");
            }
            return;
        }

        let result = self.link.observe(
            self.cluster()
                .heartbeat(&self.config.group_id, &session.member_id, session.generation)
                .await,
        );

        match result {
            Ok(()) => {}
            Err(Error::Broker(
                code @ (BrokerCode::RebalanceInProgress
                | BrokerCode::IllegalGeneration
                | BrokerCode::UnknownMemberId),
            )) => {
                info!(group = %self.config.group_id, ?code, "Group rebalance required");
                self.revoke().await;
                if code == BrokerCode::UnknownMemberId {
                    session.member_id.clear();
                }
                if let Err(e) = self.join_and_sync(&mut session).await {
                    warn!(group = %self.config.group_id, error = %e, "Rejoin failed");
                }
            }
            Err(e) => warn!(group = %self.config.group_id, error = %e, "Group heartbeat failed"),
        }
    }

    /// Leave the group, revoke, and join again subscribed to `topic`.
    async fn resubscribe(&self, topic: &str) {
        let mut session = self.group.lock().await;
        info!(group = %self.config.group_id, from = %session.topic, to = %topic, "Resubscribing");

        if !session.member_id.is_empty() {
            if let Err(e) = self.link.observe(
                self.cluster()
                    .leave_group(&self.config.group_id, &session.member_id)
                    .await,
            ) {
                debug!(error = %e, "Leave before resubscribe failed");
            }
        }
        self.revoke().await;

        session.member_id.clear();
        session.generation = GenerationId::INVALID;
        session.topic = topic.to_string();

        if let Err(e) = self.ensure_topic(topic).await {
            warn!(topic, error = %e, "Topic lookup failed during resubscribe");
        }
        if let Err(e) = self.join_and_sync(&mut session).await {
            warn!(group = %self.config.group_id, error = %e, "Resubscribe failed");
        }
    }

    async fn start_position(&self, tp: &TopicPartition) -> Result<Offset> {
        let committed = self
            .link
            .observe(self.cluster().committed_offset(&self.config.group_id, tp).await)?;
        if let Some(offset) = committed {
            return Ok(offset);
        }
        self.reset_position(tp).await
    }

    async fn reset_position(&self, tp: &TopicPartition) -> Result<Offset> {
        let (earliest, latest) = self
            .link
            .observe(self.cluster().list_offsets(&tp.topic, tp.partition).await)?;
        Ok(match self.config.offset_reset {
            OffsetReset::Earliest => earliest,
            OffsetReset::Latest => latest,
        })
    }

    /// Fetch up to `batch_size` records across the owned partitions.
    ///
    /// Broker errors on a partition are logged and the cycle moves on;
    /// a connection error ends the cycle.
    async fn poll_cycle(&self) -> Result<Vec<Message>> {
        if let Some(reason) = self.link.disconnect_reason() {
            return Err(Error::Connection(reason));
        }

        let (epoch, owned) = self.assignment.snapshot();
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let count = owned.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut records = Vec::new();

        for i in 0..count {
            let remaining = self.config.batch_size.saturating_sub(records.len());
            if remaining == 0 {
                break;
            }
            if let Some(reason) = self.link.disconnect_reason() {
                return Err(Error::Connection(reason));
            }
            let (tp, position) = &owned[(start + i) % count];

            let position = match position {
                Some(position) => *position,
                None => match self.start_position(tp).await {
                    Ok(position) => position,
                    Err(e) if e.is_connection() => return Err(e),
                    Err(e) => {
                        self.poll_error(tp, &e);
                        continue;
                    }
                },
            };

            let fetched = self.link.observe(
                self.cluster()
                    .fetch(&tp.topic, tp.partition, position, remaining)
                    .await,
            );
            match fetched {
                Ok(messages) => {
                    let next = messages.last().map_or(position, |m| m.offset.next());
                    self.assignment.advance(tp, next, epoch);
                    records.extend(messages);
                }
                Err(Error::Broker(BrokerCode::OffsetOutOfRange)) => {
                    warn!(partition = %tp, offset = %position, "Offset out of range, resetting");
                    match self.reset_position(tp).await {
                        Ok(reset) => self.assignment.advance(tp, reset, epoch),
                        Err(e) if e.is_connection() => return Err(e),
                        Err(e) => self.poll_error(tp, &e),
                    }
                }
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => self.poll_error(tp, &e),
            }
        }

        metrics::POLL_BATCH_SIZE
            .with_label_values(&[self.group_id()])
            .observe(records.len() as f64);
        Ok(records)
    }

    fn poll_error(&self, tp: &TopicPartition, error: &Error) {
        metrics::POLL_ERRORS.with_label_values(&[self.group_id()]).inc();
        warn!(group = %self.config.group_id, partition = %tp, error = %error, "Poll error");
    }

    fn mark_delivered(&self, message: &Message) {
        let mut delivered = lock(&self.delivered);
        let highest = delivered
            .entry(message.topic_partition())
            .or_insert(message.offset);
        if message.offset > *highest {
            *highest = message.offset;
        }
        metrics::RECORDS_CONSUMED
            .with_label_values(&[self.group_id(), message.topic.as_str()])
            .inc();
    }

    fn was_delivered(&self, message: &Message) -> bool {
        lock(&self.delivered)
            .get(&message.topic_partition())
            .is_some_and(|highest| message.offset <= *highest)
    }

    fn current_listener(&self) -> Option<Arc<ListenerSlot>> {
        lock(&self.listener).clone()
    }

    fn detach(&self, slot: &Arc<ListenerSlot>) {
        slot.retire();
        let mut listener = lock(&self.listener);
        if listener.as_ref().is_some_and(|current| Arc::ptr_eq(current, slot)) {
            *listener = None;
        }
    }

    /// End the listener's stream with a connection error. Never waits on
    /// a full stream.
    fn terminate_listener(&self, slot: &Arc<ListenerSlot>, reason: String) {
        self.detach(slot);
        slot.sender.fail(Error::Connection(reason));
        debug!(group = %self.config.group_id, "Listener terminated");
    }

    /// One tick of the poll loop.
    async fn poll_tick(&self) {
        let Some(slot) = self.current_listener() else {
            return;
        };
        if let Some(reason) = self.link.disconnect_reason() {
            self.terminate_listener(&slot, reason);
            return;
        }

        let _polling = self.poll_lock.lock().await;
        if slot.is_retired() {
            return;
        }

        match self.poll_cycle().await {
            Ok(messages) => self.forward(&slot, messages).await,
            Err(e) => match self.link.disconnect_reason() {
                Some(reason) => self.terminate_listener(&slot, reason),
                None => warn!(group = %self.config.group_id, error = %e, "Poll cycle failed"),
            },
        }
    }

    /// Push `messages` into the listener, waiting for room. Records that
    /// could not be handed over are fetched again on the next cycle.
    async fn forward(&self, slot: &Arc<ListenerSlot>, messages: Vec<Message>) {
        let mut pending = messages.into_iter();

        while let Some(message) = pending.next() {
            let sent = if slot.is_retired() {
                false
            } else {
                tokio::select! {
                    sent = slot.sender.data(message.clone()) => sent,
                    _ = slot.retire_notify.notified() => false,
                }
            };

            if !sent {
                if slot.sender.is_closed() {
                    debug!(group = %self.config.group_id, "Listener dropped");
                    self.detach(slot);
                }
                self.rewind(std::iter::once(message).chain(pending));
                return;
            }

            let finished = {
                let mut check = lock(&slot.check_if_finished);
                (*check)(&message)
            };
            if finished {
                info!(group = %self.config.group_id, offset = %message.offset, "Listener finished");
                self.detach(slot);
                slot.sender.finish();
                self.rewind(pending);
                return;
            }
        }
    }

    fn rewind(&self, messages: impl Iterator<Item = Message>) {
        let mut earliest: BTreeMap<TopicPartition, Offset> = BTreeMap::new();
        for message in messages {
            earliest
                .entry(message.topic_partition())
                .and_modify(|o| *o = (*o).min(message.offset))
                .or_insert(message.offset);
        }
        for (tp, offset) in earliest {
            self.assignment.rewind(&tp, offset);
        }
    }

    async fn commit(&self, message: &Message) -> Result<()> {
        let tp = message.topic_partition();

        if !self.was_delivered(message) {
            metrics::record_commit(self.group_id(), "refused");
            return Err(Error::Commit(format!(
                "offset {} of {} was never delivered by this consumer",
                message.offset, tp
            )));
        }

        let (member_id, generation) = {
            let session = self.group.lock().await;
            (session.member_id.clone(), session.generation)
        };

        let next = message.offset.next();
        let result = self.link.observe(
            self.cluster()
                .commit_offset(&self.config.group_id, &member_id, generation, &tp, next)
                .await,
        );

        match result {
            Ok(()) => {
                metrics::record_commit(self.group_id(), "success");
                debug!(partition = %tp, offset = %next, "Committed offset");
                Ok(())
            }
            Err(e) => {
                metrics::record_commit(self.group_id(), "error");
                Err(Error::Commit(format!("commit {} at {} failed: {}", tp, next, e)))
            }
        }
    }
}

/// A consumer group member with manual offset commits.
///
/// Owns one [`BrokerConnection`]. Dropping the consumer without
/// [`close`](Self::close) stops its tasks without leaving the group; the
/// coordinator expires the membership after `session_timeout`.
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    connection: BrokerConnection,
    tasks: BackgroundTaskRegistry,
}

impl Consumer {
    /// Connect, join `config.group_id` subscribed to `topic`, and wait for
    /// the first assignment.
    pub async fn create(mut config: ConsumerConfig, topic: &str, client_id: &str) -> Result<Self> {
        config.client.client_id = client_id.to_string();
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        let connection = BrokerConnection::connect(&config.client).await?;
        Self::start(config, topic, client_id, connection).await
    }

    /// Like [`create`](Self::create), over an existing transport.
    pub async fn with_cluster(
        mut config: ConsumerConfig,
        topic: &str,
        client_id: &str,
        cluster: Arc<dyn Cluster>,
    ) -> Result<Self> {
        config.client.client_id = client_id.to_string();
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        let connection = BrokerConnection::with_cluster(&config.client, cluster).await?;
        Self::start(config, topic, client_id, connection).await
    }

    async fn start(
        config: ConsumerConfig,
        topic: &str,
        client_id: &str,
        connection: BrokerConnection,
    ) -> Result<Self> {
        let link = connection.link();
        let poll_interval = config.poll_interval;
        let heartbeat_interval = config.group_heartbeat_interval;

        let shared = Arc::new(ConsumerShared {
            coordinator: RebalanceCoordinator::new(config.group_id.clone()),
            assignment: Assignment {
                link: link.clone(),
                positions: Mutex::new(BTreeMap::new()),
                epoch: AtomicU64::new(0),
            },
            group: tokio::sync::Mutex::new(GroupSession {
                topic: topic.to_string(),
                member_id: String::new(),
                generation: GenerationId::INVALID,
            }),
            listener: Mutex::new(None),
            delivered: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            poll_lock: tokio::sync::Mutex::new(()),
            client_id: client_id.to_string(),
            config,
            link,
        });

        shared.ensure_topic(topic).await?;
        {
            let mut session = shared.group.lock().await;
            shared.join_and_sync(&mut session).await?;
        }

        let mut tasks = BackgroundTaskRegistry::new();

        let poller = shared.clone();
        tasks.spawn_periodic("consumer-poll", poll_interval, move |_| {
            let shared = poller.clone();
            async move { shared.poll_tick().await }
        });

        let heartbeat = shared.clone();
        tasks.spawn_periodic("consumer-group-heartbeat", heartbeat_interval, move |_| {
            let shared = heartbeat.clone();
            async move { shared.group_heartbeat().await }
        });

        info!(
            group = %shared.config.group_id,
            topic,
            client_id,
            "Consumer ready"
        );

        Ok(Self {
            shared,
            connection,
            tasks,
        })
    }

    /// Run one poll cycle now and return its records.
    ///
    /// The records count as delivered, so they may be committed.
    pub async fn poll_batch(&self) -> Result<Vec<Message>> {
        let _polling = self.shared.poll_lock.lock().await;
        let records = self.shared.poll_cycle().await?;
        for record in &records {
            self.shared.mark_delivered(record);
        }
        Ok(records)
    }

    /// Stream records from `topic`.
    ///
    /// Only one listener is attached at a time. Calling `listen` again ends
    /// the previous stream at once, dropping whatever it still buffers, then
    /// leaves and rejoins the group (resetting the assignment) and attaches
    /// the new one. The stream ends with an
    /// [`Error::Connection`] once the connection is lost, or normally when
    /// `check_if_finished` returns `true` for a record.
    pub async fn listen<F>(&self, topic: &str, check_if_finished: F) -> EventStream<Message>
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        let (tx, rx) = stream::channel(self.shared.config.batch_size);
        // A record counts as delivered once the caller has taken it.
        let tracker = Arc::downgrade(&self.shared);
        let rx = rx.with_data_hook(move |message: &Message| {
            if let Some(shared) = tracker.upgrade() {
                shared.mark_delivered(message);
            }
        });
        let slot = Arc::new(ListenerSlot {
            sender: tx,
            check_if_finished: Mutex::new(Box::new(check_if_finished)),
            retired: AtomicBool::new(false),
            retire_notify: Notify::new(),
        });

        // The old stream ends at once; records still buffered in it were
        // never taken and are fetched again after the rejoin.
        let previous = lock(&self.shared.listener).take();
        if let Some(previous) = &previous {
            previous.retire();
            previous.sender.cancel();
        }

        let _polling = self.shared.poll_lock.lock().await;
        let topic_changed = self.shared.group.lock().await.topic != topic;
        if previous.is_some() || topic_changed {
            self.shared.resubscribe(topic).await;
        }
        *lock(&self.shared.listener) = Some(slot);

        debug!(group = %self.shared.config.group_id, topic, "Listener attached");
        rx
    }

    /// Commit `message` as processed, logging any failure.
    ///
    /// Call only after the record's side effects are durable.
    pub async fn commit(&self, message: &Message) {
        if let Err(e) = self.shared.commit(message).await {
            warn!(group = %self.shared.config.group_id, error = %e, "Commit failed");
        }
    }

    /// Like [`commit`](Self::commit), returning the outcome.
    pub async fn try_commit(&self, message: &Message) -> Result<()> {
        self.shared.commit(message).await
    }

    /// Partitions currently owned by this consumer.
    pub async fn membership(&self) -> ConsumerGroupMembership {
        self.shared.coordinator.membership().await
    }

    pub async fn member_id(&self) -> String {
        self.shared.group.lock().await.member_id.clone()
    }

    pub async fn generation(&self) -> GenerationId {
        self.shared.group.lock().await.generation
    }

    pub async fn subscription(&self) -> String {
        self.shared.group.lock().await.topic.clone()
    }

    pub fn group_id(&self) -> &str {
        self.shared.group_id()
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Leave the group, stop the tasks and close the connection. An attached
    /// listener receives a final [`Error::Connection`].
    pub async fn close(mut self) {
        self.tasks.shutdown_all().await;

        let member_id = self.shared.group.lock().await.member_id.clone();
        if !member_id.is_empty() {
            if let Err(e) = self
                .shared
                .cluster()
                .leave_group(&self.shared.config.group_id, &member_id)
                .await
            {
                warn!(group = %self.shared.config.group_id, error = %e, "Leave group failed");
            }
        }
        self.shared.revoke().await;
        self.connection.close().await;

        if let Some(slot) = self.shared.current_listener() {
            self.shared
                .terminate_listener(&slot, "closed by client".to_string());
        }
        info!(group = %self.shared.config.group_id, "Consumer closed");
    }
}
