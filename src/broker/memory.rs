//! Embedded in-process broker.
//!
//! Holds partition logs, consumer groups and committed offsets in memory.
//! Everything lives in the broker object, so clients that are dropped and
//! re-created against the same `InMemoryBroker` see the state a restarted
//! process would see against a real cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::group::{GroupCommand, GroupDomainState, GroupResponse};
use super::log::PartitionLog;
use super::{Cluster, GroupDescription, JoinGroupRequest, JoinGroupResponse};
use crate::config::BrokerConfig;
use crate::constants::MAX_TOPIC_NAME_LENGTH;
use crate::error::{BrokerCode, Error, Result};
use crate::message::{Message, RecordBatch};
use crate::types::{GenerationId, Offset, PartitionIndex, TopicPartition, now_ms};

/// An in-memory partitioned log with group coordination.
pub struct InMemoryBroker {
    config: BrokerConfig,
    /// Topic -> partition logs, indexed by partition.
    topics: RwLock<HashMap<String, Vec<PartitionLog>>>,
    groups: Mutex<GroupDomainState>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
            groups: Mutex::new(GroupDomainState::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage. While unavailable every call fails with
    /// [`Error::Connection`]; data and groups are kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "Broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Create `topic` with `partitions` partitions. Existing topics are left alone.
    pub async fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        validate_topic_name(topic)?;
        if partitions < 1 {
            return Err(Error::Config(format!(
                "topic {} needs at least one partition, got {}",
                topic, partitions
            )));
        }

        let mut topics = self.topics.write().await;
        if !topics.contains_key(topic) {
            topics.insert(topic.to_string(), self.new_partitions(topic, partitions));
            info!(topic, partitions, "Created topic");
        }
        Ok(())
    }

    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn new_partitions(&self, topic: &str, partitions: i32) -> Vec<PartitionLog> {
        (0..partitions)
            .map(|p| PartitionLog::new(topic, PartitionIndex(p), self.config.retention_max_records))
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::Connection("broker unavailable".to_string()))
        }
    }

    async fn group_op(&self, cmd: GroupCommand) -> GroupResponse {
        let now = now_ms() as u64;
        let mut groups = self.groups.lock().await;
        groups.apply(GroupCommand::ExpireMembers, now);
        groups.apply(cmd, now)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn group_error(response: GroupResponse) -> Error {
    let code = match response {
        GroupResponse::InvalidGroupId => BrokerCode::InvalidGroupId,
        GroupResponse::UnknownMember { .. } => BrokerCode::UnknownMemberId,
        GroupResponse::IllegalGeneration { .. } => BrokerCode::IllegalGeneration,
        GroupResponse::RebalanceInProgress { .. } => BrokerCode::RebalanceInProgress,
        _ => BrokerCode::Unknown,
    };
    Error::Broker(code)
}

/// Topic names: 1-249 characters of `[a-zA-Z0-9._-]`, not "." or "..".
pub fn validate_topic_name(topic: &str) -> Result<()> {
    let valid = !topic.is_empty()
        && topic.len() <= MAX_TOPIC_NAME_LENGTH
        && topic != "."
        && topic != ".."
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Broker(BrokerCode::InvalidTopic))
    }
}

#[async_trait]
impl Cluster for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        self.check_available()?;
        validate_topic_name(topic)?;

        if let Some(partitions) = self.topics.read().await.get(topic) {
            return Ok(partitions.len() as i32);
        }
        if !self.config.auto_create_topics {
            return Err(Error::Broker(BrokerCode::UnknownTopicOrPartition));
        }

        let mut topics = self.topics.write().await;
        let count = self.config.default_partitions;
        let partitions = topics.entry(topic.to_string()).or_insert_with(|| {
            info!(topic, partitions = count, "Auto-created topic");
            self.new_partitions(topic, count)
        });
        Ok(partitions.len() as i32)
    }

    async fn produce(
        &self,
        topic: &str,
        partition: PartitionIndex,
        batch: RecordBatch,
    ) -> Result<Offset> {
        self.check_available()?;
        validate_topic_name(topic)?;

        let records = batch.decode().map_err(|e| {
            debug!(topic, error = %e, "Rejecting undecodable batch");
            Error::Broker(BrokerCode::CorruptMessage)
        })?;

        if records
            .iter()
            .any(|r| r.value.len() > self.config.max_message_bytes)
        {
            return Err(Error::Broker(BrokerCode::MessageSizeTooLarge));
        }

        if self.config.auto_create_topics {
            self.partition_count(topic).await?;
        }

        let mut topics = self.topics.write().await;
        let log = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition.value().max(0) as usize))
            .filter(|_| partition.is_valid())
            .ok_or(Error::Broker(BrokerCode::UnknownTopicOrPartition))?;

        let count = records.len();
        let base = log.append(records);
        debug!(topic, partition = %partition, base_offset = %base, count, "Appended batch");
        Ok(base)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_records: usize,
    ) -> Result<Vec<Message>> {
        self.check_available()?;

        let topics = self.topics.read().await;
        let log = topics
            .get(topic)
            .and_then(|logs| logs.get(partition.value().max(0) as usize))
            .filter(|_| partition.is_valid())
            .ok_or(Error::Broker(BrokerCode::UnknownTopicOrPartition))?;

        log.read(offset, max_records)
            .ok_or(Error::Broker(BrokerCode::OffsetOutOfRange))
    }

    async fn list_offsets(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<(Offset, Offset)> {
        self.check_available()?;

        let topics = self.topics.read().await;
        let log = topics
            .get(topic)
            .and_then(|logs| logs.get(partition.value().max(0) as usize))
            .filter(|_| partition.is_valid())
            .ok_or(Error::Broker(BrokerCode::UnknownTopicOrPartition))?;
        Ok((log.earliest_offset(), log.high_watermark()))
    }

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse> {
        self.check_available()?;

        let response = self
            .group_op(GroupCommand::JoinGroup {
                group_id: request.group_id,
                member_id: request.member_id,
                client_id: request.client_id,
                topics: request.topics,
                session_timeout_ms: request.session_timeout_ms,
            })
            .await;

        match response {
            GroupResponse::Joined {
                member_id,
                generation,
                leader_id,
                member_count,
            } => Ok(JoinGroupResponse {
                member_id,
                generation: GenerationId(generation),
                leader_id,
                member_count,
            }),
            other => Err(group_error(other)),
        }
    }

    async fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> Result<Vec<TopicPartition>> {
        self.check_available()?;

        let subscribed = {
            let groups = self.groups.lock().await;
            groups
                .get_group(group_id)
                .map(|g| g.subscribed_topics())
                .unwrap_or_default()
        };

        let partition_counts: HashMap<String, i32> = {
            let topics = self.topics.read().await;
            subscribed
                .into_iter()
                .filter_map(|t| topics.get(&t).map(|logs| (t, logs.len() as i32)))
                .collect()
        };

        let response = self
            .group_op(GroupCommand::SyncGroup {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                generation: generation.value(),
                partition_counts,
            })
            .await;

        match response {
            GroupResponse::Assignment(partitions) => Ok(partitions),
            other => Err(group_error(other)),
        }
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> Result<()> {
        self.check_available()?;

        match self
            .group_op(GroupCommand::Heartbeat {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                generation: generation.value(),
            })
            .await
        {
            GroupResponse::HeartbeatAck => Ok(()),
            other => Err(group_error(other)),
        }
    }

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()> {
        self.check_available()?;

        match self
            .group_op(GroupCommand::LeaveGroup {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
            })
            .await
        {
            GroupResponse::LeftGroup => Ok(()),
            other => Err(group_error(other)),
        }
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Result<()> {
        self.check_available()?;

        match self
            .group_op(GroupCommand::CommitOffset {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                generation: generation.value(),
                partition: partition.clone(),
                offset,
            })
            .await
        {
            GroupResponse::OffsetCommitted => Ok(()),
            other => Err(group_error(other)),
        }
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>> {
        self.check_available()?;
        Ok(self.groups.lock().await.get_offset(group_id, partition))
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>> {
        self.check_available()?;
        let now = now_ms() as u64;
        let mut groups = self.groups.lock().await;
        groups.apply(GroupCommand::ExpireMembers, now);
        Ok(groups.describe(group_id))
    }
}
