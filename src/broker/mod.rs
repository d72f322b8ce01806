//! The broker seam.
//!
//! Producers and consumers talk to the commit log only through [`Cluster`].
//! Two implementations ship with the crate:
//!
//! - [`InMemoryBroker`]: an embedded partitioned log with consumer group
//!   coordination and committed offsets, for tests and single-process setups.
//! - [`RemoteCluster`]: a TCP client for [`BrokerServer`], which serves any
//!   `Cluster` over a length-prefixed frame protocol.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use logbridge::broker::{BrokerServer, InMemoryBroker};
//!
//! # async fn run() -> logbridge::Result<()> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let server = BrokerServer::bind("127.0.0.1:9092", broker).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod group;
pub mod log;
pub mod memory;
pub mod remote;
pub mod server;
pub mod wire;

pub use memory::InMemoryBroker;
pub use remote::RemoteCluster;
pub use server::BrokerServer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, RecordBatch};
use crate::types::{GenerationId, Offset, PartitionIndex, TopicPartition};

/// A request to join (or rejoin) a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// Empty on first join; the coordinator assigns an id.
    pub member_id: String,
    pub client_id: String,
    /// Topics this member subscribes to.
    pub topics: Vec<String>,
    pub session_timeout_ms: u64,
}

/// The coordinator's answer to a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroupResponse {
    pub member_id: String,
    pub generation: GenerationId,
    pub leader_id: String,
    /// Members in the group after this join.
    pub member_count: usize,
}

/// Lifecycle of a consumer group on the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    /// No members.
    Empty,
    /// Membership changed; members must rejoin and sync.
    PreparingRebalance,
    /// Assignment computed and handed out.
    Stable,
}

/// Snapshot of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub group_id: String,
    pub state: GroupState,
    pub generation: GenerationId,
    pub leader_id: Option<String>,
    /// Member ids, sorted.
    pub members: Vec<String>,
}

/// Operations the pipeline needs from a partitioned commit log.
///
/// Errors follow a simple contract: an unreachable broker is
/// [`Error::Connection`](crate::Error::Connection); every refusal by a
/// reachable broker is [`Error::Broker`](crate::Error::Broker) carrying the
/// code.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Readiness probe.
    async fn ping(&self) -> Result<()>;

    /// Number of partitions in `topic`, creating it if the broker allows.
    async fn partition_count(&self, topic: &str) -> Result<i32>;

    /// Append a batch to one partition. Returns the offset of its first record.
    async fn produce(
        &self,
        topic: &str,
        partition: PartitionIndex,
        batch: RecordBatch,
    ) -> Result<Offset>;

    /// Read up to `max_records` records starting at `offset`.
    ///
    /// Reading at the end of the log returns an empty batch.
    async fn fetch(
        &self,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_records: usize,
    ) -> Result<Vec<Message>>;

    /// The `(earliest, next)` offsets of a partition.
    async fn list_offsets(&self, topic: &str, partition: PartitionIndex)
    -> Result<(Offset, Offset)>;

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse>;

    /// Fetch this member's assignment for `generation`.
    async fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> Result<Vec<TopicPartition>>;

    /// Keep the member's session alive.
    ///
    /// Answers `RebalanceInProgress`, `IllegalGeneration` or `UnknownMemberId`
    /// when the member must rejoin.
    async fn heartbeat(&self, group_id: &str, member_id: &str, generation: GenerationId)
    -> Result<()>;

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()>;

    /// Store `offset` as the next record to read for the group.
    async fn commit_offset(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Result<()>;

    /// The committed offset for the group, if any.
    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>>;

    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>>;
}
