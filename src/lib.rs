//! # logbridge
//! At-least-once event pipeline over a partitioned commit log.
//!
//! A [`Producer`](producer::Producer) publishes JSON records to topics and
//! reports each acknowledged write. A [`Consumer`](consumer::Consumer) joins a
//! consumer group, owns a share of the topic's partitions, and streams records
//! to the application. Offsets are committed manually, after the application
//! has applied a record's side effects, so a crash never loses a record: the
//! next owner of the partition resumes from the last commit.
//!
//! # Goals
//! - Never lose a record; redelivery is acceptable
//! - Make partition ownership explicit and observable
//! - Surface a lost broker connection as a terminal stream error
//!
//! ## Getting started
//! ```toml
//! logbridge = "0.1"
//! ```
//!
//! ### Producing and consuming
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use logbridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> logbridge::Result<()> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!
//!     let producer = Producer::with_cluster(ProducerConfig::default(), broker.clone()).await?;
//!     producer.produce("contributions", Some("user-1"), &serde_json::json!({"amount": 5}))?;
//!     producer.flush(std::time::Duration::from_secs(5)).await?;
//!
//!     let consumer =
//!         Consumer::with_cluster(ConsumerConfig::default(), "contributions", "worker-1", broker)
//!             .await?;
//!     let mut records = consumer.listen("contributions", |_| false).await;
//!     if let Some(Ok(record)) = records.next().await {
//!         consumer.commit(&record).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Run a standalone broker with [`BrokerServer`](broker::BrokerServer) and
//! point clients at it through `KAFKA_BROKERS`; see `demos/broker.rs` and
//! `demos/pipeline.rs`.

#![forbid(unsafe_code)]

pub mod broker;
pub mod compression;
pub mod config;
pub mod connection;
pub mod constants;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod message;
pub mod metrics;
pub mod partitioner;
pub mod producer;
pub mod rebalance;
pub mod retry;
pub mod stream;
pub mod tasks;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};

pub mod prelude {
    //! Main exports for pipeline clients.
    //!
    //! ```rust,no_run
    //! use logbridge::prelude::*;
    //!
    //! # async fn run() -> logbridge::Result<()> {
    //! let consumer =
    //!     Consumer::create(ConsumerConfig::from_env()?, "contributions", "worker-1").await?;
    //! println!("{:?}", consumer.membership().await);
    //! # Ok(())
    //! # }
    //! ```
    pub use crate::broker::{BrokerServer, Cluster, InMemoryBroker, RemoteCluster};
    pub use crate::compression::CompressionCodec;
    pub use crate::config::{
        BrokerConfig, ClientConfig, ConsumerConfig, OffsetReset, ProducerConfig,
    };
    pub use crate::connection::{BrokerConnection, ConnectionState};
    pub use crate::consumer::Consumer;
    pub use crate::dedup::{BoundedDedupStore, DeduplicationStore};
    pub use crate::error::{BrokerCode, Error, Result};
    pub use crate::message::{Message, ProducerRecord};
    pub use crate::producer::{DeliveryReport, Producer};
    pub use crate::rebalance::{
        AssignmentTarget, ConsumerGroupMembership, OwnershipState, RebalanceCoordinator,
    };
    pub use crate::stream::EventStream;
    pub use crate::types::{GenerationId, Offset, PartitionIndex, TopicPartition};

    pub use bytes;
}
