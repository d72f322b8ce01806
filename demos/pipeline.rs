//! Contribution pipeline: produce, consume, process idempotently, commit.
//!
//! Without `KAFKA_BROKERS` the demo runs against an embedded broker in this
//! process. Point it at `cargo run --example broker` to go over TCP:
//!
//! Run with: KAFKA_BROKERS=127.0.0.1:9092 cargo run --example pipeline

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use logbridge::broker::{Cluster, InMemoryBroker};
use logbridge::config::{ConsumerConfig, ProducerConfig};
use logbridge::consumer::Consumer;
use logbridge::dedup::{self, BoundedDedupStore, DeduplicationStore};
use logbridge::producer::Producer;
use logbridge::telemetry::{self, LogFormat};
use tracing::{info, warn};

const TOPIC: &str = "contributions";
const CONTRIBUTIONS: usize = 20;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Contribution {
    tx_hash: String,
    amount: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let producer_config = ProducerConfig::from_env()?;
    let consumer_config = ConsumerConfig::from_env()?;
    telemetry::init_logging(LogFormat::from_env(), producer_config.client.debug)?;

    let embedded: Option<Arc<dyn Cluster>> = match std::env::var("KAFKA_BROKERS") {
        Ok(_) => None,
        Err(_) => {
            info!("KAFKA_BROKERS not set, using an embedded broker");
            Some(Arc::new(InMemoryBroker::new()))
        }
    };

    let producer = match &embedded {
        Some(cluster) => Producer::with_cluster(producer_config, cluster.clone()).await?,
        None => Producer::create(producer_config).await?,
    };
    let mut reports = producer.listen().ok_or("delivery reports already claimed")?;
    tokio::spawn(async move {
        while let Some(report) = reports.next().await {
            match report {
                Ok(r) => info!(partition = %r.partition, offset = %r.offset, "Delivered"),
                Err(e) => warn!(error = %e, "Delivery failed"),
            }
        }
    });

    for i in 0..CONTRIBUTIONS {
        let contribution = Contribution {
            tx_hash: format!("tx{}", i),
            amount: (i as u64 + 1) * 5,
        };
        producer.produce(TOPIC, Some(&contribution.tx_hash), &contribution)?;
    }
    producer.flush(Duration::from_secs(10)).await?;

    let consumer = match &embedded {
        Some(cluster) => {
            Consumer::with_cluster(consumer_config, TOPIC, "pipeline-demo", cluster.clone()).await?
        }
        None => Consumer::create(consumer_config, TOPIC, "pipeline-demo").await?,
    };
    info!(membership = ?consumer.membership().await, "Consumer ready");

    let seen = BoundedDedupStore::default();
    let mut processed = 0usize;
    let mut total = 0u64;
    let mut records = consumer.listen(TOPIC, |_| false).await;

    while processed < CONTRIBUTIONS {
        let Some(item) = records.next().await else {
            break;
        };
        let record = item?;

        let key = dedup::record_key(&record);
        if !seen.has(&key) {
            let contribution: Contribution = record.json()?;
            total += contribution.amount;
            seen.add(&key);
            processed += 1;
        }
        // Side effect applied; only now is the offset committed.
        consumer.commit(&record).await;
    }

    info!(processed, total, "Pipeline finished");

    consumer.close().await;
    producer.close().await?;
    Ok(())
}
