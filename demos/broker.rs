//! Standalone broker serving the embedded commit log over TCP.
//!
//! **WARNING**: records and committed offsets live in memory and are lost on
//! restart. Use it for development and for running the pipeline demo across
//! processes.
//!
//! Run with: cargo run --example broker
//!
//! Environment:
//! - `BROKER_ADDR`: listen address (default: 127.0.0.1:9092)
//! - `LOG_FORMAT`: pretty or json

use std::sync::Arc;
use std::time::Duration;

use logbridge::broker::{BrokerServer, InMemoryBroker};
use logbridge::config::BrokerConfig;
use logbridge::constants::{DEFAULT_BROKERS, SHUTDOWN_TIMEOUT};
use logbridge::metrics;
use logbridge::telemetry::{self, LogFormat};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    telemetry::init_logging(LogFormat::from_env(), false)?;
    metrics::init_metrics();

    let addr = std::env::var("BROKER_ADDR").unwrap_or_else(|_| DEFAULT_BROKERS.to_string());
    let config = BrokerConfig::default();
    if let Err(errors) = config.validate() {
        return Err(errors.join("; ").into());
    }

    let broker = Arc::new(InMemoryBroker::with_config(config));
    let server = Arc::new(BrokerServer::bind(&addr, broker.clone()).await?);
    info!(address = %server.local_addr()?, "Broker is running");

    let runner = server.clone();
    let serving = tokio::spawn(async move { runner.run().await });

    // Periodically expose the metrics text so the demo shows what a scraper sees.
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match metrics::encode_metrics() {
                Ok(text) => {
                    let topics = broker.topic_names().await;
                    info!(bytes = text.len(), topics = ?topics, "Metrics snapshot")
                }
                Err(e) => warn!(error = %e, "Failed to encode metrics"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    reporter.abort();
    if !server.shutdown_and_wait(SHUTDOWN_TIMEOUT).await {
        warn!("Some connections did not close in time");
    }
    serving.await??;

    Ok(())
}
