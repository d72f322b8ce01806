//! Broker connection shared by one producer or consumer.
//!
//! A [`BrokerConnection`] is ready once the broker has answered a ping. With
//! keepalive enabled a heartbeat task keeps pinging; the first failed ping,
//! or any request that fails with a connection error, moves the connection to
//! [`ConnectionState::Disconnected`] for good. Reconnecting means creating a
//! new client.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{Cluster, RemoteCluster};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::tasks::BackgroundTaskRegistry;

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    /// Terminal; carries the reason.
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

/// The cluster handle plus the state it reports into. Cheap to clone into
/// background tasks.
#[derive(Clone)]
pub(crate) struct Link {
    cluster: Arc<dyn Cluster>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Link {
    pub(crate) fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.borrow().is_ready()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn disconnect_reason(&self) -> Option<String> {
        match &*self.state.borrow() {
            ConnectionState::Ready => None,
            ConnectionState::Disconnected(reason) => Some(reason.clone()),
        }
    }

    /// Pass `result` through, recording a disconnect if it failed with a
    /// connection error.
    pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Connection(reason)) = &result {
            self.mark_disconnected(reason.clone());
        }
        result
    }

    /// Move to `Disconnected` unless already there.
    pub(crate) fn mark_disconnected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|state| {
            if state.is_ready() {
                *state = ConnectionState::Disconnected(reason.clone());
                true
            } else {
                false
            }
        });
        if changed {
            warn!(reason = %reason, "Broker connection lost");
            metrics::record_connection_state("disconnected");
        }
    }

    /// Resolves with the disconnect reason once the connection is gone.
    pub(crate) async fn disconnected(&self) -> String {
        let mut rx = self.subscribe();
        let reason = match rx.wait_for(|state| !state.is_ready()).await {
            Ok(state) => match &*state {
                ConnectionState::Disconnected(reason) => reason.clone(),
                ConnectionState::Ready => String::new(),
            },
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }
}

/// One connection to the broker cluster.
pub struct BrokerConnection {
    link: Link,
    client_id: String,
    tasks: BackgroundTaskRegistry,
}

impl BrokerConnection {
    /// Dial `config.brokers` and wait until the broker answers.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let remote = RemoteCluster::connect(&config.brokers, config.connect_timeout)
            .await
            .map_err(|e| match e {
                Error::Connection(_) => e,
                other => Error::Connection(other.to_string()),
            })?;
        Self::with_cluster(config, Arc::new(remote)).await
    }

    /// Use an existing transport, e.g. an embedded broker.
    pub async fn with_cluster(config: &ClientConfig, cluster: Arc<dyn Cluster>) -> Result<Self> {
        match timeout(config.connect_timeout, cluster.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::Connection(format!("broker not ready: {}", e)));
            }
            Err(_) => {
                return Err(Error::Connection(format!(
                    "broker not ready within {:?}",
                    config.connect_timeout
                )));
            }
        }

        let (state, _) = watch::channel(ConnectionState::Ready);
        let link = Link {
            cluster,
            state: Arc::new(state),
        };
        metrics::record_connection_state("ready");
        info!(client_id = %config.client_id, "Broker connection ready");

        let mut tasks = BackgroundTaskRegistry::new();
        if config.keepalive {
            let heartbeat = link.clone();
            let interval = config.heartbeat_interval;
            tasks.spawn("connection-heartbeat", async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !heartbeat.is_connected() {
                        break;
                    }
                    match timeout(interval, heartbeat.cluster.ping()).await {
                        Ok(Ok(())) => debug!("Heartbeat ok"),
                        Ok(Err(e)) => {
                            heartbeat.mark_disconnected(e.to_string());
                            break;
                        }
                        Err(_) => {
                            heartbeat.mark_disconnected("heartbeat timed out");
                            break;
                        }
                    }
                }
            });
        }

        Ok(Self {
            link,
            client_id: config.client_id.clone(),
            tasks,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }

    /// Resolves with the reason once the connection is lost or closed.
    pub async fn disconnected(&self) -> String {
        self.link.disconnected().await
    }

    /// Mark the connection closed and stop the heartbeat.
    pub async fn close(&mut self) {
        self.link.mark_disconnected("closed by client");
        self.tasks.shutdown_all().await;
    }

    pub(crate) fn link(&self) -> Link {
        self.link.clone()
    }

}
