//! TCP front end for any [`Cluster`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::Cluster;
use super::wire::{self, Request, Response, read_frame, write_frame};
use crate::error::Result;
use crate::metrics;

/// Serves a [`Cluster`] over the frame protocol in [`wire`].
pub struct BrokerServer {
    listener: TcpListener,
    cluster: Arc<dyn Cluster>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl BrokerServer {
    pub async fn bind(addr: &str, cluster: Arc<dyn Cluster>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(addr = %addr, "Broker listening");

        Ok(Self {
            listener,
            cluster,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and close the open ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Shutdown signal sent");
    }

    /// Shut down and wait up to `timeout` for connections to drain.
    ///
    /// Returns `true` if every connection closed in time.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            let active = self.active_connections();
            if active == 0 {
                info!("All connections drained");
                return true;
            }
            debug!(active_connections = active, "Waiting for connections to drain");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        warn!(
            remaining_connections = self.active_connections(),
            "Shutdown timeout, connections still active"
        );
        false
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Broker shutting down, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(client_addr = %addr, "Accepted connection");

                    let cluster = self.cluster.clone();
                    let active = self.active_connections.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();

                    active.fetch_add(1, Ordering::SeqCst);
                    metrics::SERVER_ACTIVE_CONNECTIONS.inc();
                    metrics::SERVER_CONNECTIONS_TOTAL.inc();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, cluster, shutdown_rx).await {
                            error!(client_addr = %addr, error = %e, "Error handling connection");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                        metrics::SERVER_ACTIVE_CONNECTIONS.dec();
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    cluster: Arc<dyn Cluster>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(client_addr = %addr, "Closing connection for shutdown");
                return Ok(());
            }
            frame = read_frame::<_, Request>(&mut reader) => frame?,
        };

        let Some((correlation_id, request)) = frame else {
            debug!(client_addr = %addr, "Client disconnected");
            return Ok(());
        };

        let op = request.name();
        let response = dispatch(cluster.as_ref(), request).await;
        metrics::record_server_request(op, !matches!(response, Response::Error(_)));

        write_frame(&mut writer, correlation_id, &response).await?;
    }
}

/// Run one request against `cluster`.
pub async fn dispatch(cluster: &dyn Cluster, request: Request) -> Response {
    use wire::respond;

    match request {
        Request::Ping => respond(cluster.ping().await, |()| Response::Ack),
        Request::PartitionCount { topic } => {
            respond(cluster.partition_count(&topic).await, Response::PartitionCount)
        }
        Request::Produce {
            topic,
            partition,
            batch,
        } => respond(
            cluster.produce(&topic, partition, batch).await,
            Response::Produced,
        ),
        Request::Fetch {
            topic,
            partition,
            offset,
            max_records,
        } => respond(
            cluster.fetch(&topic, partition, offset, max_records).await,
            Response::Fetched,
        ),
        Request::ListOffsets { topic, partition } => respond(
            cluster.list_offsets(&topic, partition).await,
            |(earliest, next)| Response::Offsets { earliest, next },
        ),
        Request::JoinGroup(join) => respond(cluster.join_group(join).await, Response::Joined),
        Request::SyncGroup {
            group_id,
            member_id,
            generation,
        } => respond(
            cluster.sync_group(&group_id, &member_id, generation).await,
            Response::Assignment,
        ),
        Request::Heartbeat {
            group_id,
            member_id,
            generation,
        } => respond(
            cluster.heartbeat(&group_id, &member_id, generation).await,
            |()| Response::Ack,
        ),
        Request::LeaveGroup {
            group_id,
            member_id,
        } => respond(cluster.leave_group(&group_id, &member_id).await, |()| {
            Response::Ack
        }),
        Request::CommitOffset {
            group_id,
            member_id,
            generation,
            partition,
            offset,
        } => respond(
            cluster
                .commit_offset(&group_id, &member_id, generation, &partition, offset)
                .await,
            |()| Response::Ack,
        ),
        Request::CommittedOffset {
            group_id,
            partition,
        } => respond(
            cluster.committed_offset(&group_id, &partition).await,
            Response::Committed,
        ),
        Request::DescribeGroup { group_id } => {
            respond(cluster.describe_group(&group_id).await, Response::Group)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::broker::wire::WireError;
    use crate::error::BrokerCode;
    use crate::types::{Offset, PartitionIndex};

    #[tokio::test]
    async fn test_dispatch_maps_errors() {
        let broker = InMemoryBroker::new();
        let response = dispatch(
            &broker,
            Request::Fetch {
                topic: "missing".into(),
                partition: PartitionIndex(0),
                offset: Offset(0),
                max_records: 1,
            },
        )
        .await;
        assert_eq!(
            response,
            Response::Error(WireError::Broker(
                BrokerCode::UnknownTopicOrPartition.as_i32()
            ))
        );
    }

    #[tokio::test]
    async fn test_dispatch_partition_count() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 4).await.unwrap();
        let response = dispatch(&broker, Request::PartitionCount { topic: "t".into() }).await;
        assert_eq!(response, Response::PartitionCount(4));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let server = Arc::new(
            BrokerServer::bind("127.0.0.1:0", Arc::new(InMemoryBroker::new()))
                .await
                .unwrap(),
        );
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.shutdown_and_wait(Duration::from_secs(1)).await);
        assert!(handle.await.unwrap().is_ok());
    }
}
