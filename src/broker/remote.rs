//! [`Cluster`] client for a [`BrokerServer`](super::BrokerServer).

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::wire::{Request, Response, read_frame, unexpected, write_frame};
use super::{Cluster, GroupDescription, JoinGroupRequest, JoinGroupResponse};
use crate::constants::REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::message::{Message, RecordBatch};
use crate::types::{GenerationId, Offset, PartitionIndex, TopicPartition};

struct Session {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A TCP connection to a broker.
///
/// Requests are serialized over a single socket. A transport failure drops
/// the socket; the next request dials the broker list again.
pub struct RemoteCluster {
    brokers: Vec<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
    session: Mutex<Option<Session>>,
    correlation_id: AtomicI32,
}

impl RemoteCluster {
    /// Connect to the first reachable broker in `brokers`.
    pub async fn connect(brokers: &[String], connect_timeout: Duration) -> Result<Self> {
        if brokers.is_empty() {
            return Err(Error::Config("no brokers configured".to_string()));
        }
        let session = dial(brokers, connect_timeout).await?;
        Ok(Self {
            brokers: brokers.to_vec(),
            connect_timeout,
            request_timeout: REQUEST_TIMEOUT,
            session: Mutex::new(Some(session)),
            correlation_id: AtomicI32::new(0),
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Address of the broker currently connected, if any.
    pub async fn connected_to(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.addr.clone())
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let op = request.name();
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(dial(&self.brokers, self.connect_timeout).await?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(Error::Connection("no session".to_string()));
        };

        let correlation_id = self.correlation_id.fetch_add(1, Ordering::Relaxed);
        let exchange = async {
            write_frame(&mut session.writer, correlation_id, &request).await?;
            read_frame::<_, Response>(&mut session.reader).await
        };

        let result = match timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some((id, response)))) if id == correlation_id => Ok(response),
            Ok(Ok(Some((id, _)))) => Err(Error::Connection(format!(
                "correlation mismatch: sent {}, got {}",
                correlation_id, id
            ))),
            Ok(Ok(None)) => Err(Error::Connection(format!(
                "{} closed the connection",
                session.addr
            ))),
            Ok(Err(Error::Serialization(msg))) => Err(Error::Connection(msg)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Connection(format!(
                "{} timed out after {:?}",
                op, self.request_timeout
            ))),
        };

        if let Err(e) = &result {
            warn!(op, broker = %session.addr, error = %e, "Dropping broker session");
            *guard = None;
        }
        result
    }
}

async fn dial(brokers: &[String], connect_timeout: Duration) -> Result<Session> {
    let mut last_error = Error::Connection("no brokers configured".to_string());

    for addr in brokers {
        match timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                info!(broker = %addr, "Connected to broker");
                return Ok(Session {
                    addr: addr.clone(),
                    reader: BufReader::new(reader),
                    writer,
                });
            }
            Ok(Err(e)) => {
                debug!(broker = %addr, error = %e, "Broker unreachable");
                last_error = e.into();
            }
            Err(_) => {
                debug!(broker = %addr, "Connect timed out");
                last_error = Error::Connection(format!(
                    "connect to {} timed out after {:?}",
                    addr, connect_timeout
                ));
            }
        }
    }

    Err(last_error)
}

#[async_trait]
impl Cluster for RemoteCluster {
    async fn ping(&self) -> Result<()> {
        match self.call(Request::Ping).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        let request = Request::PartitionCount {
            topic: topic.to_string(),
        };
        match self.call(request).await? {
            Response::PartitionCount(count) => Ok(count),
            other => Err(unexpected("partition_count", other)),
        }
    }

    async fn produce(
        &self,
        topic: &str,
        partition: PartitionIndex,
        batch: RecordBatch,
    ) -> Result<Offset> {
        let request = Request::Produce {
            topic: topic.to_string(),
            partition,
            batch,
        };
        match self.call(request).await? {
            Response::Produced(offset) => Ok(offset),
            other => Err(unexpected("produce", other)),
        }
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_records: usize,
    ) -> Result<Vec<Message>> {
        let request = Request::Fetch {
            topic: topic.to_string(),
            partition,
            offset,
            max_records,
        };
        match self.call(request).await? {
            Response::Fetched(messages) => Ok(messages),
            other => Err(unexpected("fetch", other)),
        }
    }

    async fn list_offsets(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<(Offset, Offset)> {
        let request = Request::ListOffsets {
            topic: topic.to_string(),
            partition,
        };
        match self.call(request).await? {
            Response::Offsets { earliest, next } => Ok((earliest, next)),
            other => Err(unexpected("list_offsets", other)),
        }
    }

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse> {
        match self.call(Request::JoinGroup(request)).await? {
            Response::Joined(joined) => Ok(joined),
            other => Err(unexpected("join_group", other)),
        }
    }

    async fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> Result<Vec<TopicPartition>> {
        let request = Request::SyncGroup {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
        };
        match self.call(request).await? {
            Response::Assignment(partitions) => Ok(partitions),
            other => Err(unexpected("sync_group", other)),
        }
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> Result<()> {
        let request = Request::Heartbeat {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
        };
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("heartbeat", other)),
        }
    }

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()> {
        let request = Request::LeaveGroup {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
        };
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("leave_group", other)),
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
        let request = Request::CommitOffset {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
            partition: partition.clone(),
            offset,
        };
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("commit_offset", other)),
        }
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>> {
        let request = Request::CommittedOffset {
            group_id: group_id.to_string(),
            partition: partition.clone(),
        };
        match self.call(request).await? {
            Response::Committed(offset) => Ok(offset),
            other => Err(unexpected("committed_offset", other)),
        }
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>> {
        let request = Request::DescribeGroup {
            group_id: group_id.to_string(),
        };
        match self.call(request).await? {
            Response::Group(description) => Ok(description),
            other => Err(unexpected("describe_group", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerServer, InMemoryBroker};
    use crate::error::BrokerCode;
    use std::sync::Arc;

    async fn start_server() -> (Arc<BrokerServer>, String) {
        let server = Arc::new(
            BrokerServer::bind("127.0.0.1:0", Arc::new(InMemoryBroker::new()))
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap().to_string();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = RemoteCluster::connect(&["127.0.0.1:1".to_string()], Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_empty_broker_list() {
        let err = RemoteCluster::connect(&[], Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_requests_over_tcp() {
        let (server, addr) = start_server().await;
        let remote = RemoteCluster::connect(&[addr.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(remote.connected_to().await, Some(addr));

        remote.ping().await.unwrap();
        assert_eq!(remote.partition_count("t").await.unwrap(), 3);
        assert_eq!(
            remote
                .fetch("t", PartitionIndex(0), Offset(9), 1)
                .await
                .unwrap_err(),
            Error::Broker(BrokerCode::OffsetOutOfRange)
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown_surfaces_connection_error() {
        let (server, addr) = start_server().await;
        let remote = RemoteCluster::connect(&[addr], Duration::from_millis(200))
            .await
            .unwrap();
        remote.ping().await.unwrap();

        assert!(server.shutdown_and_wait(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(remote.ping().await.unwrap_err().is_connection());
    }
}
