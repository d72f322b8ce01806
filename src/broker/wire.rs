//! Frame protocol between [`RemoteCluster`](super::RemoteCluster) and
//! [`BrokerServer`](super::BrokerServer).
//!
//! Every frame is
//!
//! ```text
//! [size: i32][correlation_id: i32][body: JSON]
//! ```
//!
//! where `size` counts the correlation id and the body. One request gets
//! exactly one response carrying the same correlation id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{GroupDescription, JoinGroupRequest, JoinGroupResponse};
use crate::constants::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::error::{BrokerCode, Error, Result};
use crate::message::{Message, RecordBatch};
use crate::types::{GenerationId, Offset, PartitionIndex, TopicPartition};

/// Client to broker requests, one per [`Cluster`](super::Cluster) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    PartitionCount {
        topic: String,
    },
    Produce {
        topic: String,
        partition: PartitionIndex,
        batch: RecordBatch,
    },
    Fetch {
        topic: String,
        partition: PartitionIndex,
        offset: Offset,
        max_records: usize,
    },
    ListOffsets {
        topic: String,
        partition: PartitionIndex,
    },
    JoinGroup(JoinGroupRequest),
    SyncGroup {
        group_id: String,
        member_id: String,
        generation: GenerationId,
    },
    Heartbeat {
        group_id: String,
        member_id: String,
        generation: GenerationId,
    },
    LeaveGroup {
        group_id: String,
        member_id: String,
    },
    CommitOffset {
        group_id: String,
        member_id: String,
        generation: GenerationId,
        partition: TopicPartition,
        offset: Offset,
    },
    CommittedOffset {
        group_id: String,
        partition: TopicPartition,
    },
    DescribeGroup {
        group_id: String,
    },
}

impl Request {
    /// Operation name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::PartitionCount { .. } => "partition_count",
            Request::Produce { .. } => "produce",
            Request::Fetch { .. } => "fetch",
            Request::ListOffsets { .. } => "list_offsets",
            Request::JoinGroup(_) => "join_group",
            Request::SyncGroup { .. } => "sync_group",
            Request::Heartbeat { .. } => "heartbeat",
            Request::LeaveGroup { .. } => "leave_group",
            Request::CommitOffset { .. } => "commit_offset",
            Request::CommittedOffset { .. } => "committed_offset",
            Request::DescribeGroup { .. } => "describe_group",
        }
    }
}

/// Broker to client responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    Ack,
    PartitionCount(i32),
    Produced(Offset),
    Fetched(Vec<Message>),
    Offsets { earliest: Offset, next: Offset },
    Joined(JoinGroupResponse),
    Assignment(Vec<TopicPartition>),
    Committed(Option<Offset>),
    Group(Option<GroupDescription>),
    Error(WireError),
}

/// An [`Error`] as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireError {
    Broker(i32),
    Connection(String),
    Serialization(String),
    Other(String),
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Broker(code) | Error::Rebalance(code) => WireError::Broker(code.as_i32()),
            Error::Connection(msg) => WireError::Connection(msg.clone()),
            Error::Serialization(msg) => WireError::Serialization(msg.clone()),
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Broker(code) => Error::Broker(BrokerCode::from_raw(code)),
            WireError::Connection(msg) => Error::Connection(msg),
            WireError::Serialization(msg) => Error::Serialization(msg),
            WireError::Other(_) => Error::Broker(BrokerCode::Unknown),
        }
    }
}

/// Build a response from a cluster result.
pub(crate) fn respond<T>(result: Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(v) => ok(v),
        Err(e) => Response::Error(WireError::from(&e)),
    }
}

/// Turn an unexpected response variant into an error.
pub(crate) fn unexpected(op: &str, response: Response) -> Error {
    match response {
        Response::Error(e) => e.into(),
        other => Error::Serialization(format!("unexpected response to {}: {:?}", op, other)),
    }
}

/// Encode one frame.
pub fn encode_frame<T: Serialize>(correlation_id: i32, body: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(body)?;
    let size = json.len() + 4;
    if size > MAX_FRAME_SIZE {
        return Err(Error::Serialization(format!(
            "frame size {} exceeds maximum {}",
            size, MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + json.len());
    buf.put_i32(size as i32);
    buf.put_i32(correlation_id);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Decode the correlation id and body of one frame, size prefix included.
pub fn decode_frame<T: DeserializeOwned>(mut frame: &[u8]) -> Result<(i32, T)> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(Error::Serialization(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let size = frame.get_i32();
    if size < 4 || size as usize != frame.len() {
        return Err(Error::Serialization(format!(
            "frame size {} does not match payload of {} bytes",
            size,
            frame.len()
        )));
    }
    let correlation_id = frame.get_i32();
    Ok((correlation_id, serde_json::from_slice(frame)?))
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, correlation_id: i32, body: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(correlation_id, body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed cleanly between
/// frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<(i32, T)>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let size = match reader.read_i32().await {
        Ok(size) => size,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if size < 4 {
        return Err(Error::Serialization(format!("invalid frame size: {}", size)));
    }
    let size = size as usize;
    if size > MAX_FRAME_SIZE {
        return Err(Error::Serialization(format!(
            "frame size {} exceeds maximum {}",
            size, MAX_FRAME_SIZE
        )));
    }

    let correlation_id = reader.read_i32().await?;
    let mut body = vec![0u8; size - 4];
    reader.read_exact(&mut body).await?;
    tracing::trace!(correlation_id, size, "Read frame");

    Ok(Some((correlation_id, serde_json::from_slice(&body)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(7, &Request::Ping).unwrap();
        let mut header = &frame[..FRAME_HEADER_SIZE];
        assert_eq!(header.get_i32() as usize, frame.len() - 4);
        assert_eq!(header.get_i32(), 7);

        let (id, request): (i32, Request) = decode_frame(&frame).unwrap();
        assert_eq!(id, 7);
        assert_eq!(request, Request::Ping);
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        let mut frame = BytesMut::from(&encode_frame(1, &Request::Ping).unwrap()[..]);
        frame[3] = frame[3].wrapping_add(1);
        assert!(decode_frame::<Request>(&frame).is_err());
        assert!(decode_frame::<Request>(&[0, 0]).is_err());
    }

    #[test]
    fn test_error_crosses_the_wire() {
        let response = respond(Err(Error::Broker(BrokerCode::IllegalGeneration)), |()| {
            Response::Ack
        });
        let frame = encode_frame(3, &response).unwrap();
        let (_, decoded): (i32, Response) = decode_frame(&frame).unwrap();
        assert_eq!(
            unexpected("heartbeat", decoded),
            Error::Broker(BrokerCode::IllegalGeneration)
        );
    }

    #[test]
    fn test_request_names() {
        let request = Request::CommittedOffset {
            group_id: "g".into(),
            partition: TopicPartition::new("t", 0),
        };
        assert_eq!(request.name(), "committed_offset");
        assert_eq!(Request::Ping.name(), "ping");
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::Fetch {
            topic: "t".into(),
            partition: PartitionIndex(1),
            offset: Offset(4),
            max_records: 10,
        };
        write_frame(&mut client, 42, &request).await.unwrap();
        drop(client);

        let (id, read): (i32, Request) = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(id, 42);
        assert_eq!(read, request);
        assert!(read_frame::<_, Request>(&mut server).await.unwrap().is_none());
    }
}
