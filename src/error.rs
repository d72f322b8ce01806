//! Crate level errors and broker error codes.
//!
//! # Error Taxonomy
//!
//! - [`Error::Connection`]: broker unreachable or session dropped. Raised at
//!   creation time or surfaced as a terminal stream error. Never retried here.
//! - [`Error::Serialization`]: a payload could not be JSON encoded/decoded,
//!   or a batch/frame could not be decoded.
//! - [`Error::Delivery`]: a produced record was not durably written.
//! - [`Error::Commit`]: an offset commit was refused or failed. Logged only.
//! - [`Error::Rebalance`]: an unexpected rebalance event code. Logged only.
//! - [`Error::Broker`]: the broker answered a request with an error code.
//! - [`Error::Config`]: invalid configuration.

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Pipeline errors.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Broker unreachable, connection dropped or closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A produced record could not be delivered.
    #[error("Delivery to {topic} failed: {reason}")]
    Delivery {
        topic: String,
        key: Option<Bytes>,
        reason: String,
    },

    /// An offset commit failed.
    #[error("Commit error: {0}")]
    Commit(String),

    /// The rebalance callback received an unexpected event code.
    #[error("Rebalance error: {0:?}")]
    Rebalance(BrokerCode),

    /// The broker rejected a request.
    #[error("Broker error: {0:?}")]
    Broker(BrokerCode),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for transient broker conditions worth retrying.
    ///
    /// Connection errors are never retriable at this layer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Broker(
                BrokerCode::RequestTimedOut
                    | BrokerCode::LeaderNotAvailable
                    | BrokerCode::NotEnoughReplicas
                    | BrokerCode::CoordinatorLoadInProgress
            )
        )
    }

    /// Returns true if this error means the connection is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// The broker code carried by this error, if any.
    pub fn code(&self) -> Option<BrokerCode> {
        match self {
            Error::Broker(code) | Error::Rebalance(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Connection(format!("{:?}: {}", e.kind(), e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Error and event codes exchanged with the broker.
///
/// Non-negative values mirror the commit-log wire protocol. Negative values
/// below -100 are client-side event codes; the two rebalance events are
/// delivered to the rebalance callback rather than raised as errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum BrokerCode {
    /// Client-side event: partitions are being assigned to this member.
    AssignPartitions = -175,
    /// Client-side event: partitions are being revoked from this member.
    RevokePartitions = -174,
    /// Client-side: the local send queue is full.
    QueueFull = -184,
    /// Client-side: all brokers are down.
    AllBrokersDown = -187,
    /// Client-side: transport failure.
    Transport = -195,
    /// An unexpected server error.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range held by the broker.
    OffsetOutOfRange = 1,
    /// The message contents could not be decoded.
    CorruptMessage = 2,
    /// Topic or partition does not exist.
    UnknownTopicOrPartition = 3,
    /// No leader for the partition.
    LeaderNotAvailable = 5,
    /// The request exceeded its time limit.
    RequestTimedOut = 7,
    /// Message larger than the broker accepts.
    MessageSizeTooLarge = 10,
    /// Group metadata is still loading.
    CoordinatorLoadInProgress = 14,
    /// Illegal topic name.
    InvalidTopic = 17,
    /// Not enough in-sync replicas.
    NotEnoughReplicas = 19,
    /// Request generation is not the current group generation.
    IllegalGeneration = 22,
    /// Empty or malformed group id.
    InvalidGroupId = 24,
    /// Member is not part of the current generation.
    UnknownMemberId = 25,
    /// The coordinator has started rebalancing the group.
    RebalanceInProgress = 27,
}

impl BrokerCode {
    /// Raw wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decode a raw wire value, mapping unknown values to [`BrokerCode::Unknown`].
    pub fn from_raw(value: i32) -> Self {
        num_traits::FromPrimitive::from_i32(value).unwrap_or(BrokerCode::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_broker_code_from_primitive() {
        assert_eq!(BrokerCode::from_i32(-175), Some(BrokerCode::AssignPartitions));
        assert_eq!(BrokerCode::from_i32(-174), Some(BrokerCode::RevokePartitions));
        assert_eq!(BrokerCode::from_i32(27), Some(BrokerCode::RebalanceInProgress));
        assert_eq!(BrokerCode::from_i32(9999), None);
    }

    #[test]
    fn test_broker_code_from_raw_unknown() {
        assert_eq!(BrokerCode::from_raw(9999), BrokerCode::Unknown);
        assert_eq!(BrokerCode::from_raw(0), BrokerCode::None);
    }

    #[test]
    fn test_broker_code_round_trip() {
        for code in [
            BrokerCode::AssignPartitions,
            BrokerCode::RevokePartitions,
            BrokerCode::IllegalGeneration,
            BrokerCode::UnknownMemberId,
        ] {
            assert_eq!(BrokerCode::from_raw(code.as_i32()), code);
        }
    }

    #[test]
    fn test_retriable_codes() {
        assert!(Error::Broker(BrokerCode::RequestTimedOut).is_retriable());
        assert!(Error::Broker(BrokerCode::LeaderNotAvailable).is_retriable());
        assert!(!Error::Broker(BrokerCode::MessageSizeTooLarge).is_retriable());
        assert!(!Error::Connection("down".into()).is_retriable());
    }

    #[test]
    fn test_io_error_maps_to_connection() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(err.is_connection());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_delivery_error_display() {
        let err = Error::Delivery {
            topic: "contributions".into(),
            key: Some(Bytes::from_static(b"tx1")),
            reason: "queue full".into(),
        };
        assert_eq!(err.to_string(), "Delivery to contributions failed: queue full");
    }

    #[test]
    fn test_code_accessor() {
        assert_eq!(
            Error::Rebalance(BrokerCode::Unknown).code(),
            Some(BrokerCode::Unknown)
        );
        assert_eq!(Error::Commit("x".into()).code(), None);
    }
}
