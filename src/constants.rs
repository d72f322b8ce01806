//! Centralized defaults and protocol constants.
//!
//! Every magic number used by the pipeline lives here so the defaults read in
//! one place and the configuration layer, the embedded broker and the tests
//! agree on them.
//!
//! # Categories
//!
//! - **Client Constants**: connection and producer defaults
//! - **Consumer Constants**: group membership and poll-loop defaults
//! - **Broker Constants**: embedded broker limits
//! - **Wire Constants**: TCP frame protocol limits

use std::time::Duration;

// =============================================================================
// Client Constants
// =============================================================================

/// Default broker address list.
pub const DEFAULT_BROKERS: &str = "127.0.0.1:9092";

/// Default client identifier.
pub const DEFAULT_CLIENT_ID: &str = "logbridge";

/// How long the producer accumulates records before sending a batch.
pub const DEFAULT_BUFFERING_INTERVAL: Duration = Duration::from_millis(100);

/// Retries for transient produce failures.
pub const DEFAULT_RETRIES: usize = 3;

/// Time allowed for a connection to become ready.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the connection keepalive ping.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Maximum records buffered by a producer before new records are refused.
pub const DEFAULT_QUEUE_BUFFERING_MAX_MESSAGES: usize = 100_000;

/// Virtual nodes per partition on the key hash ring.
pub const VIRTUAL_NODES_PER_PARTITION: usize = 64;

/// Minimum backoff between produce retries.
pub const RETRY_MIN_DELAY: Duration = Duration::from_millis(50);

/// Maximum backoff between produce retries.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Consumer Constants
// =============================================================================

/// Default consumer group id.
pub const DEFAULT_GROUP_ID: &str = "contribution-group";

/// Cadence of the consumer poll loop and producer report polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum records fetched per poll cycle.
pub const DEFAULT_POLL_BATCH_SIZE: usize = 100;

/// Member session timeout. A member silent for longer is expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence of the consumer group heartbeat.
pub const DEFAULT_GROUP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Join/sync rounds before giving up while the group keeps moving.
pub const GROUP_JOIN_ATTEMPTS: usize = 5;

// =============================================================================
// Broker Constants
// =============================================================================

/// Partitions created for auto-created topics.
pub const DEFAULT_TOPIC_PARTITIONS: i32 = 3;

/// Largest single record value accepted by the embedded broker.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Maximum expired members removed per group operation.
///
/// Bounds the work done on a single request when many sessions lapse at once.
pub const MAX_EXPIRATIONS_PER_GROUP: usize = 16;

/// Maximum length of a topic name.
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

// =============================================================================
// Wire Constants
// =============================================================================

/// Largest frame accepted by the TCP broker protocol.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header: length (4 bytes) + correlation id (4 bytes).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Timeout for a single request/response round trip over TCP.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Undelivered delivery reports a producer listener may hold.
pub const DELIVERY_REPORT_CHANNEL_CAPACITY: usize = 1024;

/// Grace period for background tasks during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_are_ordered() {
        assert!(DEFAULT_BUFFERING_INTERVAL < DEFAULT_POLL_INTERVAL);
        assert!(DEFAULT_GROUP_HEARTBEAT_INTERVAL < DEFAULT_SESSION_TIMEOUT);
        assert!(RETRY_MIN_DELAY < RETRY_MAX_DELAY);
    }

    #[test]
    fn test_frame_limits() {
        assert!(MAX_FRAME_SIZE > DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(FRAME_HEADER_SIZE, 8);
    }
}
