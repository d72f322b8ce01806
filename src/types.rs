//! Type-safe wrappers for commit-log primitives.
//!
//! These newtypes keep offsets, partition indexes and generation ids from
//! being mixed up even though they share an integer representation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A message offset within a partition.
///
/// Offsets are assigned by the broker on write, start at 0 and increase by
/// one per record within a partition.
///
/// # Special Values
///
/// - `-1` (`INVALID`/`LATEST`): no committed offset, or "end of log" when
///   used as a reset position.
/// - `-2` (`EARLIEST`): "beginning of log".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset(pub i64);

impl Offset {
    /// Invalid offset, typically used to indicate an unset value.
    pub const INVALID: Self = Offset(-1);

    /// Special offset meaning "earliest available message".
    pub const EARLIEST: Self = Offset(-2);

    /// Special offset meaning "latest available message" (end of log).
    pub const LATEST: Self = Offset(-1);

    /// Create a new offset from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Offset(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is a valid (non-negative) offset.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The offset of the record that follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        Offset(self.0 + 1)
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition index within a topic.
///
/// `-1` (`ANY`) on the produce path means "let the partitioner choose".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PartitionIndex(pub i32);

impl PartitionIndex {
    /// Broker/partitioner chosen partition.
    pub const ANY: Self = PartitionIndex(-1);

    /// Create a new partition index from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        PartitionIndex(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Check if this is a concrete (non-negative) partition.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for PartitionIndex {
    fn from(value: i32) -> Self {
        PartitionIndex(value)
    }
}

impl From<PartitionIndex> for i32 {
    fn from(partition: PartitionIndex) -> Self {
        partition.0
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consumer group generation.
///
/// Generations increase every time group membership changes; requests that
/// carry an older generation are rejected by the coordinator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GenerationId(pub i32);

impl GenerationId {
    /// No generation (member has not joined yet).
    pub const INVALID: Self = GenerationId(-1);

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A topic-partition identifier.
///
/// ```
/// use logbridge::types::TopicPartition;
///
/// let tp = TopicPartition::new("contributions", 0);
/// assert_eq!(tp.to_string(), "contributions-0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// The topic name.
    pub topic: String,
    /// The partition index.
    pub partition: PartitionIndex,
}

impl TopicPartition {
    /// Create a new topic-partition identifier.
    #[inline]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition: PartitionIndex(partition),
        }
    }
}

impl From<(&str, i32)> for TopicPartition {
    fn from((topic, partition): (&str, i32)) -> Self {
        Self::new(topic, partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
