//! Records on their way into and out of the log.
//!
//! A [`ProducerRecord`] is what a producer buffers. Records bound for the same
//! partition are packed into a [`RecordBatch`], the unit of transmission, and
//! the broker hands them back to consumers as offset-stamped [`Message`]s.
//!
//! # Batch Layout
//!
//! The batch payload is the compressed concatenation of:
//!
//! ```text
//! timestamp   i64
//! key_len     i32   (-1 for a null key)
//! key         [u8; key_len]
//! value_len   i32
//! value       [u8; value_len]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::compression::{self, CompressionCodec};
use crate::error::{Error, Result};
use crate::types::{Offset, PartitionIndex, TopicPartition, now_ms};

/// A record read from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub partition: PartitionIndex,
    pub key: Option<Bytes>,
    /// JSON payload.
    pub value: Bytes,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub offset: Offset,
}

impl Message {
    /// Decode the JSON payload.
    ///
    /// Malformed payloads produce [`Error::Serialization`] rather than a
    /// panic, so one bad record cannot take down a processor.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            Error::Serialization(format!(
                "{} offset {}: {}",
                self.topic_partition(),
                self.offset,
                e
            ))
        })
    }

    /// The key as UTF-8, if present and valid.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }
}

/// A record accepted by the producer but not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// [`PartitionIndex::ANY`] lets the partitioner choose.
    pub partition: PartitionIndex,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

impl ProducerRecord {
    /// A record with a raw value, no key and no explicit partition.
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: PartitionIndex::ANY,
            key: None,
            value: value.into(),
            timestamp: now_ms(),
        }
    }

    /// A record whose value is `value` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        key: Option<&str>,
        value: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        let mut record = Self::new(topic, payload);
        record.key = key.map(|k| Bytes::copy_from_slice(k.as_bytes()));
        Ok(record)
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = PartitionIndex(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Strip the routing fields, keeping what the batch carries.
    pub fn to_batch_record(&self) -> BatchRecord {
        BatchRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A record inside a batch. Topic and partition belong to the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

/// Smallest encoded record: timestamp, null key marker and value length.
const MIN_RECORD_SIZE: usize = 16;

/// A compressed group of records for a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub codec: CompressionCodec,
    pub record_count: i32,
    pub payload: Bytes,
}

impl RecordBatch {
    /// Encode and compress `records`.
    pub fn encode(records: &[BatchRecord], codec: CompressionCodec) -> Result<Self> {
        let size: usize = records
            .iter()
            .map(|r| MIN_RECORD_SIZE + r.key.as_ref().map_or(0, |k| k.len()) + r.value.len())
            .sum();
        let mut buf = BytesMut::with_capacity(size);

        for record in records {
            buf.put_i64(record.timestamp);
            match &record.key {
                Some(key) => {
                    buf.put_i32(key.len() as i32);
                    buf.put_slice(key);
                }
                None => buf.put_i32(-1),
            }
            buf.put_i32(record.value.len() as i32);
            buf.put_slice(&record.value);
        }

        let payload = compression::compress(&buf, codec)?;
        Ok(Self {
            codec,
            record_count: records.len() as i32,
            payload: Bytes::from(payload),
        })
    }

    /// Decompress and decode the records in this batch.
    pub fn decode(&self) -> Result<Vec<BatchRecord>> {
        if self.record_count < 0 {
            return Err(Error::Serialization(format!(
                "negative record count {}",
                self.record_count
            )));
        }

        let raw = compression::decompress(&self.payload, self.codec)?;
        let mut buf = Bytes::from(raw);
        // The count comes off the wire; the payload bounds what it can hold.
        let capacity = (self.record_count as usize).min(buf.len() / MIN_RECORD_SIZE);
        let mut records = Vec::with_capacity(capacity);

        for _ in 0..self.record_count {
            if buf.remaining() < 12 {
                return Err(truncated());
            }
            let timestamp = buf.get_i64();
            let key = match buf.get_i32() {
                -1 => None,
                len if len < 0 => return Err(truncated()),
                len => Some(take(&mut buf, len as usize)?),
            };
            if buf.remaining() < 4 {
                return Err(truncated());
            }
            let value_len = buf.get_i32();
            if value_len < 0 {
                return Err(truncated());
            }
            let value = take(&mut buf, value_len as usize)?;
            records.push(BatchRecord {
                key,
                value,
                timestamp,
            });
        }

        if buf.has_remaining() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after {} records",
                buf.remaining(),
                self.record_count
            )));
        }

        Ok(records)
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn truncated() -> Error {
    Error::Serialization("truncated record batch".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: Option<&'static str>, value: &'static str) -> BatchRecord {
        BatchRecord {
            key: key.map(|k| Bytes::from_static(k.as_bytes())),
            value: Bytes::from_static(value.as_bytes()),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_batch_preserves_order_and_null_keys() {
        let records = vec![
            record(Some("tx1"), r#"{"n":1}"#),
            record(None, r#"{"n":2}"#),
            record(Some(""), r#"{"n":3}"#),
        ];
        let batch = RecordBatch::encode(&records, CompressionCodec::Snappy).unwrap();
        assert_eq!(batch.record_count, 3);
        assert_eq!(batch.decode().unwrap(), records);
    }

    #[test]
    fn test_empty_batch() {
        let batch = RecordBatch::encode(&[], CompressionCodec::Gzip).unwrap();
        assert!(batch.is_empty());
        assert!(batch.decode().unwrap().is_empty());
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let mut batch =
            RecordBatch::encode(&[record(None, "{}")], CompressionCodec::None).unwrap();
        batch.record_count = 2;
        assert!(matches!(batch.decode(), Err(Error::Serialization(_))));

        batch.record_count = 0;
        assert!(matches!(batch.decode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_oversized_count_is_rejected_without_allocating() {
        let batch = RecordBatch {
            codec: CompressionCodec::None,
            record_count: i32::MAX,
            payload: Bytes::new(),
        };
        assert!(matches!(batch.decode(), Err(Error::Serialization(_))));

        let one = RecordBatch::encode(&[record(Some("k"), "{}")], CompressionCodec::None).unwrap();
        let inflated = RecordBatch {
            record_count: i32::MAX,
            ..one
        };
        assert!(matches!(inflated.decode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let batch = RecordBatch::encode(&[record(Some("k"), "{}")], CompressionCodec::None)
            .unwrap();
        let cut = RecordBatch {
            payload: batch.payload.slice(..batch.payload.len() - 1),
            ..batch
        };
        assert!(matches!(cut.decode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_message_json() {
        let message = Message {
            topic: "contributions".into(),
            partition: PartitionIndex(0),
            key: Some(Bytes::from_static(b"0xabc")),
            value: Bytes::from(json!({"amount": 5}).to_string()),
            timestamp: 0,
            offset: Offset(7),
        };
        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["amount"], 5);
        assert_eq!(message.key_str(), Some("0xabc"));
    }

    #[test]
    fn test_message_json_malformed() {
        let message = Message {
            topic: "contributions".into(),
            partition: PartitionIndex(1),
            key: None,
            value: Bytes::from_static(b"{oops"),
            timestamp: 0,
            offset: Offset(3),
        };
        let err = message.json::<serde_json::Value>().unwrap_err();
        match err {
            Error::Serialization(msg) => assert!(msg.starts_with("contributions-1 offset 3")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_producer_record_json() {
        let record = ProducerRecord::json("jobs", Some("tx9"), &json!({"id": 9})).unwrap();
        assert_eq!(record.partition, PartitionIndex::ANY);
        assert_eq!(record.key.as_deref(), Some(&b"tx9"[..]));
        assert_eq!(&record.value[..], br#"{"id":9}"#);

        let pinned = record.with_partition(2);
        assert_eq!(pinned.partition, PartitionIndex(2));
    }
}
