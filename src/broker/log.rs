//! Partition logs for the embedded broker.

use std::collections::VecDeque;

use crate::message::{BatchRecord, Message};
use crate::types::{Offset, PartitionIndex};

/// Append-only log for one partition.
///
/// Offsets start at 0 and increase by one per record. With a retention
/// limit, the oldest records are evicted and `earliest_offset` advances.
#[derive(Debug)]
pub struct PartitionLog {
    topic: String,
    partition: PartitionIndex,
    records: VecDeque<Message>,
    /// Offset of the first retained record.
    earliest_offset: i64,
    /// Offset the next appended record receives.
    high_watermark: i64,
    retention: Option<usize>,
}

impl PartitionLog {
    pub fn new(topic: impl Into<String>, partition: PartitionIndex, retention: Option<usize>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records: VecDeque::new(),
            earliest_offset: 0,
            high_watermark: 0,
            retention,
        }
    }

    /// Append records in order. Returns the offset of the first one.
    pub fn append(&mut self, records: Vec<BatchRecord>) -> Offset {
        let base = self.high_watermark;
        for record in records {
            self.records.push_back(Message {
                topic: self.topic.clone(),
                partition: self.partition,
                key: record.key,
                value: record.value,
                timestamp: record.timestamp,
                offset: Offset(self.high_watermark),
            });
            self.high_watermark += 1;
        }
        self.enforce_retention();
        Offset(base)
    }

    fn enforce_retention(&mut self) {
        if let Some(max) = self.retention {
            while self.records.len() > max {
                self.records.pop_front();
                self.earliest_offset += 1;
            }
        }
    }

    /// Read up to `max` records starting at `offset`.
    ///
    /// Returns `None` if `offset` lies outside `earliest..=high_watermark`.
    pub fn read(&self, offset: Offset, max: usize) -> Option<Vec<Message>> {
        let offset = offset.value();
        if offset < self.earliest_offset || offset > self.high_watermark {
            return None;
        }
        let start = (offset - self.earliest_offset) as usize;
        Some(self.records.range(start..).take(max).cloned().collect())
    }

    pub fn earliest_offset(&self) -> Offset {
        Offset(self.earliest_offset)
    }

    pub fn high_watermark(&self) -> Offset {
        Offset(self.high_watermark)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn records(n: usize) -> Vec<BatchRecord> {
        (0..n)
            .map(|i| BatchRecord {
                key: None,
                value: Bytes::from(format!("{{\"n\":{}}}", i)),
                timestamp: i as i64,
            })
            .collect()
    }

    #[test]
    fn test_offsets_are_sequential() {
        let mut log = PartitionLog::new("t", PartitionIndex(0), None);
        assert_eq!(log.append(records(3)), Offset(0));
        assert_eq!(log.append(records(2)), Offset(3));
        assert_eq!(log.high_watermark(), Offset(5));

        let read = log.read(Offset(1), 10).unwrap();
        let offsets: Vec<i64> = read.iter().map(|m| m.offset.value()).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_read_at_end_is_empty() {
        let mut log = PartitionLog::new("t", PartitionIndex(0), None);
        log.append(records(2));
        assert_eq!(log.read(Offset(2), 10).unwrap().len(), 0);
        assert!(log.read(Offset(3), 10).is_none());
    }

    #[test]
    fn test_read_respects_max() {
        let mut log = PartitionLog::new("t", PartitionIndex(0), None);
        log.append(records(10));
        assert_eq!(log.read(Offset(0), 4).unwrap().len(), 4);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let mut log = PartitionLog::new("t", PartitionIndex(1), Some(3));
        log.append(records(5));
        assert_eq!(log.len(), 3);
        assert_eq!(log.earliest_offset(), Offset(2));
        assert!(log.read(Offset(0), 10).is_none());
        assert_eq!(log.read(Offset(2), 10).unwrap()[0].offset, Offset(2));
    }
}
