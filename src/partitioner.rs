//! Partition selection for produced records.
//!
//! Keyed records are placed on a consistent hash ring built over the topic's
//! partitions, so a key always lands on the same partition for a given
//! partition count. Unkeyed records are spread uniformly at random.

use std::sync::Arc;

use conhash::{ConsistentHash, Node};
use dashmap::DashMap;
use rand::Rng;

use crate::constants::VIRTUAL_NODES_PER_PARTITION;
use crate::types::PartitionIndex;

/// A partition as a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartitionNode(i32);

impl Node for PartitionNode {
    fn name(&self) -> String {
        format!("partition-{}", self.0)
    }
}

/// Chooses partitions for records that do not name one.
///
/// Rings are built once per partition count and shared.
#[derive(Default)]
pub struct Partitioner {
    rings: DashMap<i32, Arc<ConsistentHash<PartitionNode>>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a partition in `0..partition_count`.
    pub fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> PartitionIndex {
        if partition_count <= 1 {
            return PartitionIndex(0);
        }

        match key {
            Some(key) => self.keyed(key, partition_count),
            None => PartitionIndex(rand::thread_rng().gen_range(0..partition_count)),
        }
    }

    fn keyed(&self, key: &[u8], partition_count: i32) -> PartitionIndex {
        let ring = self
            .rings
            .entry(partition_count)
            .or_insert_with(|| Arc::new(build_ring(partition_count)))
            .clone();

        match ring.get(key) {
            Some(node) => PartitionIndex(node.0),
            None => PartitionIndex(0),
        }
    }
}

fn build_ring(partition_count: i32) -> ConsistentHash<PartitionNode> {
    let mut ring = ConsistentHash::new();
    for p in 0..partition_count {
        ring.add(&PartitionNode(p), VIRTUAL_NODES_PER_PARTITION);
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_single_partition() {
        let partitioner = Partitioner::new();
        assert_eq!(partitioner.partition(Some(b"k"), 1), PartitionIndex(0));
        assert_eq!(partitioner.partition(None, 1), PartitionIndex(0));
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let partitioner = Partitioner::new();
        let used: HashSet<i32> = (0..500)
            .map(|i| format!("0x{:064x}", i))
            .map(|k| partitioner.partition(Some(k.as_bytes()), 4).value())
            .collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_unkeyed_records_stay_in_range() {
        let partitioner = Partitioner::new();
        for _ in 0..200 {
            let p = partitioner.partition(None, 3).value();
            assert!((0..3).contains(&p));
        }
    }

    proptest! {
        #[test]
        fn prop_same_key_same_partition(key in proptest::collection::vec(any::<u8>(), 0..64), count in 1i32..32) {
            let a = Partitioner::new();
            let b = Partitioner::new();
            let first = a.partition(Some(&key), count);
            prop_assert_eq!(first, a.partition(Some(&key), count));
            prop_assert_eq!(first, b.partition(Some(&key), count));
            prop_assert!(first.value() >= 0 && first.value() < count);
        }
    }
}
