// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Chained hash tables over the row table.
//!
//! One fixed-size bucket array per partition; a bucket holds only the head
//! row pointer of its chain and chains run through each row's
//! `next_row_ptr` field. No per-slot metadata, no tombstones, no resize.
//! Bucket heads are atomic so the link phase can insert with plain stores
//! (single owner per partition) or CAS loops (shared partitions); the probe
//! phase only loads.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::error::{JoinError, JoinResult};
use crate::exec::join::row_table::RowPtr;
use crate::runtime::mem_tracker::TrackedBytes;

/// Bucket array for one partition; bucket count is fixed at creation.
pub(crate) struct PartitionHashTable {
    buckets: Box<[AtomicU64]>,
    mask: u64,
}

impl PartitionHashTable {
    /// Bucket count: next power of two at or above the partition's row
    /// count (load factor ~1).
    fn with_row_count(row_count: usize) -> Self {
        let bucket_count = row_count.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || AtomicU64::new(0));
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: (bucket_count - 1) as u64,
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn bucket(&self, hash: u64) -> &AtomicU64 {
        &self.buckets[(hash & self.mask) as usize]
    }

    pub(crate) fn bucket_at(&self, index: usize) -> JoinResult<&AtomicU64> {
        self.buckets
            .get(index)
            .ok_or_else(|| JoinError::invariant("bucket index out of bounds"))
    }

    /// Chain head for `hash`; null when the bucket is empty.
    pub(crate) fn head(&self, hash: u64) -> RowPtr {
        RowPtr::from_u64(self.bucket(hash).load(Ordering::Relaxed))
    }
}

/// All per-partition bucket arrays of one join.
pub(crate) struct JoinHashTable {
    partitions: Vec<PartitionHashTable>,
    _tracked: Option<TrackedBytes>,
}

impl JoinHashTable {
    /// Allocate zeroed bucket arrays sized from per-partition row counts,
    /// accounting the allocation against `tracked`.
    pub(crate) fn with_partition_rows(
        row_counts: &[usize],
        tracked: Option<TrackedBytes>,
    ) -> Self {
        let partitions = row_counts
            .iter()
            .map(|&rows| PartitionHashTable::with_row_count(rows))
            .collect();
        Self {
            partitions,
            _tracked: tracked,
        }
    }

    /// Bytes the bucket arrays will occupy for the given row counts.
    pub(crate) fn projected_bytes(row_counts: &[usize]) -> usize {
        row_counts
            .iter()
            .map(|&rows| rows.max(1).next_power_of_two() * std::mem::size_of::<u64>())
            .sum()
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition(&self, partition: usize) -> JoinResult<&PartitionHashTable> {
        self.partitions
            .get(partition)
            .ok_or_else(|| JoinError::invariant("hash table partition out of bounds"))
    }

    /// Chain head for a hash within its partition.
    pub(crate) fn head(&self, partition: usize, hash: u64) -> JoinResult<RowPtr> {
        Ok(self.partition(partition)?.head(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_count_is_power_of_two_at_load_factor_one() {
        let table = PartitionHashTable::with_row_count(0);
        assert_eq!(table.bucket_count(), 1);
        let table = PartitionHashTable::with_row_count(5);
        assert_eq!(table.bucket_count(), 8);
        let table = PartitionHashTable::with_row_count(8);
        assert_eq!(table.bucket_count(), 8);
    }

    #[test]
    fn empty_buckets_read_as_null_chains() {
        let table = JoinHashTable::with_partition_rows(&[4, 4], None);
        assert_eq!(table.partition_count(), 2);
        assert!(table.head(0, 0xDEAD).expect("head").is_null());
        assert!(table.head(1, u64::MAX).expect("head").is_null());
        assert!(table.partition(2).is_err());
    }

    #[test]
    fn insert_prepends_to_chain() {
        let table = PartitionHashTable::with_row_count(4);
        let hash = 0x1234u64;
        let first = RowPtr::new(0, 0, 0).expect("ptr");
        let bucket = table.bucket(hash);
        bucket.store(first.as_u64(), Ordering::Relaxed);
        assert_eq!(table.head(hash), first);

        let second = RowPtr::new(0, 0, 1).expect("ptr");
        let head = bucket.load(Ordering::Relaxed);
        assert_eq!(head, first.as_u64());
        bucket.store(second.as_u64(), Ordering::Relaxed);
        assert_eq!(table.head(hash), second);
    }
}
