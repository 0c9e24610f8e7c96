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
//! Partitioned build-side row storage.
//!
//! Responsibilities:
//! - `Arena` holds encoded rows in one append-only, 8-byte-aligned buffer;
//!   row starts never move once written.
//! - `RowTableSegment` pairs an arena with per-row hash, offset, and
//!   key-validity arrays; immutable after pre-build seals it, except for the
//!   `next_row_ptr` field written during linking and the used-flag bit
//!   or-ed during probe.
//! - `RowTable` groups sealed segments by partition and resolves `RowPtr`s.
//!
//! `RowPtr` packs (partition, segment, row) into a non-zero u64 so a zeroed
//! bucket array reads as all-empty chains.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::common::error::{JoinError, JoinResult};
use crate::exec::join::row_layout::TableMeta;
use crate::runtime::mem_tracker::TrackedBytes;

const ROW_BITS: u32 = 28;
const SEG_BITS: u32 = 20;
const PART_BITS: u32 = 16;

pub(crate) const MAX_ROWS_PER_SEGMENT: usize = 1 << ROW_BITS;
pub(crate) const MAX_SEGMENTS_PER_PARTITION: usize = (1 << SEG_BITS) - 1;
pub(crate) const MAX_PARTITIONS: usize = 1 << PART_BITS;

/// Packed reference to one build row; zero is the null pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RowPtr(u64);

impl RowPtr {
    pub(crate) const NULL: RowPtr = RowPtr(0);

    pub(crate) fn new(partition: usize, segment: usize, row: usize) -> JoinResult<Self> {
        if partition >= MAX_PARTITIONS || segment >= MAX_SEGMENTS_PER_PARTITION
            || row >= MAX_ROWS_PER_SEGMENT
        {
            return Err(JoinError::invariant(format!(
                "row ptr out of range: partition={partition} segment={segment} row={row}"
            )));
        }
        // segment + 1 keeps every encoded pointer non-zero.
        Ok(RowPtr(
            ((partition as u64) << (SEG_BITS + ROW_BITS))
                | (((segment as u64) + 1) << ROW_BITS)
                | row as u64,
        ))
    }

    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn partition(self) -> usize {
        (self.0 >> (SEG_BITS + ROW_BITS)) as usize
    }

    pub(crate) fn segment(self) -> usize {
        (((self.0 >> ROW_BITS) & ((1 << SEG_BITS) - 1)) as usize) - 1
    }

    pub(crate) fn row(self) -> usize {
        (self.0 & ((1 << ROW_BITS) - 1)) as usize
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        RowPtr(raw)
    }
}

/// Append-only byte arena backed by u64 words so every 8-aligned offset
/// supports atomic u64 access.
pub(crate) struct Arena {
    words: Vec<u64>,
    len: usize,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self {
            words: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: words always cover `len` bytes and live as long as `self`.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    /// Append `bytes` at the next 8-aligned offset and return that offset.
    /// The alignment gap and word tails stay zeroed.
    pub(crate) fn push_row(&mut self, bytes: &[u8]) -> usize {
        let start = (self.len + 7) & !7usize;
        let end = start + bytes.len();
        let need_words = end.div_ceil(8);
        if need_words > self.words.len() {
            let grown = need_words.max(self.words.len().saturating_mul(2));
            self.words.resize(grown, 0);
        }
        // SAFETY: the resize above guarantees `end` bytes of backing storage.
        unsafe {
            let dst = (self.words.as_mut_ptr() as *mut u8).add(start);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.len = end;
        start
    }

    fn base_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }
}

/// One sealed run of encoded rows within a partition.
pub(crate) struct RowTableSegment {
    arena: Arena,
    hashes: Vec<u64>,
    row_offsets: Vec<u32>,
    key_valid: Vec<bool>,
    valid_key_positions: Vec<u32>,
}

impl RowTableSegment {
    pub(crate) fn new() -> Self {
        Self {
            arena: Arena::new(),
            hashes: Vec::new(),
            row_offsets: Vec::new(),
            key_valid: Vec::new(),
            valid_key_positions: Vec::new(),
        }
    }

    pub(crate) fn row_count(&self) -> usize {
        self.row_offsets.len()
    }

    pub(crate) fn valid_key_count(&self) -> usize {
        self.valid_key_positions.len()
    }

    pub(crate) fn arena_bytes(&self) -> usize {
        self.arena.len()
    }

    /// Logical footprint for memory accounting.
    pub(crate) fn footprint_bytes(&self) -> usize {
        self.arena.len()
            + self.hashes.len() * 8
            + self.row_offsets.len() * 4
            + self.key_valid.len()
            + self.valid_key_positions.len() * 4
    }

    pub(crate) fn push_row(&mut self, bytes: &[u8], hash: u64, key_valid: bool) -> JoinResult<u32> {
        if self.row_offsets.len() >= MAX_ROWS_PER_SEGMENT {
            return Err(JoinError::invariant("row table segment row count overflow"));
        }
        let offset = self.arena.push_row(bytes);
        let offset = u32::try_from(offset)
            .map_err(|_| JoinError::invariant("row table segment arena offset overflow"))?;
        let row = self.row_offsets.len() as u32;
        self.row_offsets.push(offset);
        self.hashes.push(hash);
        self.key_valid.push(key_valid);
        if key_valid {
            self.valid_key_positions.push(row);
        }
        Ok(row)
    }

    pub(crate) fn hash(&self, row: usize) -> u64 {
        self.hashes[row]
    }

    pub(crate) fn is_key_valid(&self, row: usize) -> bool {
        self.key_valid[row]
    }

    pub(crate) fn valid_key_positions(&self) -> &[u32] {
        &self.valid_key_positions
    }

    /// Arena bytes from this row's start to the end of the arena. Row
    /// decoding walks forward from the start; the row's true extent is
    /// known only to the decoder.
    pub(crate) fn row_bytes_from(&self, row: usize) -> JoinResult<&[u8]> {
        let offset = *self
            .row_offsets
            .get(row)
            .ok_or_else(|| JoinError::invariant("row index out of bounds in segment"))?
            as usize;
        Ok(&self.arena.as_bytes()[offset..])
    }

    fn row_start(&self, row: usize) -> JoinResult<usize> {
        self.row_offsets
            .get(row)
            .map(|v| *v as usize)
            .ok_or_else(|| JoinError::invariant("row index out of bounds in segment"))
    }

    /// Store the chain link of `row`. Called only during the link phase;
    /// each row is linked by exactly one worker.
    pub(crate) fn store_next_ptr(&self, row: usize, next: RowPtr) -> JoinResult<()> {
        let start = self.row_start(row)?;
        // SAFETY: row starts are 8-aligned by Arena::push_row and the first
        // 8 bytes of every row are reserved for the link field.
        let cell = unsafe { &*(self.arena.base_ptr().add(start) as *const AtomicU64) };
        cell.store(next.as_u64(), Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn load_next_ptr(&self, row: usize) -> JoinResult<RowPtr> {
        let start = self.row_start(row)?;
        // SAFETY: same layout argument as `store_next_ptr`.
        let cell = unsafe { &*(self.arena.base_ptr().add(start) as *const AtomicU64) };
        Ok(RowPtr::from_u64(cell.load(Ordering::Relaxed)))
    }

    /// Atomically or `mask` into the byte at `byte_in_row`, returning the
    /// previous value. Used for the used-flag bit during probe.
    pub(crate) fn fetch_or_byte(&self, row: usize, byte_in_row: usize, mask: u8) -> JoinResult<u8> {
        let start = self.row_start(row)?;
        if start + byte_in_row >= self.arena.len() {
            return Err(JoinError::invariant("flag byte outside arena"));
        }
        // SAFETY: in-bounds byte; concurrent or-ing of one bit is the only
        // probe-time mutation and is idempotent.
        let cell = unsafe { &*(self.arena.base_ptr().add(start + byte_in_row) as *const AtomicU8) };
        Ok(cell.fetch_or(mask, Ordering::Relaxed))
    }

    pub(crate) fn load_byte(&self, row: usize, byte_in_row: usize) -> JoinResult<u8> {
        let start = self.row_start(row)?;
        if start + byte_in_row >= self.arena.len() {
            return Err(JoinError::invariant("flag byte outside arena"));
        }
        // SAFETY: in-bounds byte.
        let cell = unsafe { &*(self.arena.base_ptr().add(start + byte_in_row) as *const AtomicU8) };
        Ok(cell.load(Ordering::Relaxed))
    }
}

/// Partition routing: high hash bits select the partition, low bits select
/// the bucket, so the two choices stay independent.
pub(crate) fn partition_of(hash: u64, partition_count: usize) -> usize {
    debug_assert!(partition_count.is_power_of_two());
    let shift = 64 - partition_count.trailing_zeros();
    if shift >= 64 {
        0
    } else {
        (hash >> shift) as usize
    }
}

/// All sealed build rows, grouped by partition.
pub(crate) struct RowTable {
    meta: Arc<TableMeta>,
    partitions: Vec<Vec<Arc<RowTableSegment>>>,
    _tracked: Option<TrackedBytes>,
}

impl RowTable {
    pub(crate) fn new(
        meta: Arc<TableMeta>,
        partitions: Vec<Vec<Arc<RowTableSegment>>>,
        tracked: Option<TrackedBytes>,
    ) -> Self {
        Self {
            meta,
            partitions,
            _tracked: tracked,
        }
    }

    pub(crate) fn meta(&self) -> &Arc<TableMeta> {
        &self.meta
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition_of(&self, hash: u64) -> usize {
        partition_of(hash, self.partitions.len())
    }

    pub(crate) fn segments(&self, partition: usize) -> JoinResult<&[Arc<RowTableSegment>]> {
        self.partitions
            .get(partition)
            .map(|v| v.as_slice())
            .ok_or_else(|| JoinError::invariant("partition index out of bounds"))
    }

    pub(crate) fn segment(&self, ptr: RowPtr) -> JoinResult<&RowTableSegment> {
        let partition = self
            .partitions
            .get(ptr.partition())
            .ok_or_else(|| JoinError::invariant("row ptr partition out of bounds"))?;
        partition
            .get(ptr.segment())
            .map(|s| s.as_ref())
            .ok_or_else(|| JoinError::invariant("row ptr segment out of bounds"))
    }

    pub(crate) fn partition_row_count(&self, partition: usize) -> usize {
        self.partitions
            .get(partition)
            .map(|segments| segments.iter().map(|s| s.row_count()).sum())
            .unwrap_or(0)
    }

    pub(crate) fn partition_valid_key_count(&self, partition: usize) -> usize {
        self.partitions
            .get(partition)
            .map(|segments| segments.iter().map(|s| s.valid_key_count()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_aligns_row_starts() {
        let mut arena = Arena::new();
        let a = arena.push_row(&[1, 2, 3]);
        let b = arena.push_row(&[4, 5]);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert_eq!(b, 8);
        assert_eq!(&arena.as_bytes()[..3], &[1, 2, 3]);
        assert_eq!(&arena.as_bytes()[8..10], &[4, 5]);
        // Alignment gap stays zeroed.
        assert_eq!(&arena.as_bytes()[3..8], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn row_ptr_round_trips_and_rejects_overflow() {
        let ptr = RowPtr::new(3, 7, 1234).expect("ptr");
        assert!(!ptr.is_null());
        assert_eq!(ptr.partition(), 3);
        assert_eq!(ptr.segment(), 7);
        assert_eq!(ptr.row(), 1234);
        assert_eq!(RowPtr::from_u64(ptr.as_u64()), ptr);
        assert!(RowPtr::new(MAX_PARTITIONS, 0, 0).is_err());
        assert!(RowPtr::new(0, MAX_SEGMENTS_PER_PARTITION, 0).is_err());
        assert!(RowPtr::new(0, 0, MAX_ROWS_PER_SEGMENT).is_err());
        assert!(RowPtr::NULL.is_null());
        // Segment zero / row zero must still encode non-zero.
        assert!(!RowPtr::new(0, 0, 0).expect("ptr").is_null());
    }

    #[test]
    fn segment_links_and_flags() {
        let mut segment = RowTableSegment::new();
        let mut row = vec![0u8; 8];
        row.push(0); // one flag byte after the link field
        segment.push_row(&row, 11, true).expect("row 0");
        segment.push_row(&row, 22, false).expect("row 1");

        assert_eq!(segment.row_count(), 2);
        assert_eq!(segment.valid_key_positions(), &[0]);
        assert!(segment.load_next_ptr(0).expect("load").is_null());

        let next = RowPtr::new(0, 0, 1).expect("ptr");
        segment.store_next_ptr(0, next).expect("store");
        assert_eq!(segment.load_next_ptr(0).expect("load"), next);

        assert_eq!(segment.fetch_or_byte(1, 8, 0x1).expect("or"), 0);
        assert_eq!(segment.load_byte(1, 8).expect("load") & 0x1, 0x1);
        // Idempotent.
        assert_eq!(segment.fetch_or_byte(1, 8, 0x1).expect("or"), 1);
    }

    #[test]
    fn partition_routing_uses_high_bits() {
        assert_eq!(partition_of(u64::MAX, 16), 15);
        assert_eq!(partition_of(0, 16), 0);
        assert_eq!(partition_of(u64::MAX, 1), 0);
        let h = 0xABCD_0000_0000_0000u64;
        assert_eq!(partition_of(h, 16), 0xA);
    }
}
