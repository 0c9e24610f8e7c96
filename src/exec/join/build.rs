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
//! Build-stage workers.
//!
//! Responsibilities:
//! - Pre-build: consume build chunks, serialize and hash keys, encode rows,
//!   and route them into per-(worker, partition) segments sealed at a size
//!   threshold.
//! - Linking: after bucket arrays are sized, prepend every valid row to its
//!   bucket chain, either with exclusive partition ownership or with CAS on
//!   shared bucket heads when workers outnumber partitions.
//!
//! Workers observe the shared abort flag at chunk boundaries and every few
//! hundred linked rows; the first error wins.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::error::{JoinError, JoinResult};
use crate::exec::chunk::column::ColumnView;
use crate::exec::join::engine::{AbortCell, CancelGuard, ChunkSource};
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::join::key_codec::KeyEncoder;
use crate::exec::join::row_layout::TableMeta;
use crate::exec::join::row_table::{RowPtr, RowTable, RowTableSegment, partition_of};
use crate::runtime::cancel::CancelToken;
use crate::runtime::mem_tracker::MemTracker;

/// Immutable inputs shared by every pre-build worker.
pub(crate) struct BuildContext {
    pub meta: Arc<TableMeta>,
    pub encoder: KeyEncoder,
    pub partition_count: usize,
    pub seal_bytes: usize,
    pub tracker: Arc<MemTracker>,
}

/// One worker's sealed segments plus counters, published at Barrier 1.
pub(crate) struct PreBuildOutput {
    pub partitions: Vec<Vec<RowTableSegment>>,
    pub chunks: u64,
    pub rows: u64,
    pub valid_rows: u64,
    pub any_null_key: bool,
    /// Bytes already consumed against the tracker for these segments.
    pub footprint_bytes: usize,
}

pub(crate) fn pre_build_worker(
    ctx: &BuildContext,
    source: &Mutex<&mut dyn ChunkSource>,
    abort: &AbortCell,
    cancel: &CancelToken,
) -> JoinResult<PreBuildOutput> {
    let mut accounted = 0usize;
    let result = pre_build_loop(ctx, source, abort, cancel, &mut accounted);
    match result {
        Ok(mut output) => {
            output.footprint_bytes = accounted;
            Ok(output)
        }
        Err(error) => {
            // Give back what this worker accounted; its segments die here.
            ctx.tracker.release(accounted as i64);
            Err(error)
        }
    }
}

fn pre_build_loop(
    ctx: &BuildContext,
    source: &Mutex<&mut dyn ChunkSource>,
    abort: &AbortCell,
    cancel: &CancelToken,
    accounted: &mut usize,
) -> JoinResult<PreBuildOutput> {
    let partition_count = ctx.partition_count;
    let mut open: Vec<RowTableSegment> = Vec::with_capacity(partition_count);
    open.resize_with(partition_count, RowTableSegment::new);
    let mut sealed: Vec<Vec<RowTableSegment>> = Vec::with_capacity(partition_count);
    sealed.resize_with(partition_count, Vec::new);
    let mut scratch = Vec::new();
    let mut chunks = 0u64;
    let mut rows = 0u64;
    let mut valid_rows = 0u64;
    let mut any_null_key = false;

    loop {
        abort.checkpoint(cancel)?;
        let chunk = {
            let mut guard = source
                .lock()
                .map_err(|_| JoinError::invariant("build source lock poisoned"))?;
            guard.next_chunk().map_err(JoinError::Upstream)?
        };
        let Some(chunk) = chunk else {
            break;
        };
        if chunk.is_empty() {
            continue;
        }

        let mut views = Vec::with_capacity(chunk.columns().len());
        for column in chunk.columns() {
            views.push(ColumnView::try_new(column)?);
        }
        let keys = ctx.encoder.encode(&chunk)?;
        any_null_key |= keys.any_null_in_key();

        for row in 0..chunk.len() {
            ctx.meta.encode_row(&views, row, &keys, &mut scratch)?;
            let hash = keys.hash(row);
            let partition = partition_of(hash, partition_count);
            let valid = keys.has_key[row];
            open[partition].push_row(&scratch, hash, valid)?;
            rows += 1;
            if valid {
                valid_rows += 1;
            }
            if open[partition].arena_bytes() >= ctx.seal_bytes {
                seal_segment(ctx, &mut open[partition], &mut sealed[partition], accounted)?;
            }
        }
        chunks += 1;
    }

    for partition in 0..partition_count {
        if open[partition].row_count() > 0 {
            seal_segment(ctx, &mut open[partition], &mut sealed[partition], accounted)?;
        }
    }

    Ok(PreBuildOutput {
        partitions: sealed,
        chunks,
        rows,
        valid_rows,
        any_null_key,
        footprint_bytes: 0,
    })
}

fn seal_segment(
    ctx: &BuildContext,
    open: &mut RowTableSegment,
    sealed: &mut Vec<RowTableSegment>,
    accounted: &mut usize,
) -> JoinResult<()> {
    let segment = std::mem::replace(open, RowTableSegment::new());
    let footprint = segment.footprint_bytes();
    ctx.tracker.try_consume(footprint as i64)?;
    *accounted += footprint;
    sealed.push(segment);
    Ok(())
}

/// Link every valid row of the given partitions; the caller guarantees no
/// other worker touches these partitions, so plain stores suffice.
pub(crate) fn link_exclusive(
    row_table: &RowTable,
    hash_table: &JoinHashTable,
    partitions: &[usize],
    guard: &mut CancelGuard<'_>,
) -> JoinResult<()> {
    for &partition in partitions {
        let buckets = hash_table.partition(partition)?;
        for (segment_index, segment) in row_table.segments(partition)?.iter().enumerate() {
            for &row in segment.valid_key_positions() {
                guard.tick()?;
                let row = row as usize;
                let ptr = RowPtr::new(partition, segment_index, row)?;
                let bucket = buckets.bucket(segment.hash(row));
                let head = bucket.load(Ordering::Relaxed);
                segment.store_next_ptr(row, RowPtr::from_u64(head))?;
                bucket.store(ptr.as_u64(), Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

/// Link segments drawn from a shared task queue. Multiple workers may hit
/// the same partition, so publication goes through CAS on the bucket head;
/// `next_row_ptr` is written before each CAS attempt.
pub(crate) fn link_shared(
    row_table: &RowTable,
    hash_table: &JoinHashTable,
    tasks: &[(usize, usize)],
    cursor: &AtomicUsize,
    guard: &mut CancelGuard<'_>,
) -> JoinResult<()> {
    loop {
        let task = cursor.fetch_add(1, Ordering::Relaxed);
        let Some(&(partition, segment_index)) = tasks.get(task) else {
            return Ok(());
        };
        let buckets = hash_table.partition(partition)?;
        let segment = row_table
            .segments(partition)?
            .get(segment_index)
            .ok_or_else(|| JoinError::invariant("link task segment out of bounds"))?;
        for &row in segment.valid_key_positions() {
            guard.tick()?;
            let row = row as usize;
            let ptr = RowPtr::new(partition, segment_index, row)?;
            let bucket = buckets.bucket(segment.hash(row));
            let mut head = bucket.load(Ordering::Relaxed);
            loop {
                segment.store_next_ptr(row, RowPtr::from_u64(head))?;
                match bucket.compare_exchange_weak(
                    head,
                    ptr.as_u64(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => head = actual,
                }
            }
        }
    }
}

/// All (partition, segment) pairs, the shared-regime work list.
pub(crate) fn link_task_list(row_table: &RowTable) -> JoinResult<Vec<(usize, usize)>> {
    let mut tasks = Vec::new();
    for partition in 0..row_table.partition_count() {
        for segment_index in 0..row_table.segments(partition)?.len() {
            tasks.push((partition, segment_index));
        }
    }
    Ok(tasks)
}
