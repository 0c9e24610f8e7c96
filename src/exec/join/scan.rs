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
//! Post-probe sweep of the build side.
//!
//! Runs only after every probe worker has finished, for join types whose
//! "outer" answer lives on the build side. Workers own disjoint partitions;
//! each iterates its rows and emits those whose used flag matches the scan
//! mode, null-extended on the probe side for outer joins and build columns
//! alone for build-side semi/anti.

use std::sync::{Arc, Mutex};

use crate::common::error::{JoinError, JoinResult};
use crate::exec::join::desc::{OutputLayout, ScanEmit};
use crate::exec::join::engine::{AbortCell, CancelGuard, ChunkSink, JoinRuntimeStats, ProbeStep};
use crate::exec::join::probe::{OutputChunkBuilder, ProbeShared, push_finished};
use crate::exec::join::row_table::RowPtr;
use crate::runtime::cancel::CancelToken;

/// Resumable scan over the partitions assigned to one worker.
pub(crate) struct ScanRowTable {
    shared: Arc<ProbeShared>,
    partitions: Vec<usize>,
    partition_cursor: usize,
    segment_cursor: usize,
    row_cursor: usize,
    done: bool,
}

impl ScanRowTable {
    /// Shard partitions across workers; assignments are disjoint.
    pub(crate) fn new(shared: Arc<ProbeShared>, worker_id: usize, worker_count: usize) -> Self {
        let partitions = (0..shared.row_table.partition_count())
            .filter(|p| p % worker_count.max(1) == worker_id)
            .collect();
        Self {
            shared,
            partitions,
            partition_cursor: 0,
            segment_cursor: 0,
            row_cursor: 0,
            done: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Emit scan rows until the output fills or the assignment is finished.
    pub(crate) fn scan(
        &mut self,
        out: &mut OutputChunkBuilder,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        let shared = Arc::clone(&self.shared);
        let emit_used = match shared.strategy.scan {
            ScanEmit::MatchedBuildOnly => true,
            ScanEmit::UnmatchedWithNullProbe | ScanEmit::UnmatchedBuildOnly => false,
            ScanEmit::None => {
                return Err(JoinError::invariant("scan stage for a non-scan join type"));
            }
        };

        while self.partition_cursor < self.partitions.len() {
            let partition = self.partitions[self.partition_cursor];
            let segments = shared.row_table.segments(partition)?;
            while self.segment_cursor < segments.len() {
                let segment = &segments[self.segment_cursor];
                while self.row_cursor < segment.row_count() {
                    guard.tick()?;
                    if out.is_full() {
                        return Ok(ProbeStep::BatchFull);
                    }
                    let row = self.row_cursor;
                    self.row_cursor += 1;
                    stats.scanned_rows += 1;
                    if shared.meta.is_used(segment, row)? != emit_used {
                        continue;
                    }
                    let ptr = RowPtr::new(partition, self.segment_cursor, row)?;
                    out.append_build_row(&shared, ptr)?;
                }
                self.segment_cursor += 1;
                self.row_cursor = 0;
            }
            self.partition_cursor += 1;
            self.segment_cursor = 0;
        }
        self.done = true;
        Ok(ProbeStep::ChunkDone)
    }
}

/// One scan worker: sweep assigned partitions and push finished chunks.
pub(crate) fn scan_worker(
    shared: &Arc<ProbeShared>,
    sink: &Mutex<&mut dyn ChunkSink>,
    abort: &AbortCell,
    cancel: &CancelToken,
    cancel_check_interval: usize,
    worker_id: usize,
    worker_count: usize,
) -> JoinResult<JoinRuntimeStats> {
    let mut stats = JoinRuntimeStats::default();
    let (layout, null_probe_side) = match shared.strategy.scan {
        ScanEmit::UnmatchedWithNullProbe => (OutputLayout::PairsBoth, true),
        ScanEmit::MatchedBuildOnly | ScanEmit::UnmatchedBuildOnly => {
            (OutputLayout::BuildOnly, false)
        }
        ScanEmit::None => return Ok(stats),
    };

    let mut scan = ScanRowTable::new(Arc::clone(shared), worker_id, worker_count);
    let mut out = OutputChunkBuilder::new(shared, layout, null_probe_side)?;
    let mut guard = CancelGuard::new(abort, cancel, cancel_check_interval);
    while !scan.is_done() {
        match scan.scan(&mut out, &mut guard, &mut stats)? {
            ProbeStep::BatchFull => push_finished(&mut out, sink, &mut stats)?,
            ProbeStep::ChunkDone => break,
        }
    }
    push_finished(&mut out, sink, &mut stats)?;
    Ok(stats)
}
