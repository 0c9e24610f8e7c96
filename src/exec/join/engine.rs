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
//! Join coordinator and public engine API.
//!
//! Responsibilities:
//! - Validates the join specification and derives layout, strategy, and
//!   output schemas once.
//! - Drives the two stages: `build` spawns pre-build workers, sizes the
//!   bucket arrays, and spawns link workers; `probe` spawns probe workers
//!   and, for build-outer variants, scan workers.
//! - Owns the shared abort/first-error protocol and the stage barriers
//!   (each `thread::scope` join is a barrier, giving probe a
//!   happens-before view of every build write).
//!
//! The engine holds no process-wide state; everything is scoped to one
//! instance and freed on drop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use arrow::array::BooleanArray;
use arrow::datatypes::SchemaRef;

use crate::common::error::{JoinError, JoinResult};
use crate::common::logging::debug;
use crate::common::options::EngineOptions;
use crate::exec::chunk::{Chunk, concat_schemas};
use crate::exec::join::build::{
    BuildContext, PreBuildOutput, link_exclusive, link_shared, link_task_list, pre_build_worker,
};
use crate::exec::join::desc::{JoinKeyDesc, JoinStrategy, JoinType, OutputLayout};
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::join::key_codec::{KeyEncoder, KeyLayout, key_layout};
use crate::exec::join::probe::{ProbeShared, probe_worker};
use crate::exec::join::row_layout::TableMeta;
use crate::exec::join::row_table::{
    MAX_PARTITIONS, MAX_SEGMENTS_PER_PARTITION, RowTable, RowTableSegment,
};
use crate::exec::join::scan::scan_worker;
use crate::runtime::cancel::CancelToken;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

/// Pull interface for build and probe inputs. Errors are wrapped as
/// `JoinError::Upstream`.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, String>;
}

/// Push interface for joined output. Errors are wrapped as
/// `JoinError::Sink`. Chunks already pushed are not rolled back on error.
pub trait ChunkSink: Send {
    fn push_chunk(&mut self, chunk: Chunk) -> Result<(), String>;
}

/// Non-equi residual condition evaluated over materialized candidate
/// chunks in the join-scope schema (probe and build columns, left-right
/// order). A null in the returned mask counts as no-match.
pub trait ResidualPredicate: Send + Sync {
    /// Build-schema columns the predicate reads; only these are decoded
    /// for candidate evaluation.
    fn required_build_columns(&self) -> Vec<usize>;

    fn evaluate(&self, candidate: &Chunk) -> Result<BooleanArray, String>;
}

/// Join configuration: inputs, key tuple, and semantics.
#[derive(Clone)]
pub struct JoinSpec {
    pub join_type: JoinType,
    /// True when the probe side is the left input of the SQL join.
    pub probe_is_left: bool,
    pub build_schema: SchemaRef,
    pub probe_schema: SchemaRef,
    pub keys: Vec<JoinKeyDesc>,
    pub residual: Option<Arc<dyn ResidualPredicate>>,
}

/// Aggregated runtime counters, merged from per-worker tallies after each
/// stage. Observability only; never consulted by the execution paths.
#[derive(Clone, Debug, Default)]
pub struct JoinRuntimeStats {
    pub build_chunks: u64,
    pub build_rows: u64,
    pub build_valid_key_rows: u64,
    pub probe_chunks: u64,
    pub probe_rows: u64,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub key_matched_pairs: u64,
    pub residual_pairs_evaluated: u64,
    pub residual_pairs_passed: u64,
    pub output_rows: u64,
    pub scanned_rows: u64,
}

impl JoinRuntimeStats {
    pub(crate) fn merge_from(&mut self, other: &JoinRuntimeStats) {
        self.build_chunks += other.build_chunks;
        self.build_rows += other.build_rows;
        self.build_valid_key_rows += other.build_valid_key_rows;
        self.probe_chunks += other.probe_chunks;
        self.probe_rows += other.probe_rows;
        self.lookup_hits += other.lookup_hits;
        self.lookup_misses += other.lookup_misses;
        self.key_matched_pairs += other.key_matched_pairs;
        self.residual_pairs_evaluated += other.residual_pairs_evaluated;
        self.residual_pairs_passed += other.residual_pairs_passed;
        self.output_rows += other.output_rows;
        self.scanned_rows += other.scanned_rows;
    }
}

/// Step result of a resumable probe or scan call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeStep {
    BatchFull,
    ChunkDone,
}

/// Shared abort flag plus first-error cell. The first worker error wins;
/// later workers observe the flag at their checkpoints and unwind as
/// cancelled.
pub(crate) struct AbortCell {
    tripped: AtomicBool,
    first_error: Mutex<Option<JoinError>>,
}

impl AbortCell {
    pub(crate) fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    pub(crate) fn trip(&self, error: JoinError) {
        {
            let mut guard = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = Some(error);
            }
        }
        self.tripped.store(true, Ordering::Release);
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub(crate) fn take_error(&self) -> Option<JoinError> {
        self.first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub(crate) fn checkpoint(&self, cancel: &CancelToken) -> JoinResult<()> {
        if cancel.is_cancelled() || self.is_tripped() {
            return Err(JoinError::Cancelled);
        }
        Ok(())
    }
}

/// Periodic cancellation poll for tight chain-walk loops.
pub(crate) struct CancelGuard<'a> {
    abort: &'a AbortCell,
    cancel: &'a CancelToken,
    interval: usize,
    ticks: usize,
}

impl<'a> CancelGuard<'a> {
    pub(crate) fn new(abort: &'a AbortCell, cancel: &'a CancelToken, interval: usize) -> Self {
        Self {
            abort,
            cancel,
            interval: interval.max(1),
            ticks: 0,
        }
    }

    pub(crate) fn tick(&mut self) -> JoinResult<()> {
        self.ticks += 1;
        if self.ticks >= self.interval {
            self.ticks = 0;
            self.abort.checkpoint(self.cancel)?;
        }
        Ok(())
    }
}

/// Parallel in-memory hash join engine.
///
/// Configure once, then drive the two phases: `build` fully consumes and
/// indexes the build input; `probe` streams probe chunks through the index
/// and completes outer/semi/anti variants with the row-table scan.
pub struct HashJoinEngine {
    spec: JoinSpec,
    options: EngineOptions,
    strategy: JoinStrategy,
    meta: Arc<TableMeta>,
    build_key_layout: KeyLayout,
    probe_key_layout: KeyLayout,
    output_schema: SchemaRef,
    join_scope_schema: SchemaRef,
    tracker: Arc<MemTracker>,
    cancel: CancelToken,
    row_table: Option<Arc<RowTable>>,
    hash_table: Option<Arc<JoinHashTable>>,
    build_row_count: usize,
    build_has_null_key: bool,
    stats: JoinRuntimeStats,
}

impl HashJoinEngine {
    pub fn try_new(
        spec: JoinSpec,
        options: EngineOptions,
        tracker: Arc<MemTracker>,
        cancel: CancelToken,
    ) -> JoinResult<Self> {
        let strategy = JoinStrategy::derive(spec.join_type, spec.probe_is_left)?;

        if spec.join_type == JoinType::NullAwareLeftAnti
            && spec.keys.iter().any(|k| k.null_safe_eq)
        {
            return Err(JoinError::unsupported(
                "NULL_AWARE_LEFT_ANTI does not combine with null-safe keys",
            ));
        }
        for key in &spec.keys {
            let build_field = spec.build_schema.fields().get(key.build_column);
            let probe_field = spec.probe_schema.fields().get(key.probe_column);
            match (build_field, probe_field) {
                (Some(b), Some(p)) if b.data_type() == p.data_type() => {}
                (Some(b), Some(p)) => {
                    return Err(JoinError::unsupported(format!(
                        "key column type mismatch: build {} vs probe {}",
                        b.data_type(),
                        p.data_type()
                    )));
                }
                _ => {
                    return Err(JoinError::unsupported(
                        "key column index out of bounds for its schema",
                    ));
                }
            }
        }

        let build_key_layout = key_layout(&spec.keys, &spec.build_schema, true)?;
        let probe_key_layout = key_layout(&spec.keys, &spec.probe_schema, false)?;

        let residual_columns = spec
            .residual
            .as_ref()
            .map(|r| r.required_build_columns())
            .unwrap_or_default();
        let meta = TableMeta::try_new(
            &spec.build_schema,
            &build_key_layout,
            &residual_columns,
            strategy.needs_used_flag(),
        )?;

        if options.effective_partition_count() > MAX_PARTITIONS {
            return Err(JoinError::unsupported(format!(
                "partition count {} exceeds the supported maximum {}",
                options.effective_partition_count(),
                MAX_PARTITIONS
            )));
        }

        let join_scope_schema = if spec.probe_is_left {
            concat_schemas(&spec.probe_schema, &spec.build_schema)
        } else {
            concat_schemas(&spec.build_schema, &spec.probe_schema)
        };
        let output_schema = match strategy.output_layout() {
            OutputLayout::PairsBoth => Arc::clone(&join_scope_schema),
            OutputLayout::ProbeOnly => Arc::clone(&spec.probe_schema),
            OutputLayout::BuildOnly => Arc::clone(&spec.build_schema),
        };

        Ok(Self {
            spec,
            options,
            strategy,
            meta,
            build_key_layout,
            probe_key_layout,
            output_schema,
            join_scope_schema,
            tracker,
            cancel,
            row_table: None,
            hash_table: None,
            build_row_count: 0,
            build_has_null_key: false,
            stats: JoinRuntimeStats::default(),
        })
    }

    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn stats(&self) -> &JoinRuntimeStats {
        &self.stats
    }

    /// Drive the build stage to completion: pre-build, bucket sizing, link.
    pub fn build(&mut self, source: &mut dyn ChunkSource) -> JoinResult<()> {
        if self.row_table.is_some() {
            return Err(JoinError::invariant("build called twice"));
        }
        let worker_count = self.options.worker_count();
        let partition_count = self.options.effective_partition_count();
        let ctx = BuildContext {
            meta: Arc::clone(&self.meta),
            encoder: KeyEncoder::new(self.build_key_layout.clone()),
            partition_count,
            seal_bytes: self.options.effective_segment_seal_bytes(),
            tracker: Arc::clone(&self.tracker),
        };
        let cancel = self.cancel.clone();
        let abort = AbortCell::new();
        let source_mutex = Mutex::new(source);

        // Barrier 1: the scope join ends pre-build before bucket sizing.
        let outputs: Vec<Option<PreBuildOutput>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|_| {
                    scope.spawn(|| match pre_build_worker(&ctx, &source_mutex, &abort, &cancel) {
                        Ok(output) => Some(output),
                        Err(error) => {
                            abort.trip(error);
                            None
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        abort.trip(JoinError::invariant("pre-build worker panicked"));
                        None
                    })
                })
                .collect()
        });

        if let Some(error) = abort.take_error() {
            for output in outputs.into_iter().flatten() {
                self.tracker.release(output.footprint_bytes as i64);
            }
            return Err(error);
        }

        let mut partitions: Vec<Vec<Arc<RowTableSegment>>> = vec![Vec::new(); partition_count];
        let mut total_footprint = 0usize;
        let mut rows = 0u64;
        let mut valid_rows = 0u64;
        let mut chunks = 0u64;
        let mut has_null_key = false;
        let mut merge_error = None;
        for output in outputs.into_iter().flatten() {
            total_footprint += output.footprint_bytes;
            rows += output.rows;
            valid_rows += output.valid_rows;
            chunks += output.chunks;
            has_null_key |= output.any_null_key;
            for (partition, segments) in output.partitions.into_iter().enumerate() {
                for segment in segments {
                    if partitions[partition].len() >= MAX_SEGMENTS_PER_PARTITION {
                        merge_error = Some(JoinError::invariant(
                            "partition segment count overflow",
                        ));
                    }
                    partitions[partition].push(Arc::new(segment));
                }
            }
        }
        let tracked = TrackedBytes::adopt(total_footprint, Arc::clone(&self.tracker));
        let row_table = Arc::new(RowTable::new(
            Arc::clone(&self.meta),
            partitions,
            Some(tracked),
        ));
        if let Some(error) = merge_error {
            return Err(error);
        }

        let row_counts: Vec<usize> = (0..partition_count)
            .map(|p| row_table.partition_row_count(p))
            .collect();
        let bucket_bytes = JoinHashTable::projected_bytes(&row_counts);
        let bucket_tracked = TrackedBytes::try_new(bucket_bytes, Arc::clone(&self.tracker))?;
        let hash_table = Arc::new(JoinHashTable::with_partition_rows(
            &row_counts,
            Some(bucket_tracked),
        ));

        // Barrier 2: all linking completes before probe may start.
        let abort = AbortCell::new();
        let interval = self.options.effective_cancel_check_interval();
        if worker_count <= partition_count {
            let mut assignments: Vec<Vec<usize>> = vec![Vec::new(); worker_count];
            for partition in 0..partition_count {
                assignments[partition % worker_count].push(partition);
            }
            thread::scope(|scope| {
                for assignment in assignments {
                    let row_table = Arc::clone(&row_table);
                    let hash_table = Arc::clone(&hash_table);
                    let abort = &abort;
                    let cancel = &cancel;
                    scope.spawn(move || {
                        let mut guard = CancelGuard::new(abort, cancel, interval);
                        if let Err(error) =
                            link_exclusive(&row_table, &hash_table, &assignment, &mut guard)
                        {
                            abort.trip(error);
                        }
                    });
                }
            });
        } else {
            let tasks = link_task_list(&row_table)?;
            let cursor = AtomicUsize::new(0);
            thread::scope(|scope| {
                for _ in 0..worker_count {
                    let row_table = Arc::clone(&row_table);
                    let hash_table = Arc::clone(&hash_table);
                    let tasks = &tasks;
                    let cursor = &cursor;
                    let abort = &abort;
                    let cancel = &cancel;
                    scope.spawn(move || {
                        let mut guard = CancelGuard::new(abort, cancel, interval);
                        if let Err(error) =
                            link_shared(&row_table, &hash_table, tasks, cursor, &mut guard)
                        {
                            abort.trip(error);
                        }
                    });
                }
            });
        }
        if let Some(error) = abort.take_error() {
            return Err(error);
        }

        self.stats.build_chunks += chunks;
        self.stats.build_rows += rows;
        self.stats.build_valid_key_rows += valid_rows;
        self.build_row_count = rows as usize;
        self.build_has_null_key = has_null_key;
        self.row_table = Some(row_table);
        self.hash_table = Some(hash_table);
        debug!(
            "hash join build complete: join_type={} rows={} valid_rows={} partitions={} workers={} arena_bytes={} bucket_bytes={} key_mode={:?} inlined={} fixed_length={}",
            self.spec.join_type.as_str(),
            rows,
            valid_rows,
            partition_count,
            worker_count,
            total_footprint,
            bucket_bytes,
            self.meta.key_mode(),
            self.meta.join_keys_inlined(),
            self.meta.is_fixed_length()
        );
        Ok(())
    }

    /// Drive probe and, when required, the row-table scan.
    pub fn probe(
        &mut self,
        source: &mut dyn ChunkSource,
        sink: &mut dyn ChunkSink,
    ) -> JoinResult<()> {
        let row_table = self
            .row_table
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| JoinError::invariant("probe called before build completed"))?;
        let hash_table = self
            .hash_table
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| JoinError::invariant("probe called before build completed"))?;

        let worker_count = self.options.worker_count();
        let interval = self.options.effective_cancel_check_interval();
        let shared = Arc::new(ProbeShared {
            meta: Arc::clone(&self.meta),
            row_table,
            hash_table,
            encoder: KeyEncoder::new(self.probe_key_layout.clone()),
            strategy: self.strategy,
            probe_is_left: self.spec.probe_is_left,
            residual: self.spec.residual.clone(),
            output_schema: Arc::clone(&self.output_schema),
            join_scope_schema: Arc::clone(&self.join_scope_schema),
            probe_schema: Arc::clone(&self.spec.probe_schema),
            chunk_size: self.options.effective_chunk_size(),
            pair_buffer_size: self.options.effective_pair_buffer_size(),
            build_row_count: self.build_row_count,
            build_has_null_key: self.build_has_null_key,
        });
        let cancel = self.cancel.clone();
        let abort = AbortCell::new();
        let source_mutex = Mutex::new(source);
        let sink_mutex = Mutex::new(sink);

        // Barrier 3: every probe worker finishes before the scan starts.
        let worker_stats: Vec<Option<JoinRuntimeStats>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|_| {
                    let shared = Arc::clone(&shared);
                    let source_mutex = &source_mutex;
                    let sink_mutex = &sink_mutex;
                    let abort = &abort;
                    let cancel = &cancel;
                    scope.spawn(move || {
                        match probe_worker(&shared, source_mutex, sink_mutex, abort, cancel, interval)
                        {
                            Ok(stats) => Some(stats),
                            Err(error) => {
                                abort.trip(error);
                                None
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        abort.trip(JoinError::invariant("probe worker panicked"));
                        None
                    })
                })
                .collect()
        });
        for stats in worker_stats.into_iter().flatten() {
            self.stats.merge_from(&stats);
        }
        if let Some(error) = abort.take_error() {
            return Err(error);
        }

        if self.strategy.needs_scan_row_table() {
            let abort = AbortCell::new();
            let scan_stats: Vec<Option<JoinRuntimeStats>> = thread::scope(|scope| {
                let handles: Vec<_> = (0..worker_count)
                    .map(|worker_id| {
                        let shared = Arc::clone(&shared);
                        let sink_mutex = &sink_mutex;
                        let abort = &abort;
                        let cancel = &cancel;
                        scope.spawn(move || {
                            match scan_worker(
                                &shared, sink_mutex, abort, cancel, interval, worker_id,
                                worker_count,
                            ) {
                                Ok(stats) => Some(stats),
                                Err(error) => {
                                    abort.trip(error);
                                    None
                                }
                            }
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            abort.trip(JoinError::invariant("scan worker panicked"));
                            None
                        })
                    })
                    .collect()
            });
            for stats in scan_stats.into_iter().flatten() {
                self.stats.merge_from(&stats);
            }
            if let Some(error) = abort.take_error() {
                return Err(error);
            }
        }

        debug!(
            "hash join probe complete: join_type={} probe_rows={} output_rows={} hits={} misses={} scanned={}",
            self.spec.join_type.as_str(),
            self.stats.probe_rows,
            self.stats.output_rows,
            self.stats.lookup_hits,
            self.stats.lookup_misses,
            self.stats.scanned_rows
        );
        Ok(())
    }
}
