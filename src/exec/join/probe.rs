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
//! Probe-stage workers and join strategies.
//!
//! Responsibilities:
//! - Per probe chunk: hash lookup, chain walk with stored-hash prefilter,
//!   memcmp key comparison, pair buffering, residual evaluation, and output
//!   materialization.
//! - Join-type strategies as `JoinProbe` variants selected once at setup:
//!   pair emission, probe-side semi/anti, build-side marking, and
//!   null-aware anti.
//!
//! A probe is resumable mid-chain: when the output chunk fills, the walk
//! suspends with the current row, chain position, and match flags intact.
//! "Matched" always means post-residual; a probe row whose candidate pairs
//! all fail the residual predicate counts as unmatched.

use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array, new_null_array};
use arrow::compute::take_record_batch;
use arrow::datatypes::SchemaRef;

use crate::common::error::{JoinError, JoinResult};
use crate::exec::chunk::Chunk;
use crate::exec::chunk::column::ColumnBuilder;
use crate::exec::join::desc::{JoinStrategy, OutputLayout, ProbeBehavior};
use crate::exec::join::engine::{
    AbortCell, CancelGuard, ChunkSink, ChunkSource, JoinRuntimeStats, ProbeStep,
    ResidualPredicate,
};
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::join::key_codec::{KeyEncoder, SerializedKeys};
use crate::exec::join::row_layout::{DecodeSet, TableMeta};
use crate::exec::join::row_table::{RowPtr, RowTable};
use crate::runtime::cancel::CancelToken;

/// Read-only state shared by every probe and scan worker.
pub(crate) struct ProbeShared {
    pub meta: Arc<TableMeta>,
    pub row_table: Arc<RowTable>,
    pub hash_table: Arc<JoinHashTable>,
    pub encoder: KeyEncoder,
    pub strategy: JoinStrategy,
    pub probe_is_left: bool,
    pub residual: Option<Arc<dyn ResidualPredicate>>,
    pub output_schema: SchemaRef,
    /// Probe and build columns in left-right order; residual predicates are
    /// evaluated against this shape regardless of the output layout.
    pub join_scope_schema: SchemaRef,
    pub probe_schema: SchemaRef,
    pub chunk_size: usize,
    pub pair_buffer_size: usize,
    pub build_row_count: usize,
    pub build_has_null_key: bool,
}

impl ProbeShared {
    fn mark_used_at(&self, ptr: RowPtr) -> JoinResult<()> {
        let segment = self.row_table.segment(ptr)?;
        self.meta.mark_used(segment, ptr.row())
    }
}

/// Output chunk under assembly.
///
/// Probe-side columns are materialized at `finish` with one vectorized
/// `take` over the bound probe chunk (or as all-null arrays for the scan
/// stage); build-side columns accumulate in per-column builders as rows are
/// decoded from the row table.
pub(crate) struct OutputChunkBuilder {
    layout: OutputLayout,
    probe_is_left: bool,
    output_schema: SchemaRef,
    probe_schema: SchemaRef,
    probe_chunk: Option<Chunk>,
    probe_indices: Vec<u32>,
    null_probe_side: bool,
    build_builders: Vec<ColumnBuilder>,
    rows: usize,
    capacity: usize,
}

impl OutputChunkBuilder {
    pub(crate) fn new(shared: &ProbeShared, layout: OutputLayout, null_probe_side: bool) -> JoinResult<Self> {
        let mut build_builders = Vec::new();
        if layout != OutputLayout::ProbeOnly {
            for data_type in shared.meta.build_types() {
                build_builders.push(ColumnBuilder::try_new(data_type)?);
            }
        }
        Ok(Self {
            layout,
            probe_is_left: shared.probe_is_left,
            output_schema: Arc::clone(&shared.output_schema),
            probe_schema: Arc::clone(&shared.probe_schema),
            probe_chunk: None,
            probe_indices: Vec::new(),
            null_probe_side,
            build_builders,
            rows: 0,
            capacity: shared.chunk_size,
        })
    }

    pub(crate) fn bind_probe_chunk(&mut self, chunk: &Chunk) -> JoinResult<()> {
        if self.rows != 0 {
            return Err(JoinError::invariant(
                "probe chunk rebound with rows pending in the output builder",
            ));
        }
        self.probe_chunk = Some(chunk.clone());
        Ok(())
    }

    pub(crate) fn is_full(&self) -> bool {
        self.rows >= self.capacity
    }

    /// Matched pair: probe row by index, build row decoded from the arena.
    pub(crate) fn append_pair(
        &mut self,
        shared: &ProbeShared,
        probe_row: u32,
        ptr: RowPtr,
    ) -> JoinResult<()> {
        self.probe_indices.push(probe_row);
        let segment = shared.row_table.segment(ptr)?;
        shared
            .meta
            .decode_row(segment, ptr.row(), DecodeSet::All, &mut self.build_builders)?;
        self.rows += 1;
        Ok(())
    }

    /// Unmatched probe row, null-extended on the build side.
    pub(crate) fn append_unmatched_probe(&mut self, probe_row: u32) -> JoinResult<()> {
        self.probe_indices.push(probe_row);
        for builder in self.build_builders.iter_mut() {
            builder.append_null();
        }
        self.rows += 1;
        Ok(())
    }

    /// Probe row alone (semi/anti output).
    pub(crate) fn append_probe_row(&mut self, probe_row: u32) {
        self.probe_indices.push(probe_row);
        self.rows += 1;
    }

    /// Build row alone, or with an all-null probe side for the scan stage.
    pub(crate) fn append_build_row(
        &mut self,
        shared: &ProbeShared,
        ptr: RowPtr,
    ) -> JoinResult<()> {
        let segment = shared.row_table.segment(ptr)?;
        shared
            .meta
            .decode_row(segment, ptr.row(), DecodeSet::All, &mut self.build_builders)?;
        self.rows += 1;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> JoinResult<Option<Chunk>> {
        if self.rows == 0 {
            return Ok(None);
        }
        let rows = self.rows;

        let probe_arrays: Option<Vec<ArrayRef>> = match self.layout {
            OutputLayout::BuildOnly => None,
            _ if self.null_probe_side => Some(
                self.probe_schema
                    .fields()
                    .iter()
                    .map(|f| new_null_array(f.data_type(), rows))
                    .collect(),
            ),
            _ => {
                let chunk = self
                    .probe_chunk
                    .as_ref()
                    .ok_or_else(|| JoinError::invariant("no probe chunk bound to output"))?;
                let indices = UInt32Array::from(std::mem::take(&mut self.probe_indices));
                let taken = take_record_batch(&chunk.batch, &indices)
                    .map_err(|e| JoinError::invariant(format!("probe-side take failed: {e}")))?;
                Some(taken.columns().to_vec())
            }
        };

        let build_arrays: Option<Vec<ArrayRef>> = match self.layout {
            OutputLayout::ProbeOnly => None,
            _ => {
                let mut arrays = Vec::with_capacity(self.build_builders.len());
                for builder in self.build_builders.iter_mut() {
                    let array = builder.finish();
                    if array.len() != rows {
                        return Err(JoinError::invariant(format!(
                            "build output column has {} rows, expected {}",
                            array.len(),
                            rows
                        )));
                    }
                    arrays.push(array);
                }
                Some(arrays)
            }
        };

        let columns = match (self.layout, probe_arrays, build_arrays) {
            (OutputLayout::ProbeOnly, Some(probe), _) => probe,
            (OutputLayout::BuildOnly, _, Some(build)) => build,
            (OutputLayout::PairsBoth, Some(probe), Some(build)) => {
                if self.probe_is_left {
                    probe.into_iter().chain(build).collect()
                } else {
                    build.into_iter().chain(probe).collect()
                }
            }
            _ => return Err(JoinError::invariant("output layout produced no columns")),
        };

        let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)
            .map_err(|e| JoinError::invariant(format!("output chunk assembly failed: {e}")))?;
        self.rows = 0;
        self.probe_indices.clear();
        Ok(Some(Chunk::new(batch)))
    }
}

/// Evaluate the residual predicate over candidate pairs.
///
/// Only the probe columns and the build columns the predicate declares are
/// materialized; other build columns are null placeholders in the
/// join-scope shape. Mask nulls count as false.
fn evaluate_residual(
    shared: &ProbeShared,
    probe_chunk: &Chunk,
    pairs: &[(u32, RowPtr)],
) -> JoinResult<BooleanArray> {
    let residual = shared
        .residual
        .as_ref()
        .ok_or_else(|| JoinError::invariant("residual evaluation without a predicate"))?;

    let mut builders = Vec::with_capacity(shared.meta.column_count());
    for data_type in shared.meta.build_types() {
        builders.push(ColumnBuilder::try_new(data_type)?);
    }
    for &(_, ptr) in pairs {
        let segment = shared.row_table.segment(ptr)?;
        shared
            .meta
            .decode_row(segment, ptr.row(), DecodeSet::PredicateOnly, &mut builders)?;
    }

    let len = pairs.len();
    let mut build_arrays = Vec::with_capacity(builders.len());
    for (column, builder) in builders.iter_mut().enumerate() {
        if shared.meta.predicate_columns().contains(&column) {
            let array = builder.finish();
            if array.len() != len {
                return Err(JoinError::invariant(
                    "residual candidate column length mismatch",
                ));
            }
            build_arrays.push(array);
        } else {
            build_arrays.push(new_null_array(&shared.meta.build_types()[column], len));
        }
    }

    let indices = UInt32Array::from(pairs.iter().map(|&(row, _)| row).collect::<Vec<_>>());
    let probe_batch = take_record_batch(&probe_chunk.batch, &indices)
        .map_err(|e| JoinError::invariant(format!("residual probe take failed: {e}")))?;
    let probe_arrays = probe_batch.columns().to_vec();

    let columns: Vec<ArrayRef> = if shared.probe_is_left {
        probe_arrays.into_iter().chain(build_arrays).collect()
    } else {
        build_arrays.into_iter().chain(probe_arrays).collect()
    };
    let batch = RecordBatch::try_new(Arc::clone(&shared.join_scope_schema), columns)
        .map_err(|e| JoinError::invariant(format!("residual candidate assembly failed: {e}")))?;

    let mask = residual
        .evaluate(&Chunk::new(batch))
        .map_err(JoinError::Predicate)?;
    if mask.len() != len {
        return Err(JoinError::invariant(format!(
            "residual mask has {} rows, expected {}",
            mask.len(),
            len
        )));
    }
    Ok(mask)
}

fn mask_value(mask: &BooleanArray, index: usize) -> bool {
    mask.is_valid(index) && mask.value(index)
}

/// How a chain walk treats key matches.
#[derive(Clone, Copy)]
enum WalkMode {
    /// Buffer (probe row, build row) pairs for a later flush.
    CollectPairs { skip_matched: bool },
    /// No pairs: flag the probe row (and optionally the build row) on the
    /// spot. Only valid without a residual predicate.
    Direct { mark_used: bool, early_stop: bool },
}

/// Per-probe-chunk iteration state, persisted across suspended `probe`
/// calls.
struct ProbeChunkState {
    chunk: Chunk,
    keys: SerializedKeys,
    /// Post-residual matched flag per probe row.
    matched: Vec<bool>,
    row: usize,
    chain: RowPtr,
    resume_chain: bool,
    row_had_match: bool,
    pairs: Vec<(u32, RowPtr)>,
    walk_done: bool,
    emit_cursor: usize,
    emit_done: bool,
    // Null-aware anti only.
    keep_all: bool,
    keep_none: bool,
}

impl ProbeChunkState {
    fn new(chunk: Chunk, keys: SerializedKeys) -> Self {
        let rows = chunk.len();
        Self {
            chunk,
            keys,
            matched: vec![false; rows],
            row: 0,
            chain: RowPtr::NULL,
            resume_chain: false,
            row_had_match: false,
            pairs: Vec::new(),
            walk_done: rows == 0,
            emit_cursor: 0,
            emit_done: false,
            keep_all: false,
            keep_none: false,
        }
    }

    fn is_done(&self) -> bool {
        self.emit_done
    }

    /// Walk probe-row chains from the saved position.
    ///
    /// In `CollectPairs` mode, returns as soon as the pair buffer is full;
    /// `walk_done` is set once every row's chain is exhausted. `Direct`
    /// mode runs to completion.
    fn walk(
        &mut self,
        shared: &ProbeShared,
        guard: &mut CancelGuard<'_>,
        mode: WalkMode,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<()> {
        let rows = self.chunk.len();
        'rows: while self.row < rows {
            let row = self.row;
            if !self.keys.has_key[row] {
                self.row += 1;
                continue;
            }
            if let WalkMode::CollectPairs { skip_matched: true } = mode {
                if self.matched[row] {
                    // A flush between suspensions may have matched this row;
                    // abandon any saved chain position with it.
                    self.resume_chain = false;
                    self.row += 1;
                    continue;
                }
            }
            let hash = self.keys.hash(row);
            let key = self.keys.row(row);
            let mut chain = if self.resume_chain {
                self.resume_chain = false;
                self.chain
            } else {
                let partition = shared.row_table.partition_of(hash);
                shared.hash_table.head(partition, hash)?
            };
            while !chain.is_null() {
                guard.tick()?;
                let segment = shared.row_table.segment(chain)?;
                let segment_row = chain.row();
                let next = segment.load_next_ptr(segment_row)?;
                // Stored-hash prefilter avoids touching row payload bytes.
                if segment.hash(segment_row) == hash
                    && shared.meta.key_matches(segment, segment_row, key)?
                {
                    self.row_had_match = true;
                    match mode {
                        WalkMode::Direct {
                            mark_used,
                            early_stop,
                        } => {
                            self.matched[row] = true;
                            if mark_used {
                                shared.meta.mark_used(segment, segment_row)?;
                            }
                            if early_stop {
                                stats.lookup_hits += 1;
                                self.row_had_match = false;
                                self.row += 1;
                                continue 'rows;
                            }
                        }
                        WalkMode::CollectPairs { .. } => {
                            self.pairs.push((row as u32, chain));
                            stats.key_matched_pairs += 1;
                            if self.pairs.len() >= shared.pair_buffer_size {
                                self.chain = next;
                                self.resume_chain = true;
                                return Ok(());
                            }
                        }
                    }
                }
                chain = next;
            }
            if self.row_had_match {
                stats.lookup_hits += 1;
            } else {
                stats.lookup_misses += 1;
            }
            self.row_had_match = false;
            self.row += 1;
        }
        self.walk_done = true;
        Ok(())
    }

    /// Flush buffered pairs: emit surviving pairs into `out` (when given),
    /// record probe-row matches, and mark build rows when the join needs
    /// used flags.
    fn flush_pairs(
        &mut self,
        shared: &ProbeShared,
        mut out: Option<&mut OutputChunkBuilder>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<()> {
        if self.pairs.is_empty() {
            return Ok(());
        }
        let pairs = std::mem::take(&mut self.pairs);
        let mask = match &shared.residual {
            Some(_) => {
                let mask = evaluate_residual(shared, &self.chunk, &pairs)?;
                stats.residual_pairs_evaluated += pairs.len() as u64;
                Some(mask)
            }
            None => None,
        };
        for (index, &(row, ptr)) in pairs.iter().enumerate() {
            if let Some(mask) = &mask {
                if !mask_value(mask, index) {
                    continue;
                }
                stats.residual_pairs_passed += 1;
            }
            self.matched[row as usize] = true;
            if shared.strategy.mark_used {
                shared.mark_used_at(ptr)?;
            }
            if let Some(builder) = out.as_mut() {
                builder.append_pair(shared, row, ptr)?;
            }
        }
        Ok(())
    }
}

/// Join-type strategy, selected once at setup. The inner loops are
/// monomorphic per variant; `probe` dispatches on the discriminator only
/// once per call.
pub(crate) enum JoinProbe {
    Pairs(PairsProbe),
    Exists(ExistsProbe),
    Mark(MarkProbe),
    NullAwareAnti(NullAwareAntiProbe),
}

impl JoinProbe {
    pub(crate) fn for_strategy(shared: Arc<ProbeShared>) -> Self {
        match shared.strategy.behavior {
            ProbeBehavior::EmitPairs => JoinProbe::Pairs(PairsProbe {
                shared,
                emit_unmatched: false,
                state: None,
            }),
            ProbeBehavior::EmitPairsAndUnmatchedProbe => JoinProbe::Pairs(PairsProbe {
                shared,
                emit_unmatched: true,
                state: None,
            }),
            ProbeBehavior::EmitProbeOnMatch => JoinProbe::Exists(ExistsProbe {
                shared,
                emit_on_match: true,
                state: None,
            }),
            ProbeBehavior::EmitProbeOnNoMatch => JoinProbe::Exists(ExistsProbe {
                shared,
                emit_on_match: false,
                state: None,
            }),
            ProbeBehavior::MarkOnly => JoinProbe::Mark(MarkProbe {
                shared,
                state: None,
            }),
            ProbeBehavior::NullAwareAnti => JoinProbe::NullAwareAnti(NullAwareAntiProbe {
                shared,
                state: None,
            }),
        }
    }

    /// Bind a new probe chunk; fails if the previous one is not drained.
    pub(crate) fn set_chunk(&mut self, chunk: Chunk) -> JoinResult<()> {
        let (shared, state) = match self {
            JoinProbe::Pairs(p) => (&p.shared, &mut p.state),
            JoinProbe::Exists(p) => (&p.shared, &mut p.state),
            JoinProbe::Mark(p) => (&p.shared, &mut p.state),
            JoinProbe::NullAwareAnti(p) => (&p.shared, &mut p.state),
        };
        if let Some(st) = state.as_ref() {
            if !st.is_done() {
                return Err(JoinError::invariant(
                    "set_chunk while the previous probe chunk is not drained",
                ));
            }
        }
        let keys = shared.encoder.encode(&chunk)?;
        if keys.row_count() != chunk.len() {
            return Err(JoinError::invariant("probe key row count mismatch"));
        }
        *state = Some(ProbeChunkState::new(chunk, keys));
        Ok(())
    }

    pub(crate) fn current_chunk_done(&self) -> bool {
        match self {
            JoinProbe::Pairs(p) => p.state.as_ref().map(|s| s.is_done()).unwrap_or(true),
            JoinProbe::Exists(p) => p.state.as_ref().map(|s| s.is_done()).unwrap_or(true),
            JoinProbe::Mark(p) => p.state.as_ref().map(|s| s.is_done()).unwrap_or(true),
            JoinProbe::NullAwareAnti(p) => p.state.as_ref().map(|s| s.is_done()).unwrap_or(true),
        }
    }

    /// Append output until the chunk is fully resolved or `out` fills.
    pub(crate) fn probe(
        &mut self,
        out: &mut OutputChunkBuilder,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        match self {
            JoinProbe::Pairs(p) => p.probe(out, guard, stats),
            JoinProbe::Exists(p) => p.probe(out, guard, stats),
            JoinProbe::Mark(p) => p.probe(guard, stats),
            JoinProbe::NullAwareAnti(p) => p.probe(out, guard, stats),
        }
    }
}

/// Inner and outer joins: emit matched pairs, optionally null-extended
/// unmatched probe rows, and mark used flags for build-outer variants.
pub(crate) struct PairsProbe {
    shared: Arc<ProbeShared>,
    emit_unmatched: bool,
    state: Option<ProbeChunkState>,
}

impl PairsProbe {
    fn probe(
        &mut self,
        out: &mut OutputChunkBuilder,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        let shared = Arc::clone(&self.shared);
        let st = self
            .state
            .as_mut()
            .ok_or_else(|| JoinError::invariant("probe called before set_chunk"))?;

        while !st.walk_done {
            st.walk(&shared, guard, WalkMode::CollectPairs { skip_matched: false }, stats)?;
            st.flush_pairs(&shared, Some(&mut *out), stats)?;
            if out.is_full() {
                return Ok(ProbeStep::BatchFull);
            }
        }

        if self.emit_unmatched {
            let rows = st.chunk.len();
            while st.emit_cursor < rows {
                if out.is_full() {
                    return Ok(ProbeStep::BatchFull);
                }
                let row = st.emit_cursor;
                if !st.matched[row] {
                    out.append_unmatched_probe(row as u32)?;
                }
                st.emit_cursor += 1;
            }
        }
        st.emit_done = true;
        Ok(ProbeStep::ChunkDone)
    }
}

/// Probe-side semi and anti joins: emit each probe row at most once, based
/// on whether any match survives.
pub(crate) struct ExistsProbe {
    shared: Arc<ProbeShared>,
    emit_on_match: bool,
    state: Option<ProbeChunkState>,
}

impl ExistsProbe {
    fn probe(
        &mut self,
        out: &mut OutputChunkBuilder,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        let shared = Arc::clone(&self.shared);
        let st = self
            .state
            .as_mut()
            .ok_or_else(|| JoinError::invariant("probe called before set_chunk"))?;

        while !st.walk_done {
            if shared.residual.is_some() {
                st.walk(&shared, guard, WalkMode::CollectPairs { skip_matched: true }, stats)?;
                st.flush_pairs(&shared, None, stats)?;
            } else {
                st.walk(
                    &shared,
                    guard,
                    WalkMode::Direct {
                        mark_used: false,
                        early_stop: true,
                    },
                    stats,
                )?;
            }
        }

        let rows = st.chunk.len();
        while st.emit_cursor < rows {
            if out.is_full() {
                return Ok(ProbeStep::BatchFull);
            }
            let row = st.emit_cursor;
            if st.matched[row] == self.emit_on_match {
                out.append_probe_row(row as u32);
            }
            st.emit_cursor += 1;
        }
        st.emit_done = true;
        Ok(ProbeStep::ChunkDone)
    }
}

/// Build-side semi/anti joins: nothing is emitted during probe; matching
/// build rows are flagged for the scan stage.
pub(crate) struct MarkProbe {
    shared: Arc<ProbeShared>,
    state: Option<ProbeChunkState>,
}

impl MarkProbe {
    fn probe(
        &mut self,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        let shared = Arc::clone(&self.shared);
        let st = self
            .state
            .as_mut()
            .ok_or_else(|| JoinError::invariant("probe called before set_chunk"))?;

        while !st.walk_done {
            if shared.residual.is_some() {
                st.walk(&shared, guard, WalkMode::CollectPairs { skip_matched: false }, stats)?;
                st.flush_pairs(&shared, None, stats)?;
            } else {
                st.walk(
                    &shared,
                    guard,
                    WalkMode::Direct {
                        mark_used: true,
                        early_stop: false,
                    },
                    stats,
                )?;
            }
        }
        st.emit_done = true;
        Ok(ProbeStep::ChunkDone)
    }
}

/// Null-aware left anti join (`NOT IN` semantics).
///
/// A null probe key is a wildcard: with a non-empty build side the row can
/// only survive when no build row passes the residual; without a residual
/// it never survives. A null key anywhere on the build side suppresses
/// every probe row unless the residual rules the pairing out.
pub(crate) struct NullAwareAntiProbe {
    shared: Arc<ProbeShared>,
    state: Option<ProbeChunkState>,
}

impl NullAwareAntiProbe {
    fn probe(
        &mut self,
        out: &mut OutputChunkBuilder,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<ProbeStep> {
        let shared = Arc::clone(&self.shared);
        let st = self
            .state
            .as_mut()
            .ok_or_else(|| JoinError::invariant("probe called before set_chunk"))?;

        if !st.walk_done {
            if shared.build_row_count == 0 {
                st.keep_all = true;
                st.walk_done = true;
            } else if shared.residual.is_none() {
                if shared.build_has_null_key {
                    st.keep_none = true;
                    st.walk_done = true;
                } else {
                    while !st.walk_done {
                        st.walk(
                            &shared,
                            guard,
                            WalkMode::Direct {
                                mark_used: false,
                                early_stop: true,
                            },
                            stats,
                        )?;
                    }
                }
            } else {
                // Equal-key candidates first, then null-key build rows for
                // every remaining probe row, then the whole build side for
                // null-key probe rows.
                while !st.walk_done {
                    st.walk(&shared, guard, WalkMode::CollectPairs { skip_matched: true }, stats)?;
                    st.flush_pairs(&shared, None, stats)?;
                }
                let all_rows: Vec<usize> = (0..st.chunk.len()).collect();
                Self::match_residual_against_build(&shared, st, &all_rows, true, guard, stats)?;
                let null_rows: Vec<usize> = (0..st.chunk.len())
                    .filter(|&row| st.keys.null_in_key[row])
                    .collect();
                if !null_rows.is_empty() {
                    Self::match_residual_against_build(&shared, st, &null_rows, false, guard, stats)?;
                }
            }
        }

        let rows = st.chunk.len();
        while st.emit_cursor < rows {
            if out.is_full() {
                return Ok(ProbeStep::BatchFull);
            }
            let row = st.emit_cursor;
            let keep = if st.keep_all {
                true
            } else if st.keep_none {
                false
            } else if shared.residual.is_none() {
                !st.keys.null_in_key[row] && !st.matched[row]
            } else {
                !st.matched[row]
            };
            if keep {
                out.append_probe_row(row as u32);
            }
            st.emit_cursor += 1;
        }
        st.emit_done = true;
        Ok(ProbeStep::ChunkDone)
    }

    /// Evaluate the residual for `probe_rows` against build rows (null-key
    /// rows only, or the entire build side), flagging probe rows with any
    /// passing pair.
    fn match_residual_against_build(
        shared: &ProbeShared,
        st: &mut ProbeChunkState,
        probe_rows: &[usize],
        null_key_rows_only: bool,
        guard: &mut CancelGuard<'_>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<()> {
        let mut pairs: Vec<(u32, RowPtr)> = Vec::new();
        for partition in 0..shared.row_table.partition_count() {
            for (segment_index, segment) in
                shared.row_table.segments(partition)?.iter().enumerate()
            {
                for row in 0..segment.row_count() {
                    guard.tick()?;
                    if null_key_rows_only && segment.is_key_valid(row) {
                        continue;
                    }
                    let ptr = RowPtr::new(partition, segment_index, row)?;
                    for &probe_row in probe_rows {
                        if st.matched[probe_row] {
                            continue;
                        }
                        pairs.push((probe_row as u32, ptr));
                        if pairs.len() >= shared.pair_buffer_size {
                            Self::flush_residual_matches(shared, st, &mut pairs, stats)?;
                        }
                    }
                }
            }
        }
        Self::flush_residual_matches(shared, st, &mut pairs, stats)
    }

    fn flush_residual_matches(
        shared: &ProbeShared,
        st: &mut ProbeChunkState,
        pairs: &mut Vec<(u32, RowPtr)>,
        stats: &mut JoinRuntimeStats,
    ) -> JoinResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mask = evaluate_residual(shared, &st.chunk, pairs)?;
        stats.residual_pairs_evaluated += pairs.len() as u64;
        for (index, &(row, _)) in pairs.iter().enumerate() {
            if mask_value(&mask, index) {
                stats.residual_pairs_passed += 1;
                st.matched[row as usize] = true;
            }
        }
        pairs.clear();
        Ok(())
    }
}

/// One probe worker: pull probe chunks from the shared source, run the
/// strategy, and push finished output chunks to the shared sink. Output
/// chunks never span probe chunks, so probe-side indices stay valid.
pub(crate) fn probe_worker(
    shared: &Arc<ProbeShared>,
    source: &Mutex<&mut dyn ChunkSource>,
    sink: &Mutex<&mut dyn ChunkSink>,
    abort: &AbortCell,
    cancel: &CancelToken,
    cancel_check_interval: usize,
) -> JoinResult<JoinRuntimeStats> {
    let mut stats = JoinRuntimeStats::default();
    let mut probe = JoinProbe::for_strategy(Arc::clone(shared));
    let layout = shared.strategy.output_layout();
    let mut out = OutputChunkBuilder::new(shared, layout, false)?;

    loop {
        abort.checkpoint(cancel)?;
        let chunk = {
            let mut guard = source
                .lock()
                .map_err(|_| JoinError::invariant("probe source lock poisoned"))?;
            guard.next_chunk().map_err(JoinError::Upstream)?
        };
        let Some(chunk) = chunk else {
            break;
        };
        if chunk.is_empty() {
            continue;
        }
        stats.probe_chunks += 1;
        stats.probe_rows += chunk.len() as u64;

        if layout != OutputLayout::BuildOnly {
            out.bind_probe_chunk(&chunk)?;
        }
        probe.set_chunk(chunk)?;

        let mut guard = CancelGuard::new(abort, cancel, cancel_check_interval);
        loop {
            match probe.probe(&mut out, &mut guard, &mut stats)? {
                ProbeStep::BatchFull => push_finished(&mut out, sink, &mut stats)?,
                ProbeStep::ChunkDone => break,
            }
        }
        debug_assert!(probe.current_chunk_done());
        // Flush before the next probe chunk rebinds the index base.
        push_finished(&mut out, sink, &mut stats)?;
    }
    Ok(stats)
}

pub(crate) fn push_finished(
    out: &mut OutputChunkBuilder,
    sink: &Mutex<&mut dyn ChunkSink>,
    stats: &mut JoinRuntimeStats,
) -> JoinResult<()> {
    let Some(chunk) = out.finish()? else {
        return Ok(());
    };
    stats.output_rows += chunk.len() as u64;
    let mut guard = sink
        .lock()
        .map_err(|_| JoinError::invariant("output sink lock poisoned"))?;
    guard.push_chunk(chunk).map_err(JoinError::Sink)
}
