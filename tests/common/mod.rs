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
//! Shared helpers for join engine integration tests: chunk construction,
//! in-memory sources/sinks, a row-value model, and a naive nested-loop
//! reference join the engine output is compared against.

#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Int32Array, Int64Array, RecordBatch, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use scree::exec::join::engine::{ChunkSink, ChunkSource, ResidualPredicate};
use scree::{
    CancelToken, Chunk, EngineOptions, HashJoinEngine, JoinError, JoinKeyDesc, JoinSpec, JoinType,
    MemTracker,
};

/// One cell of a test row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn int(v: i64) -> Value {
        Value::Int(v)
    }

    pub fn str(v: &str) -> Value {
        Value::Str(v.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Build an all-nullable schema from (name, type) pairs.
pub fn schema(fields: &[(&str, DataType)]) -> SchemaRef {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(|(name, dt)| Field::new(*name, dt.clone(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Build one chunk from row-major values; column types come from `schema`.
pub fn chunk_of(schema: &SchemaRef, rows: &[Vec<Value>]) -> Chunk {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (col, field) in schema.fields().iter().enumerate() {
        let array: ArrayRef = match field.data_type() {
            DataType::Int64 => Arc::new(Int64Array::from(
                rows.iter()
                    .map(|row| match &row[col] {
                        Value::Null => None,
                        Value::Int(v) => Some(*v),
                        other => panic!("expected int value, got {other:?}"),
                    })
                    .collect::<Vec<_>>(),
            )),
            DataType::Int32 => Arc::new(Int32Array::from(
                rows.iter()
                    .map(|row| match &row[col] {
                        Value::Null => None,
                        Value::Int(v) => Some(*v as i32),
                        other => panic!("expected int value, got {other:?}"),
                    })
                    .collect::<Vec<_>>(),
            )),
            DataType::Utf8 => Arc::new(StringArray::from(
                rows.iter()
                    .map(|row| match &row[col] {
                        Value::Null => None,
                        Value::Str(v) => Some(v.clone()),
                        other => panic!("expected string value, got {other:?}"),
                    })
                    .collect::<Vec<_>>(),
            )),
            DataType::Boolean => Arc::new(BooleanArray::from(
                rows.iter()
                    .map(|row| match &row[col] {
                        Value::Null => None,
                        Value::Bool(v) => Some(*v),
                        other => panic!("expected bool value, got {other:?}"),
                    })
                    .collect::<Vec<_>>(),
            )),
            other => panic!("unsupported test column type {other}"),
        };
        columns.push(array);
    }
    Chunk::new(RecordBatch::try_new(Arc::clone(schema), columns).expect("test batch"))
}

/// Extract row-major values back out of a chunk.
pub fn rows_of(chunk: &Chunk) -> Vec<Vec<Value>> {
    let mut rows = vec![Vec::with_capacity(chunk.columns().len()); chunk.len()];
    for column in chunk.columns() {
        match column.data_type() {
            DataType::Int64 => {
                let array = column.as_any().downcast_ref::<Int64Array>().expect("i64");
                for (row, out) in rows.iter_mut().enumerate() {
                    out.push(if array.is_null(row) {
                        Value::Null
                    } else {
                        Value::Int(array.value(row))
                    });
                }
            }
            DataType::Int32 => {
                let array = column.as_any().downcast_ref::<Int32Array>().expect("i32");
                for (row, out) in rows.iter_mut().enumerate() {
                    out.push(if array.is_null(row) {
                        Value::Null
                    } else {
                        Value::Int(array.value(row) as i64)
                    });
                }
            }
            DataType::Utf8 => {
                let array = column.as_any().downcast_ref::<StringArray>().expect("utf8");
                for (row, out) in rows.iter_mut().enumerate() {
                    out.push(if array.is_null(row) {
                        Value::Null
                    } else {
                        Value::Str(array.value(row).to_string())
                    });
                }
            }
            DataType::Boolean => {
                let array = column
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .expect("bool");
                for (row, out) in rows.iter_mut().enumerate() {
                    out.push(if array.is_null(row) {
                        Value::Null
                    } else {
                        Value::Bool(array.value(row))
                    });
                }
            }
            other => panic!("unsupported test column type {other}"),
        }
    }
    rows
}

/// In-memory chunk source.
pub struct VecSource {
    chunks: Vec<Chunk>,
    cursor: usize,
}

impl VecSource {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks, cursor: 0 }
    }
}

impl ChunkSource for VecSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, String> {
        if self.cursor >= self.chunks.len() {
            return Ok(None);
        }
        let chunk = self.chunks[self.cursor].clone();
        self.cursor += 1;
        Ok(Some(chunk))
    }
}

/// Source that fails after serving a number of chunks.
pub struct FailingSource {
    inner: VecSource,
    fail_after: usize,
    served: usize,
}

impl FailingSource {
    pub fn new(chunks: Vec<Chunk>, fail_after: usize) -> Self {
        Self {
            inner: VecSource::new(chunks),
            fail_after,
            served: 0,
        }
    }
}

impl ChunkSource for FailingSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, String> {
        if self.served >= self.fail_after {
            return Err("synthetic upstream failure".to_string());
        }
        self.served += 1;
        self.inner.next_chunk()
    }
}

/// Sink collecting all pushed chunks.
#[derive(Default)]
pub struct CollectSink {
    pub chunks: Vec<Chunk>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        for chunk in &self.chunks {
            rows.extend(rows_of(chunk));
        }
        rows
    }
}

impl ChunkSink for CollectSink {
    fn push_chunk(&mut self, chunk: Chunk) -> Result<(), String> {
        self.chunks.push(chunk);
        Ok(())
    }
}

/// Residual predicate comparing two int columns of the join-scope row;
/// null operands never match.
pub struct IntCompare {
    pub left_column: usize,
    pub right_column: usize,
    pub left_greater: bool,
    pub required_build: Vec<usize>,
}

impl ResidualPredicate for IntCompare {
    fn required_build_columns(&self) -> Vec<usize> {
        self.required_build.clone()
    }

    fn evaluate(&self, candidate: &Chunk) -> Result<BooleanArray, String> {
        let rows = rows_of(candidate);
        let mask = rows
            .iter()
            .map(|row| {
                let (left, right) = (&row[self.left_column], &row[self.right_column]);
                match (left, right) {
                    (Value::Int(l), Value::Int(r)) => {
                        Some(if self.left_greater { l > r } else { l < r })
                    }
                    _ => Some(false),
                }
            })
            .collect::<Vec<_>>();
        Ok(BooleanArray::from(mask))
    }
}

/// Key descriptor for the reference join: (build column, probe column,
/// null-safe equality).
pub type RefKey = (usize, usize, bool);

fn key_match(build: &[Value], probe: &[Value], keys: &[RefKey]) -> bool {
    keys.iter().all(|&(bc, pc, null_safe)| {
        match (&build[bc], &probe[pc]) {
            (Value::Null, Value::Null) => null_safe,
            (Value::Null, _) | (_, Value::Null) => false,
            (b, p) => b == p,
        }
    })
}

fn ordered(probe: &[Value], build: &[Value], probe_is_left: bool) -> Vec<Value> {
    if probe_is_left {
        probe.iter().chain(build.iter()).cloned().collect()
    } else {
        build.iter().chain(probe.iter()).cloned().collect()
    }
}

fn null_extended(row: &[Value], other_width: usize, row_is_left: bool) -> Vec<Value> {
    let nulls = std::iter::repeat(Value::Null).take(other_width);
    if row_is_left {
        row.iter().cloned().chain(nulls).collect()
    } else {
        nulls.chain(row.iter().cloned()).collect()
    }
}

/// Naive nested-loop reference join. `residual` sees the joined row in
/// left-right order, like the engine's residual predicate.
pub fn reference_join(
    join_type: JoinType,
    probe_is_left: bool,
    build_rows: &[Vec<Value>],
    probe_rows: &[Vec<Value>],
    keys: &[RefKey],
    residual: Option<&dyn Fn(&[Value]) -> bool>,
) -> Vec<Vec<Value>> {
    let pair_passes = |build: &[Value], probe: &[Value]| -> bool {
        if !key_match(build, probe, keys) {
            return false;
        }
        match residual {
            Some(pred) => pred(&ordered(probe, build, probe_is_left)),
            None => true,
        }
    };

    let build_width = build_rows.first().map(|r| r.len()).unwrap_or(0);
    let probe_width = probe_rows.first().map(|r| r.len()).unwrap_or(0);

    let mut out = Vec::new();
    let mut build_matched = vec![false; build_rows.len()];
    let mut probe_matched = vec![false; probe_rows.len()];
    let mut pairs = Vec::new();
    for (pi, probe) in probe_rows.iter().enumerate() {
        for (bi, build) in build_rows.iter().enumerate() {
            if pair_passes(build, probe) {
                pairs.push((pi, bi));
                probe_matched[pi] = true;
                build_matched[bi] = true;
            }
        }
    }

    let probe_left = probe_is_left;
    match join_type {
        JoinType::Inner => {
            for &(pi, bi) in &pairs {
                out.push(ordered(&probe_rows[pi], &build_rows[bi], probe_is_left));
            }
        }
        JoinType::LeftOuter | JoinType::RightOuter | JoinType::FullOuter => {
            for &(pi, bi) in &pairs {
                out.push(ordered(&probe_rows[pi], &build_rows[bi], probe_is_left));
            }
            let probe_outer = matches!(
                (join_type, probe_left),
                (JoinType::LeftOuter, true)
                    | (JoinType::RightOuter, false)
                    | (JoinType::FullOuter, _)
            );
            let build_outer = matches!(
                (join_type, probe_left),
                (JoinType::LeftOuter, false)
                    | (JoinType::RightOuter, true)
                    | (JoinType::FullOuter, _)
            );
            if probe_outer {
                for (pi, probe) in probe_rows.iter().enumerate() {
                    if !probe_matched[pi] {
                        out.push(null_extended(probe, build_width, probe_left));
                    }
                }
            }
            if build_outer {
                for (bi, build) in build_rows.iter().enumerate() {
                    if !build_matched[bi] {
                        out.push(null_extended(build, probe_width, !probe_left));
                    }
                }
            }
        }
        JoinType::LeftSemi | JoinType::RightSemi => {
            let semi_on_probe = matches!(
                (join_type, probe_left),
                (JoinType::LeftSemi, true) | (JoinType::RightSemi, false)
            );
            if semi_on_probe {
                for (pi, probe) in probe_rows.iter().enumerate() {
                    if probe_matched[pi] {
                        out.push(probe.clone());
                    }
                }
            } else {
                for (bi, build) in build_rows.iter().enumerate() {
                    if build_matched[bi] {
                        out.push(build.clone());
                    }
                }
            }
        }
        JoinType::LeftAnti | JoinType::RightAnti => {
            let anti_on_probe = matches!(
                (join_type, probe_left),
                (JoinType::LeftAnti, true) | (JoinType::RightAnti, false)
            );
            if anti_on_probe {
                for (pi, probe) in probe_rows.iter().enumerate() {
                    if !probe_matched[pi] {
                        out.push(probe.clone());
                    }
                }
            } else {
                for (bi, build) in build_rows.iter().enumerate() {
                    if !build_matched[bi] {
                        out.push(build.clone());
                    }
                }
            }
        }
        JoinType::NullAwareLeftAnti => {
            let key_probe_cols: Vec<usize> = keys.iter().map(|&(_, pc, _)| pc).collect();
            let key_build_cols: Vec<usize> = keys.iter().map(|&(bc, _, _)| bc).collect();
            for (pi, probe) in probe_rows.iter().enumerate() {
                let keep = if build_rows.is_empty() {
                    true
                } else {
                    let probe_has_null = key_probe_cols.iter().any(|&c| probe[c].is_null());
                    match residual {
                        None => {
                            let build_has_null = build_rows.iter().any(|build| {
                                key_build_cols.iter().any(|&c| build[c].is_null())
                            });
                            !build_has_null && !probe_has_null && !probe_matched[pi]
                        }
                        Some(pred) => !build_rows.iter().any(|build| {
                            let build_has_null =
                                key_build_cols.iter().any(|&c| build[c].is_null());
                            let related = key_match(build, probe, keys)
                                || probe_has_null
                                || build_has_null;
                            related && pred(&ordered(probe, build, probe_is_left))
                        }),
                    }
                };
                if keep {
                    out.push(probe.clone());
                }
            }
        }
    }
    out
}

/// Compare as multisets after sorting.
pub fn assert_rows_match(mut actual: Vec<Vec<Value>>, mut expected: Vec<Vec<Value>>) {
    actual.sort();
    expected.sort();
    assert_eq!(actual, expected);
}

/// Split row-major values into chunks of at most `rows_per_chunk`.
pub fn split_chunks(schema: &SchemaRef, rows: &[Vec<Value>], rows_per_chunk: usize) -> Vec<Chunk> {
    rows.chunks(rows_per_chunk.max(1))
        .map(|slice| chunk_of(schema, slice))
        .collect()
}

/// Options tuned for tests: small chunks and pair buffers so suspension
/// and resumption paths actually run.
pub fn test_options(concurrency: usize) -> EngineOptions {
    let mut options = EngineOptions::default();
    options.concurrency = concurrency;
    options.chunk_size = 64;
    options.pair_buffer_size = 7;
    options
}

/// Configure, build, and probe one join end to end.
#[allow(clippy::too_many_arguments)]
pub fn run_engine_join(
    join_type: JoinType,
    probe_is_left: bool,
    build_schema: &SchemaRef,
    probe_schema: &SchemaRef,
    build_rows: &[Vec<Value>],
    probe_rows: &[Vec<Value>],
    keys: &[RefKey],
    residual: Option<Arc<dyn ResidualPredicate>>,
    options: EngineOptions,
) -> Result<Vec<Vec<Value>>, JoinError> {
    let spec = JoinSpec {
        join_type,
        probe_is_left,
        build_schema: Arc::clone(build_schema),
        probe_schema: Arc::clone(probe_schema),
        keys: keys
            .iter()
            .map(|&(bc, pc, null_safe)| JoinKeyDesc {
                build_column: bc,
                probe_column: pc,
                null_safe_eq: null_safe,
            })
            .collect(),
        residual,
    };
    let tracker = MemTracker::new_root("test-join");
    let mut engine = HashJoinEngine::try_new(spec, options, tracker, CancelToken::new())?;
    let mut build_source = VecSource::new(split_chunks(build_schema, build_rows, 50));
    engine.build(&mut build_source)?;
    let mut probe_source = VecSource::new(split_chunks(probe_schema, probe_rows, 50));
    let mut sink = CollectSink::new();
    engine.probe(&mut probe_source, &mut sink)?;
    Ok(sink.rows())
}
