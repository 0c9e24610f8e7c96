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
//! Fixed-input join scenarios across all join types.

mod common;

use std::sync::Arc;

use arrow::datatypes::DataType;
use common::{IntCompare, Value, assert_rows_match, run_engine_join, schema, test_options};
use common::Value::Null;
use scree::JoinType;

fn kv_rows(rows: &[(i64, &str)]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|&(k, v)| vec![Value::int(k), Value::str(v)])
        .collect()
}

/// Build `[(1,'a'),(2,'b'),(2,'c')]`, probe `[(2,'X'),(3,'Y')]`: the inputs
/// shared by the first four scenarios.
fn kv_inputs() -> (Vec<Vec<Value>>, Vec<Vec<Value>>) {
    (
        kv_rows(&[(1, "a"), (2, "b"), (2, "c")]),
        kv_rows(&[(2, "X"), (3, "Y")]),
    )
}

#[test]
fn inner_join_single_int_key() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("b")],
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("c")],
        ],
    );
}

#[test]
fn left_outer_join_extends_unmatched_probe_rows() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::LeftOuter,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("b")],
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("c")],
            vec![Value::int(3), Value::str("Y"), Null, Null],
        ],
    );
}

#[test]
fn left_anti_join_keeps_only_unmatched_probe_rows() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::LeftAnti,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(rows, vec![vec![Value::int(3), Value::str("Y")]]);
}

#[test]
fn right_outer_join_scans_unused_build_rows() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::RightOuter,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("b")],
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("c")],
            vec![Null, Null, Value::int(1), Value::str("a")],
        ],
    );
}

#[test]
fn inner_join_with_residual_predicate() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Int64)]);
    let build: Vec<Vec<Value>> = [(1, 10), (1, 20), (1, 30)]
        .iter()
        .map(|&(k, v)| vec![Value::int(k), Value::int(v)])
        .collect();
    let probe: Vec<Vec<Value>> = [(1, 15), (1, 25)]
        .iter()
        .map(|&(k, v)| vec![Value::int(k), Value::int(v)])
        .collect();
    // joined row = (probe k, probe v, build k, build v); build.v > probe.v
    let residual = Arc::new(IntCompare {
        left_column: 3,
        right_column: 1,
        left_greater: true,
        required_build: vec![1],
    });
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        Some(residual),
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(1), Value::int(15), Value::int(1), Value::int(20)],
            vec![Value::int(1), Value::int(15), Value::int(1), Value::int(30)],
            vec![Value::int(1), Value::int(25), Value::int(1), Value::int(30)],
        ],
    );
}

#[test]
fn composite_variable_key_distinguishes_prefixes() {
    let s = schema(&[
        ("i", DataType::Int64),
        ("s", DataType::Utf8),
        ("p", DataType::Utf8),
    ]);
    let build = vec![
        vec![Value::int(1), Value::str("x"), Value::str("a")],
        vec![Value::int(1), Value::str("xy"), Value::str("b")],
    ];
    let probe = vec![vec![Value::int(1), Value::str("x"), Value::str("P")]];
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false), (1, 1, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![vec![
            Value::int(1),
            Value::str("x"),
            Value::str("P"),
            Value::int(1),
            Value::str("x"),
            Value::str("a"),
        ]],
    );
}

#[test]
fn full_outer_join_extends_both_sides() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::FullOuter,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("b")],
            vec![Value::int(2), Value::str("X"), Value::int(2), Value::str("c")],
            vec![Value::int(3), Value::str("Y"), Null, Null],
            vec![Null, Null, Value::int(1), Value::str("a")],
        ],
    );
}

#[test]
fn left_outer_with_build_on_the_left_uses_the_scan() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    // probe_is_left = false: the build side is the left (outer) input, so
    // output rows are (build cols, probe cols).
    let rows = run_engine_join(
        JoinType::LeftOuter,
        false,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Value::int(2), Value::str("b"), Value::int(2), Value::str("X")],
            vec![Value::int(2), Value::str("c"), Value::int(2), Value::str("X")],
            vec![Value::int(1), Value::str("a"), Null, Null],
        ],
    );
}

#[test]
fn right_semi_and_anti_emit_build_rows() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let semi = run_engine_join(
        JoinType::RightSemi,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        semi,
        vec![
            vec![Value::int(2), Value::str("b")],
            vec![Value::int(2), Value::str("c")],
        ],
    );

    let anti = run_engine_join(
        JoinType::RightAnti,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(anti, vec![vec![Value::int(1), Value::str("a")]]);
}

#[test]
fn left_semi_emits_each_probe_row_once() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let (build, probe) = kv_inputs();
    let rows = run_engine_join(
        JoinType::LeftSemi,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    // Probe key 2 matches two build rows but is emitted once.
    assert_rows_match(rows, vec![vec![Value::int(2), Value::str("X")]]);
}

#[test]
fn null_keys_never_match_by_default() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let build = vec![
        vec![Null, Value::str("a")],
        vec![Value::int(1), Value::str("b")],
    ];
    let probe = vec![
        vec![Null, Value::str("X")],
        vec![Value::int(1), Value::str("Y")],
    ];
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![vec![Value::int(1), Value::str("Y"), Value::int(1), Value::str("b")]],
    );
}

#[test]
fn null_safe_key_matches_null_to_null() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let build = vec![
        vec![Null, Value::str("a")],
        vec![Value::int(0), Value::str("z")],
    ];
    let probe = vec![vec![Null, Value::str("X")]];
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, true)],
        None,
        test_options(2),
    )
    .expect("join");
    // The null-safe null must match the null row and not the zero row.
    assert_rows_match(
        rows,
        vec![vec![Null, Value::str("X"), Null, Value::str("a")]],
    );
}

#[test]
fn null_aware_anti_with_null_key_on_the_build_side() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let build = vec![
        vec![Null, Value::str("a")],
        vec![Value::int(1), Value::str("b")],
    ];
    let probe = kv_rows(&[(2, "X"), (1, "Y")]);
    let rows = run_engine_join(
        JoinType::NullAwareLeftAnti,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    // A null build key can equal anything, so nothing survives NOT IN.
    assert_rows_match(rows, vec![]);
}

#[test]
fn null_aware_anti_against_an_empty_build_side() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let probe = vec![
        vec![Null, Value::str("X")],
        vec![Value::int(1), Value::str("Y")],
    ];
    let rows = run_engine_join(
        JoinType::NullAwareLeftAnti,
        true,
        &s,
        &s,
        &[],
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    // NOT IN over an empty set keeps every row, null keys included.
    assert_rows_match(rows, probe.clone());
}

#[test]
fn null_aware_anti_drops_null_probe_keys_when_build_is_nonempty() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let build = kv_rows(&[(1, "a")]);
    let probe = vec![
        vec![Null, Value::str("X")],
        vec![Value::int(2), Value::str("Y")],
        vec![Value::int(1), Value::str("Z")],
    ];
    let rows = run_engine_join(
        JoinType::NullAwareLeftAnti,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(rows, vec![vec![Value::int(2), Value::str("Y")]]);
}

#[test]
fn empty_probe_side_still_scans_for_right_outer() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let build = kv_rows(&[(1, "a"), (2, "b")]);
    let rows = run_engine_join(
        JoinType::RightOuter,
        true,
        &s,
        &s,
        &build,
        &[],
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(
        rows,
        vec![
            vec![Null, Null, Value::int(1), Value::str("a")],
            vec![Null, Null, Value::int(2), Value::str("b")],
        ],
    );
}

#[test]
fn empty_build_side_passes_anti_and_blocks_inner() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    let probe = kv_rows(&[(1, "X"), (2, "Y")]);
    let inner = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &[],
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(inner, vec![]);

    let anti = run_engine_join(
        JoinType::LeftAnti,
        true,
        &s,
        &s,
        &[],
        &probe,
        &[(0, 0, false)],
        None,
        test_options(2),
    )
    .expect("join");
    assert_rows_match(anti, probe.clone());
}

#[test]
fn duplicate_heavy_keys_fill_and_resume_output_chunks() {
    let s = schema(&[("k", DataType::Int64), ("v", DataType::Utf8)]);
    // 40 build duplicates x 20 probe duplicates = 800 pairs, far beyond the
    // 64-row test chunk size, forcing suspended chain walks.
    let build: Vec<Vec<Value>> = (0..40)
        .map(|i| vec![Value::int(7), Value::str(&format!("b{i}"))])
        .collect();
    let probe: Vec<Vec<Value>> = (0..20)
        .map(|i| vec![Value::int(7), Value::str(&format!("p{i}"))])
        .collect();
    let rows = run_engine_join(
        JoinType::Inner,
        true,
        &s,
        &s,
        &build,
        &probe,
        &[(0, 0, false)],
        None,
        test_options(3),
    )
    .expect("join");
    assert_eq!(rows.len(), 800);
}
