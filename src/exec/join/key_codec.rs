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
//! Join key serialization and hashing.
//!
//! Responsibilities:
//! - Serializes the key tuple of each row into a byte string whose equality
//!   matches semantic key equality, so chain walks compare with `memcmp`.
//! - Produces the 64-bit hash per row that drives partition routing and
//!   bucket selection on both sides of the join.
//!
//! Encoding rules: fixed-width values little-endian raw; var-width values
//! length-prefixed (4 bytes LE); null-safe-eq keys carry a leading tag byte
//! (0 = null, 1 = value) and zero-fill the value bytes when null. Rows whose
//! non-null-safe key columns contain null are flagged as having no key; they
//! are still encoded (zero-filled) to keep row layout uniform, but are never
//! linked or looked up.

use arrow::datatypes::SchemaRef;

use crate::common::error::{JoinError, JoinResult};
use crate::exec::chunk::Chunk;
use crate::exec::chunk::column::{ColumnView, fixed_width_of, is_supported_key_type};
use crate::exec::join::desc::JoinKeyDesc;

/// Engine-wide hash seed; build and probe must agree for lookups to land.
pub(crate) const JOIN_HASH_SEED: u64 = 0x9ae1_6a3b_2f90_404f;

const VAR_LEN_PREFIX: usize = 4;

/// FNV-1a over a serialized key tuple.
pub(crate) fn hash_key_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Static layout facts about a key tuple on one side of the join.
#[derive(Clone, Debug)]
pub(crate) struct KeyLayout {
    /// Column index per key, in key order, for this side's schema.
    pub source_columns: Vec<usize>,
    pub null_safe: Vec<bool>,
    /// Serialized value width per key (excluding tag), None for var-width.
    pub value_widths: Vec<Option<usize>>,
    /// Total serialized width including tags, None when any key is var-width.
    pub fixed_total_width: Option<usize>,
    pub any_null_safe: bool,
    pub var_width_count: usize,
}

pub(crate) fn key_layout(
    keys: &[JoinKeyDesc],
    schema: &SchemaRef,
    build_side: bool,
) -> JoinResult<KeyLayout> {
    if keys.is_empty() {
        return Err(JoinError::unsupported("join requires at least one key"));
    }
    let mut source_columns = Vec::with_capacity(keys.len());
    let mut null_safe = Vec::with_capacity(keys.len());
    let mut value_widths = Vec::with_capacity(keys.len());
    let mut fixed_total = Some(0usize);
    let mut var_width_count = 0usize;
    for key in keys {
        let column = if build_side {
            key.build_column
        } else {
            key.probe_column
        };
        let field = schema.fields().get(column).ok_or_else(|| {
            JoinError::unsupported(format!(
                "key column {} out of bounds for schema with {} columns",
                column,
                schema.fields().len()
            ))
        })?;
        if !is_supported_key_type(field.data_type()) {
            return Err(JoinError::unsupported(format!(
                "key column {} has type {} which cannot be a join key",
                column,
                field.data_type()
            )));
        }
        let width = fixed_width_of(field.data_type())?;
        match width {
            Some(w) => {
                let tag = if key.null_safe_eq { 1 } else { 0 };
                fixed_total = fixed_total.map(|t| t + tag + w);
            }
            None => {
                var_width_count += 1;
                fixed_total = None;
            }
        }
        source_columns.push(column);
        null_safe.push(key.null_safe_eq);
        value_widths.push(width);
    }
    let any_null_safe = null_safe.iter().any(|v| *v);
    Ok(KeyLayout {
        source_columns,
        null_safe,
        value_widths,
        fixed_total_width: fixed_total,
        any_null_safe,
        var_width_count,
    })
}

/// Per-chunk serialized keys with validity and hashes.
pub(crate) struct SerializedKeys {
    offsets: Vec<usize>,
    bytes: Vec<u8>,
    hashes: Vec<u64>,
    /// Row is usable for indexing/lookup: no disqualifying nulls.
    pub has_key: Vec<bool>,
    /// Row has a null in any key column, null-safe or not.
    pub null_in_key: Vec<bool>,
}

impl SerializedKeys {
    pub(crate) fn row_count(&self) -> usize {
        self.has_key.len()
    }

    pub(crate) fn row(&self, row: usize) -> &[u8] {
        &self.bytes[self.offsets[row]..self.offsets[row + 1]]
    }

    pub(crate) fn hash(&self, row: usize) -> u64 {
        self.hashes[row]
    }

    pub(crate) fn any_null_in_key(&self) -> bool {
        self.null_in_key.iter().any(|v| *v)
    }
}

/// Serializes and hashes the key tuple of every row in a chunk.
pub(crate) struct KeyEncoder {
    layout: KeyLayout,
}

impl KeyEncoder {
    pub(crate) fn new(layout: KeyLayout) -> Self {
        Self { layout }
    }

    pub(crate) fn encode(&self, chunk: &Chunk) -> JoinResult<SerializedKeys> {
        let rows = chunk.len();
        let mut views = Vec::with_capacity(self.layout.source_columns.len());
        for &column in &self.layout.source_columns {
            views.push(ColumnView::try_new(chunk.column(column)?)?);
        }

        let mut offsets = Vec::with_capacity(rows + 1);
        let mut bytes = Vec::new();
        let mut hashes = Vec::with_capacity(rows);
        let mut has_key = Vec::with_capacity(rows);
        let mut null_in_key = Vec::with_capacity(rows);
        offsets.push(0);

        for row in 0..rows {
            let mut valid = true;
            let mut any_null = false;
            for (idx, view) in views.iter().enumerate() {
                let is_null = view.is_null(row);
                any_null |= is_null;
                if is_null && !self.layout.null_safe[idx] {
                    valid = false;
                }
                self.encode_value(view, idx, row, is_null, &mut bytes);
            }
            let start = offsets[offsets.len() - 1];
            hashes.push(hash_key_bytes(JOIN_HASH_SEED, &bytes[start..]));
            offsets.push(bytes.len());
            has_key.push(valid);
            null_in_key.push(any_null);
        }

        Ok(SerializedKeys {
            offsets,
            bytes,
            hashes,
            has_key,
            null_in_key,
        })
    }

    fn encode_value(
        &self,
        view: &ColumnView<'_>,
        key_idx: usize,
        row: usize,
        is_null: bool,
        out: &mut Vec<u8>,
    ) {
        if self.layout.null_safe[key_idx] {
            out.push(if is_null { 0 } else { 1 });
        }
        match self.layout.value_widths[key_idx] {
            Some(width) => {
                if is_null {
                    out.resize(out.len() + width, 0);
                } else {
                    view.append_value_bytes(row, out);
                }
            }
            None => {
                if is_null {
                    out.extend_from_slice(&0u32.to_le_bytes());
                } else {
                    let len = view.value_len(row) as u32;
                    out.extend_from_slice(&len.to_le_bytes());
                    view.append_value_bytes(row, out);
                }
            }
        }
    }
}

/// Width of the length prefix stored before each var-width value.
pub(crate) const fn var_len_prefix() -> usize {
    VAR_LEN_PREFIX
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn chunk_i64_utf8(ints: Vec<Option<i64>>, strings: Vec<Option<&str>>) -> (Chunk, SchemaRef) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(ints)),
            Arc::new(StringArray::from(strings)),
        ];
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns).expect("batch");
        (Chunk::new(batch), schema)
    }

    #[test]
    fn length_prefix_distinguishes_prefix_strings() {
        let (chunk, schema) = chunk_i64_utf8(
            vec![Some(1), Some(1)],
            vec![Some("x"), Some("xy")],
        );
        let keys = vec![JoinKeyDesc::new(0, 0), JoinKeyDesc::new(1, 1)];
        let layout = key_layout(&keys, &schema, true).expect("layout");
        assert_eq!(layout.fixed_total_width, None);
        let encoder = KeyEncoder::new(layout);
        let encoded = encoder.encode(&chunk).expect("encode");
        assert_ne!(encoded.row(0), encoded.row(1));
        assert_ne!(encoded.hash(0), encoded.hash(1));
    }

    #[test]
    fn null_disqualifies_unless_null_safe() {
        let (chunk, schema) = chunk_i64_utf8(vec![None, Some(2)], vec![Some("a"), Some("b")]);
        let keys = vec![JoinKeyDesc::new(0, 0)];
        let layout = key_layout(&keys, &schema, true).expect("layout");
        assert_eq!(layout.fixed_total_width, Some(8));
        let encoded = KeyEncoder::new(layout).encode(&chunk).expect("encode");
        assert!(!encoded.has_key[0]);
        assert!(encoded.has_key[1]);
        assert!(encoded.null_in_key[0]);

        let keys = vec![JoinKeyDesc::null_safe(0, 0)];
        let layout = key_layout(&keys, &schema, true).expect("layout");
        assert_eq!(layout.fixed_total_width, Some(9));
        let encoded = KeyEncoder::new(layout).encode(&chunk).expect("encode");
        assert!(encoded.has_key[0]);
        // A null-safe null must not collide with a stored zero value.
        let (zero_chunk, _) = chunk_i64_utf8(vec![Some(0)], vec![Some("z")]);
        let keys = vec![JoinKeyDesc::null_safe(0, 0)];
        let layout = key_layout(&keys, &schema, true).expect("layout");
        let zero = KeyEncoder::new(layout).encode(&zero_chunk).expect("encode");
        assert_ne!(encoded.row(0), zero.row(0));
    }

    #[test]
    fn build_and_probe_hashes_agree() {
        let (chunk, schema) = chunk_i64_utf8(vec![Some(42)], vec![Some("q")]);
        let keys = vec![JoinKeyDesc::new(0, 0), JoinKeyDesc::new(1, 1)];
        let build = KeyEncoder::new(key_layout(&keys, &schema, true).expect("layout"))
            .encode(&chunk)
            .expect("encode");
        let probe = KeyEncoder::new(key_layout(&keys, &schema, false).expect("layout"))
            .encode(&chunk)
            .expect("encode");
        assert_eq!(build.row(0), probe.row(0));
        assert_eq!(build.hash(0), probe.hash(0));
    }

    #[test]
    fn float_keys_are_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("f", DataType::Float64, true)]));
        let err = key_layout(&[JoinKeyDesc::new(0, 0)], &schema, true).expect_err("float key");
        assert!(matches!(err, JoinError::Unsupported(_)));
    }
}
