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
//! Build-row byte layout.
//!
//! Responsibilities:
//! - Derives the per-row layout once at setup: key mode, key inlining,
//!   null-map shape, and the reordered column sequence inside `row_data`.
//! - Encodes build rows to bytes, decodes stored columns back into
//!   builders, compares probe keys against stored rows, and flips the
//!   used-flag bit.
//!
//! Row layout, 8-aligned at the row start:
//!
//! ```text
//! [next_row_ptr (8B)] [null_map] [key area] [row_data]
//! ```
//!
//! The key area is empty when the key is inlined, a fixed-width serialized
//! blob for fixed keys, and a 4-byte length plus blob for var-width keys.
//! The null map's bit 0 is the used flag when the join type marks matched
//! build rows; column null bits follow in `row_data` order, LSB first.

use std::ops::Range;
use std::sync::Arc;

use arrow::datatypes::{DataType, SchemaRef};

use crate::common::error::{JoinError, JoinResult};
use crate::exec::chunk::column::{ColumnBuilder, ColumnView, fixed_width_of};
use crate::exec::join::key_codec::{KeyLayout, SerializedKeys, var_len_prefix};
use crate::exec::join::row_table::RowTableSegment;

const NEXT_PTR_LEN: usize = 8;
const USED_FLAG_MASK: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KeyMode {
    /// Single fixed-width key; memcmp equals integer compare.
    OneInt,
    /// Concatenated serialized keys of fixed total width.
    FixedSerialized,
    /// At least one var-width key; rows carry a length-prefixed blob unless
    /// the key is inlined.
    VarSerialized,
}

/// Which stored columns a decode pass appends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DecodeSet {
    All,
    PredicateOnly,
    ExceptPredicate,
}

/// Immutable description of the build-row layout. No runtime state.
pub(crate) struct TableMeta {
    build_types: Vec<DataType>,
    key_mode: KeyMode,
    join_keys_inlined: bool,
    /// Serialized key tuple width (tags included) for fixed-width keys.
    fixed_key_width: Option<usize>,
    null_map_len: usize,
    used_flag: bool,
    col_offset_in_null_map: usize,
    /// Offset of the key area within a row: next ptr + null map.
    key_area_offset: usize,
    /// `row_data` position -> build schema column.
    row_columns_order: Vec<usize>,
    /// Serialized width per `row_data` position, -1 for var-width.
    column_sizes: Vec<i32>,
    /// Positions holding residual-predicate columns (contiguous).
    predicate_positions: Range<usize>,
    predicate_columns: Vec<usize>,
    is_fixed_length: bool,
}

impl TableMeta {
    pub(crate) fn try_new(
        build_schema: &SchemaRef,
        key_layout: &KeyLayout,
        predicate_columns: &[usize],
        needs_used_flag: bool,
    ) -> JoinResult<Arc<Self>> {
        let column_count = build_schema.fields().len();
        if column_count == 0 {
            return Err(JoinError::unsupported("build schema has no columns"));
        }
        let mut build_types = Vec::with_capacity(column_count);
        for field in build_schema.fields() {
            // Reject unsupported payload types up front.
            fixed_width_of(field.data_type())?;
            build_types.push(field.data_type().clone());
        }
        let mut predicate_columns = predicate_columns.to_vec();
        predicate_columns.sort_unstable();
        predicate_columns.dedup();
        if let Some(&max) = predicate_columns.last() {
            if max >= column_count {
                return Err(JoinError::unsupported(format!(
                    "residual predicate column {max} out of bounds for build schema"
                )));
            }
        }

        let single_var_key =
            key_layout.source_columns.len() == 1 && key_layout.var_width_count == 1;
        let join_keys_inlined = !key_layout.any_null_safe
            && (key_layout.fixed_total_width.is_some() || single_var_key);
        let key_mode = match key_layout.fixed_total_width {
            None => KeyMode::VarSerialized,
            Some(_) if key_layout.source_columns.len() == 1 && !key_layout.any_null_safe => {
                KeyMode::OneInt
            }
            Some(_) => KeyMode::FixedSerialized,
        };

        // Column order in row_data: front-load what the probe touches first.
        let mut order: Vec<usize> = Vec::with_capacity(column_count);
        let mut push_unique = |order: &mut Vec<usize>, col: usize| {
            if !order.contains(&col) {
                order.push(col);
            }
        };
        let has_predicate = !predicate_columns.is_empty();
        if join_keys_inlined {
            for &col in &key_layout.source_columns {
                push_unique(&mut order, col);
            }
        }
        let predicate_start = order.len();
        if has_predicate {
            for &col in &predicate_columns {
                push_unique(&mut order, col);
            }
        }
        let predicate_end = order.len();
        for col in 0..column_count {
            push_unique(&mut order, col);
        }
        if order.len() != column_count {
            return Err(JoinError::invariant("row column order is incomplete"));
        }

        let mut column_sizes = Vec::with_capacity(column_count);
        let mut is_fixed_length = key_layout.fixed_total_width.is_some();
        for &col in &order {
            match fixed_width_of(&build_types[col])? {
                Some(w) => column_sizes.push(w as i32),
                None => {
                    column_sizes.push(-1);
                    is_fixed_length = false;
                }
            }
        }

        let col_offset_in_null_map = if needs_used_flag { 1 } else { 0 };
        let null_map_bits = col_offset_in_null_map + column_count;
        let null_map_len = null_map_bits.div_ceil(8);

        Ok(Arc::new(Self {
            build_types,
            key_mode,
            join_keys_inlined,
            fixed_key_width: key_layout.fixed_total_width,
            null_map_len,
            used_flag: needs_used_flag,
            col_offset_in_null_map,
            key_area_offset: NEXT_PTR_LEN + null_map_len,
            row_columns_order: order,
            column_sizes,
            predicate_positions: predicate_start..predicate_end,
            predicate_columns,
            is_fixed_length,
        }))
    }

    pub(crate) fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub(crate) fn join_keys_inlined(&self) -> bool {
        self.join_keys_inlined
    }

    pub(crate) fn is_fixed_length(&self) -> bool {
        self.is_fixed_length
    }

    pub(crate) fn has_used_flag(&self) -> bool {
        self.used_flag
    }

    pub(crate) fn column_count(&self) -> usize {
        self.build_types.len()
    }

    pub(crate) fn build_types(&self) -> &[DataType] {
        &self.build_types
    }

    pub(crate) fn predicate_columns(&self) -> &[usize] {
        &self.predicate_columns
    }

    pub(crate) fn row_columns_order(&self) -> &[usize] {
        &self.row_columns_order
    }

    /// Encode one build row into `scratch` (cleared first). The serialized
    /// key for this row is taken from `keys`; for rows without a usable key
    /// the zero-filled encoding keeps the layout uniform.
    pub(crate) fn encode_row(
        &self,
        views: &[ColumnView<'_>],
        row: usize,
        keys: &SerializedKeys,
        scratch: &mut Vec<u8>,
    ) -> JoinResult<()> {
        if views.len() != self.build_types.len() {
            return Err(JoinError::invariant("column view count mismatch"));
        }
        scratch.clear();
        scratch.resize(NEXT_PTR_LEN + self.null_map_len, 0);

        if !self.join_keys_inlined {
            let key_bytes = keys.row(row);
            match self.key_mode {
                KeyMode::VarSerialized => {
                    let len = u32::try_from(key_bytes.len()).map_err(|_| {
                        JoinError::invariant("serialized key exceeds length prefix range")
                    })?;
                    scratch.extend_from_slice(&len.to_le_bytes());
                    scratch.extend_from_slice(key_bytes);
                }
                KeyMode::OneInt | KeyMode::FixedSerialized => {
                    let width = self
                        .fixed_key_width
                        .ok_or_else(|| JoinError::invariant("fixed key width missing"))?;
                    if key_bytes.len() != width {
                        return Err(JoinError::invariant(format!(
                            "serialized key width {} does not match layout width {}",
                            key_bytes.len(),
                            width
                        )));
                    }
                    scratch.extend_from_slice(key_bytes);
                }
            }
        }

        for (pos, &col) in self.row_columns_order.iter().enumerate() {
            let view = &views[col];
            if view.is_null(row) {
                let bit = self.col_offset_in_null_map + pos;
                scratch[NEXT_PTR_LEN + bit / 8] |= 1 << (bit % 8);
                match self.column_sizes[pos] {
                    -1 => scratch.extend_from_slice(&0u32.to_le_bytes()),
                    size => scratch.resize(scratch.len() + size as usize, 0),
                }
            } else {
                match self.column_sizes[pos] {
                    -1 => {
                        let len = view.value_len(row) as u32;
                        scratch.extend_from_slice(&len.to_le_bytes());
                        view.append_value_bytes(row, scratch);
                    }
                    _ => view.append_value_bytes(row, scratch),
                }
            }
        }
        Ok(())
    }

    /// Stored-column null bit, read atomically because the used flag shares
    /// the first null-map byte.
    fn is_column_null(
        &self,
        segment: &RowTableSegment,
        row: usize,
        pos: usize,
    ) -> JoinResult<bool> {
        let bit = self.col_offset_in_null_map + pos;
        let byte = segment.load_byte(row, NEXT_PTR_LEN + bit / 8)?;
        Ok((byte >> (bit % 8)) & 1 == 1)
    }

    /// Offset of `row_data` within the row bytes.
    fn row_data_offset(&self, row_bytes: &[u8]) -> JoinResult<usize> {
        if self.join_keys_inlined {
            return Ok(self.key_area_offset);
        }
        match self.key_mode {
            KeyMode::VarSerialized => {
                let len = read_u32(row_bytes, self.key_area_offset)? as usize;
                Ok(self.key_area_offset + var_len_prefix() + len)
            }
            KeyMode::OneInt | KeyMode::FixedSerialized => {
                let width = self
                    .fixed_key_width
                    .ok_or_else(|| JoinError::invariant("fixed key width missing"))?;
                Ok(self.key_area_offset + width)
            }
        }
    }

    /// Append this row's stored values for the selected columns into
    /// `builders`, one builder per build-schema column.
    pub(crate) fn decode_row(
        &self,
        segment: &RowTableSegment,
        row: usize,
        set: DecodeSet,
        builders: &mut [ColumnBuilder],
    ) -> JoinResult<()> {
        if builders.len() != self.build_types.len() {
            return Err(JoinError::invariant("decode builder count mismatch"));
        }
        let row_bytes = segment.row_bytes_from(row)?;
        let mut cursor = self.row_data_offset(row_bytes)?;
        for (pos, &col) in self.row_columns_order.iter().enumerate() {
            if set == DecodeSet::PredicateOnly && pos >= self.predicate_positions.end {
                break;
            }
            let selected = match set {
                DecodeSet::All => true,
                DecodeSet::PredicateOnly => self.predicate_positions.contains(&pos),
                DecodeSet::ExceptPredicate => !self.predicate_positions.contains(&pos),
            };
            let size = self.column_sizes[pos];
            let value_range = if size >= 0 {
                let start = cursor;
                cursor += size as usize;
                start..cursor
            } else {
                let len = read_u32(row_bytes, cursor)? as usize;
                let start = cursor + var_len_prefix();
                cursor = start + len;
                start..cursor
            };
            if !selected {
                continue;
            }
            if cursor > row_bytes.len() {
                return Err(JoinError::invariant("row decode ran past arena end"));
            }
            if self.is_column_null(segment, row, pos)? {
                builders[col].append_null();
            } else {
                builders[col].append_value_bytes(&row_bytes[value_range])?;
            }
        }
        Ok(())
    }

    /// Compare a probe row's serialized key against the stored key of one
    /// build row.
    pub(crate) fn key_matches(
        &self,
        segment: &RowTableSegment,
        row: usize,
        probe_key: &[u8],
    ) -> JoinResult<bool> {
        let row_bytes = segment.row_bytes_from(row)?;
        let stored = self.stored_key_range(row_bytes)?;
        let stored_bytes = row_bytes
            .get(stored)
            .ok_or_else(|| JoinError::invariant("stored key outside arena"))?;
        Ok(stored_bytes == probe_key)
    }

    fn stored_key_range(&self, row_bytes: &[u8]) -> JoinResult<Range<usize>> {
        let start = self.key_area_offset;
        if self.join_keys_inlined {
            return match self.key_mode {
                // Inlined fixed keys: the leading key columns of row_data
                // store exactly the serialized tuple.
                KeyMode::OneInt | KeyMode::FixedSerialized => {
                    let width = self
                        .fixed_key_width
                        .ok_or_else(|| JoinError::invariant("fixed key width missing"))?;
                    Ok(start..start + width)
                }
                // Inlined single var key: (4B len, bytes) at the front of
                // row_data matches the probe's length-prefixed encoding.
                KeyMode::VarSerialized => {
                    let len = read_u32(row_bytes, start)? as usize;
                    Ok(start..start + var_len_prefix() + len)
                }
            };
        }
        match self.key_mode {
            KeyMode::OneInt | KeyMode::FixedSerialized => {
                let width = self
                    .fixed_key_width
                    .ok_or_else(|| JoinError::invariant("fixed key width missing"))?;
                Ok(start..start + width)
            }
            KeyMode::VarSerialized => {
                let len = read_u32(row_bytes, start)? as usize;
                let blob_start = start + var_len_prefix();
                Ok(blob_start..blob_start + len)
            }
        }
    }

    /// Set the used flag; idempotent under concurrent callers.
    pub(crate) fn mark_used(&self, segment: &RowTableSegment, row: usize) -> JoinResult<()> {
        if !self.used_flag {
            return Err(JoinError::invariant(
                "mark_used on a layout without a used flag",
            ));
        }
        segment.fetch_or_byte(row, NEXT_PTR_LEN, USED_FLAG_MASK)?;
        Ok(())
    }

    pub(crate) fn is_used(&self, segment: &RowTableSegment, row: usize) -> JoinResult<bool> {
        if !self.used_flag {
            return Err(JoinError::invariant(
                "is_used on a layout without a used flag",
            ));
        }
        Ok(segment.load_byte(row, NEXT_PTR_LEN)? & USED_FLAG_MASK != 0)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> JoinResult<u32> {
    let end = offset + 4;
    let slice = bytes
        .get(offset..end)
        .ok_or_else(|| JoinError::invariant("length prefix outside arena"))?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4 bytes")))
}
