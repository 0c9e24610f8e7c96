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
//! Typed access to supported column types.
//!
//! Responsibilities:
//! - `ColumnView` reads one Arrow array through a single downcast per chunk
//!   and serializes values to the byte form used by row encoding.
//! - `ColumnBuilder` appends values back from that byte form and finishes
//!   into Arrow arrays.
//!
//! The serialized byte form is little-endian for fixed-width values and raw
//! bytes for var-width values, so that byte equality matches value equality
//! within one type.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayBuilder, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Date32Array,
    Date32Builder, Float32Array, Float32Builder, Float64Array, Float64Builder, Int8Array,
    Int8Builder, Int16Array, Int16Builder, Int32Array, Int32Builder, Int64Array, Int64Builder,
    StringArray, StringBuilder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
    UInt8Array, UInt8Builder, UInt16Array, UInt16Builder, UInt32Array, UInt32Builder, UInt64Array,
    UInt64Builder,
};
use arrow::datatypes::{DataType, TimeUnit};

use crate::common::error::{JoinError, JoinResult};

/// True when the type is usable as a join key.
///
/// Floats are excluded: `-0.0 == 0.0` breaks the byte-equality contract of
/// serialized keys. They remain valid payload types.
pub fn is_supported_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date32
            | DataType::Timestamp(TimeUnit::Microsecond, None)
            | DataType::Utf8
            | DataType::Binary
    )
}

/// Serialized width in bytes for fixed-width types, None for var-width.
pub fn fixed_width_of(data_type: &DataType) -> JoinResult<Option<usize>> {
    let width = match data_type {
        DataType::Boolean | DataType::Int8 | DataType::UInt8 => Some(1),
        DataType::Int16 | DataType::UInt16 => Some(2),
        DataType::Int32 | DataType::UInt32 | DataType::Date32 | DataType::Float32 => Some(4),
        DataType::Int64
        | DataType::UInt64
        | DataType::Float64
        | DataType::Timestamp(TimeUnit::Microsecond, None) => Some(8),
        DataType::Utf8 | DataType::Binary => None,
        other => {
            return Err(JoinError::unsupported(format!(
                "column type {other} is not supported by the join engine"
            )));
        }
    };
    Ok(width)
}

macro_rules! downcast_view {
    ($array:expr, $arrow_ty:ty, $variant:ident) => {
        $array
            .as_any()
            .downcast_ref::<$arrow_ty>()
            .map(ColumnView::$variant)
            .ok_or_else(|| {
                JoinError::invariant(format!(
                    "array downcast failed for declared type {}",
                    $array.data_type()
                ))
            })
    };
}

/// Borrowed typed view over one column of a chunk.
pub enum ColumnView<'a> {
    Boolean(&'a BooleanArray),
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    UInt8(&'a UInt8Array),
    UInt16(&'a UInt16Array),
    UInt32(&'a UInt32Array),
    UInt64(&'a UInt64Array),
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
    Date32(&'a Date32Array),
    TimestampMicros(&'a TimestampMicrosecondArray),
    Utf8(&'a StringArray),
    Binary(&'a BinaryArray),
}

impl<'a> ColumnView<'a> {
    pub fn try_new(array: &'a ArrayRef) -> JoinResult<Self> {
        match array.data_type() {
            DataType::Boolean => downcast_view!(array, BooleanArray, Boolean),
            DataType::Int8 => downcast_view!(array, Int8Array, Int8),
            DataType::Int16 => downcast_view!(array, Int16Array, Int16),
            DataType::Int32 => downcast_view!(array, Int32Array, Int32),
            DataType::Int64 => downcast_view!(array, Int64Array, Int64),
            DataType::UInt8 => downcast_view!(array, UInt8Array, UInt8),
            DataType::UInt16 => downcast_view!(array, UInt16Array, UInt16),
            DataType::UInt32 => downcast_view!(array, UInt32Array, UInt32),
            DataType::UInt64 => downcast_view!(array, UInt64Array, UInt64),
            DataType::Float32 => downcast_view!(array, Float32Array, Float32),
            DataType::Float64 => downcast_view!(array, Float64Array, Float64),
            DataType::Date32 => downcast_view!(array, Date32Array, Date32),
            DataType::Timestamp(TimeUnit::Microsecond, None) => {
                downcast_view!(array, TimestampMicrosecondArray, TimestampMicros)
            }
            DataType::Utf8 => downcast_view!(array, StringArray, Utf8),
            DataType::Binary => downcast_view!(array, BinaryArray, Binary),
            other => Err(JoinError::unsupported(format!(
                "column type {other} is not supported by the join engine"
            ))),
        }
    }

    pub fn is_null(&self, row: usize) -> bool {
        match self {
            ColumnView::Boolean(a) => a.is_null(row),
            ColumnView::Int8(a) => a.is_null(row),
            ColumnView::Int16(a) => a.is_null(row),
            ColumnView::Int32(a) => a.is_null(row),
            ColumnView::Int64(a) => a.is_null(row),
            ColumnView::UInt8(a) => a.is_null(row),
            ColumnView::UInt16(a) => a.is_null(row),
            ColumnView::UInt32(a) => a.is_null(row),
            ColumnView::UInt64(a) => a.is_null(row),
            ColumnView::Float32(a) => a.is_null(row),
            ColumnView::Float64(a) => a.is_null(row),
            ColumnView::Date32(a) => a.is_null(row),
            ColumnView::TimestampMicros(a) => a.is_null(row),
            ColumnView::Utf8(a) => a.is_null(row),
            ColumnView::Binary(a) => a.is_null(row),
        }
    }

    /// Serialized width of this column, None for var-width.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnView::Boolean(_) | ColumnView::Int8(_) | ColumnView::UInt8(_) => Some(1),
            ColumnView::Int16(_) | ColumnView::UInt16(_) => Some(2),
            ColumnView::Int32(_)
            | ColumnView::UInt32(_)
            | ColumnView::Date32(_)
            | ColumnView::Float32(_) => Some(4),
            ColumnView::Int64(_)
            | ColumnView::UInt64(_)
            | ColumnView::Float64(_)
            | ColumnView::TimestampMicros(_) => Some(8),
            ColumnView::Utf8(_) | ColumnView::Binary(_) => None,
        }
    }

    /// Byte length of this row's value; fixed width for fixed types.
    pub fn value_len(&self, row: usize) -> usize {
        match self {
            ColumnView::Utf8(a) => a.value(row).len(),
            ColumnView::Binary(a) => a.value(row).len(),
            _ => self.fixed_width().unwrap_or(0),
        }
    }

    /// Append this row's serialized value bytes. The row must be non-null.
    pub fn append_value_bytes(&self, row: usize, out: &mut Vec<u8>) {
        match self {
            ColumnView::Boolean(a) => out.push(a.value(row) as u8),
            ColumnView::Int8(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Int16(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Int32(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Int64(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::UInt8(a) => out.push(a.value(row)),
            ColumnView::UInt16(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::UInt32(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::UInt64(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Float32(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Float64(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Date32(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::TimestampMicros(a) => out.extend_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Utf8(a) => out.extend_from_slice(a.value(row).as_bytes()),
            ColumnView::Binary(a) => out.extend_from_slice(a.value(row)),
        }
    }
}

fn read_fixed<const N: usize>(bytes: &[u8]) -> JoinResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        JoinError::invariant(format!(
            "stored value has {} bytes, expected {}",
            bytes.len(),
            N
        ))
    })
}

/// Appending builder for one output column of a supported type.
#[derive(Debug)]
pub enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Date32(Date32Builder),
    TimestampMicros(TimestampMicrosecondBuilder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
}

impl ColumnBuilder {
    pub fn try_new(data_type: &DataType) -> JoinResult<Self> {
        let builder = match data_type {
            DataType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::new()),
            DataType::Int8 => ColumnBuilder::Int8(Int8Builder::new()),
            DataType::Int16 => ColumnBuilder::Int16(Int16Builder::new()),
            DataType::Int32 => ColumnBuilder::Int32(Int32Builder::new()),
            DataType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
            DataType::UInt8 => ColumnBuilder::UInt8(UInt8Builder::new()),
            DataType::UInt16 => ColumnBuilder::UInt16(UInt16Builder::new()),
            DataType::UInt32 => ColumnBuilder::UInt32(UInt32Builder::new()),
            DataType::UInt64 => ColumnBuilder::UInt64(UInt64Builder::new()),
            DataType::Float32 => ColumnBuilder::Float32(Float32Builder::new()),
            DataType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            DataType::Date32 => ColumnBuilder::Date32(Date32Builder::new()),
            DataType::Timestamp(TimeUnit::Microsecond, None) => {
                ColumnBuilder::TimestampMicros(TimestampMicrosecondBuilder::new())
            }
            DataType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
            DataType::Binary => ColumnBuilder::Binary(BinaryBuilder::new()),
            other => {
                return Err(JoinError::unsupported(format!(
                    "column type {other} is not supported by the join engine"
                )));
            }
        };
        Ok(builder)
    }

    pub fn append_null(&mut self) {
        match self {
            ColumnBuilder::Boolean(b) => b.append_null(),
            ColumnBuilder::Int8(b) => b.append_null(),
            ColumnBuilder::Int16(b) => b.append_null(),
            ColumnBuilder::Int32(b) => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_null(),
            ColumnBuilder::UInt8(b) => b.append_null(),
            ColumnBuilder::UInt16(b) => b.append_null(),
            ColumnBuilder::UInt32(b) => b.append_null(),
            ColumnBuilder::UInt64(b) => b.append_null(),
            ColumnBuilder::Float32(b) => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_null(),
            ColumnBuilder::Date32(b) => b.append_null(),
            ColumnBuilder::TimestampMicros(b) => b.append_null(),
            ColumnBuilder::Utf8(b) => b.append_null(),
            ColumnBuilder::Binary(b) => b.append_null(),
        }
    }

    /// Append a value from its serialized byte representation.
    pub fn append_value_bytes(&mut self, bytes: &[u8]) -> JoinResult<()> {
        match self {
            ColumnBuilder::Boolean(b) => b.append_value(read_fixed::<1>(bytes)?[0] != 0),
            ColumnBuilder::Int8(b) => b.append_value(i8::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Int16(b) => b.append_value(i16::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Int32(b) => b.append_value(i32::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Int64(b) => b.append_value(i64::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::UInt8(b) => b.append_value(read_fixed::<1>(bytes)?[0]),
            ColumnBuilder::UInt16(b) => b.append_value(u16::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::UInt32(b) => b.append_value(u32::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::UInt64(b) => b.append_value(u64::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Float32(b) => b.append_value(f32::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Float64(b) => b.append_value(f64::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::Date32(b) => b.append_value(i32::from_le_bytes(read_fixed(bytes)?)),
            ColumnBuilder::TimestampMicros(b) => {
                b.append_value(i64::from_le_bytes(read_fixed(bytes)?))
            }
            ColumnBuilder::Utf8(b) => {
                let value = std::str::from_utf8(bytes).map_err(|e| {
                    JoinError::invariant(format!("stored utf8 value is invalid: {e}"))
                })?;
                b.append_value(value);
            }
            ColumnBuilder::Binary(b) => b.append_value(bytes),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuilder::Boolean(b) => b.len(),
            ColumnBuilder::Int8(b) => b.len(),
            ColumnBuilder::Int16(b) => b.len(),
            ColumnBuilder::Int32(b) => b.len(),
            ColumnBuilder::Int64(b) => b.len(),
            ColumnBuilder::UInt8(b) => b.len(),
            ColumnBuilder::UInt16(b) => b.len(),
            ColumnBuilder::UInt32(b) => b.len(),
            ColumnBuilder::UInt64(b) => b.len(),
            ColumnBuilder::Float32(b) => b.len(),
            ColumnBuilder::Float64(b) => b.len(),
            ColumnBuilder::Date32(b) => b.len(),
            ColumnBuilder::TimestampMicros(b) => b.len(),
            ColumnBuilder::Utf8(b) => b.len(),
            ColumnBuilder::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Int8(b) => Arc::new(b.finish()),
            ColumnBuilder::Int16(b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt8(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt16(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt32(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float32(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Date32(b) => Arc::new(b.finish()),
            ColumnBuilder::TimestampMicros(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(b) => Arc::new(b.finish()),
        }
    }
}
