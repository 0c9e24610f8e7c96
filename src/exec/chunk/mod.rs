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
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::error::{JoinError, JoinResult};

pub mod column;

use column::ColumnBuilder;

/// A chunk of data, consisting of multiple rows.
/// Wrapper around an Arrow RecordBatch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, index: usize) -> JoinResult<&ArrayRef> {
        self.batch.columns().get(index).ok_or_else(|| {
            JoinError::invariant(format!(
                "column index {} out of bounds (num_columns={})",
                index,
                self.batch.num_columns()
            ))
        })
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

/// Column-wise chunk assembly with a row capacity hint.
///
/// The finished chunk may carry fewer rows than `capacity`; callers that
/// interleave appends across columns are responsible for keeping every
/// column at the same length before `finish`.
pub struct ChunkBuilder {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
}

impl ChunkBuilder {
    pub fn try_new(schema: SchemaRef) -> JoinResult<Self> {
        let mut builders = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            builders.push(ColumnBuilder::try_new(field.data_type())?);
        }
        Ok(Self { schema, builders })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn column(&mut self, index: usize) -> JoinResult<&mut ColumnBuilder> {
        let count = self.builders.len();
        self.builders.get_mut(index).ok_or_else(|| {
            JoinError::invariant(format!(
                "builder column index {} out of bounds (num_columns={})",
                index, count
            ))
        })
    }

    pub fn columns_mut(&mut self) -> &mut [ColumnBuilder] {
        &mut self.builders
    }

    /// Rows appended so far, taken from the first column.
    pub fn len(&self) -> usize {
        self.builders.first().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(&mut self) -> JoinResult<Chunk> {
        let row_count = self.len();
        let mut arrays = Vec::with_capacity(self.builders.len());
        for builder in self.builders.iter_mut() {
            let array = builder.finish();
            if array.len() != row_count {
                return Err(JoinError::invariant(format!(
                    "ragged chunk: column has {} rows, expected {}",
                    array.len(),
                    row_count
                )));
            }
            arrays.push(array);
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .map_err(|e| JoinError::invariant(format!("chunk assembly failed: {e}")))?;
        Ok(Chunk::new(batch))
    }
}

/// Concatenate two schemas in output order.
pub fn concat_schemas(left: &SchemaRef, right: &SchemaRef) -> SchemaRef {
    let mut fields = Vec::with_capacity(left.fields().len() + right.fields().len());
    fields.extend(left.fields().iter().cloned());
    fields.extend(right.fields().iter().cloned());
    Arc::new(Schema::new(fields))
}
