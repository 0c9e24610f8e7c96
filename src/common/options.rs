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
//! Engine tuning knobs.
//!
//! Every field is defaulted so embedders can splice the struct into their
//! own configuration files and override only what they need.

use serde::Deserialize;

const MIN_PARTITIONS: usize = 16;
const MIN_SEGMENT_SEAL_BYTES: usize = 64 * 1024;
const MAX_SEGMENT_SEAL_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct EngineOptions {
    /// Worker thread count for both stages.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum rows per output chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Logical partition count; 0 derives `max(concurrency, 16)`.
    /// Rounded up to a power of two either way.
    #[serde(default)]
    pub partition_count: usize,

    /// Arena size that seals a pre-build segment.
    #[serde(default = "default_segment_seal_bytes")]
    pub segment_seal_bytes: usize,

    /// Capacity of the probe-side pair buffer before a flush.
    #[serde(default = "default_pair_buffer_size")]
    pub pair_buffer_size: usize,

    /// Chain-walk rows between cancellation polls.
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: default_chunk_size(),
            partition_count: 0,
            segment_seal_bytes: default_segment_seal_bytes(),
            pair_buffer_size: default_pair_buffer_size(),
            cancel_check_interval: default_cancel_check_interval(),
        }
    }
}

impl EngineOptions {
    pub(crate) fn worker_count(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Effective partition count: a power of two, at least `MIN_PARTITIONS`
    /// unless explicitly configured lower.
    pub(crate) fn effective_partition_count(&self) -> usize {
        let raw = if self.partition_count == 0 {
            self.worker_count().max(MIN_PARTITIONS)
        } else {
            self.partition_count
        };
        raw.max(1).next_power_of_two()
    }

    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub(crate) fn effective_pair_buffer_size(&self) -> usize {
        self.pair_buffer_size.max(1)
    }

    pub(crate) fn effective_segment_seal_bytes(&self) -> usize {
        self.segment_seal_bytes
            .clamp(MIN_SEGMENT_SEAL_BYTES, MAX_SEGMENT_SEAL_BYTES)
    }

    pub(crate) fn effective_cancel_check_interval(&self) -> usize {
        self.cancel_check_interval.max(1)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_chunk_size() -> usize {
    4096
}

fn default_segment_seal_bytes() -> usize {
    512 * 1024
}

fn default_pair_buffer_size() -> usize {
    4096
}

fn default_cancel_check_interval() -> usize {
    1024
}
