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
//! scree: a parallel in-memory hash join engine for columnar data.
//!
//! The engine consumes two column-oriented inputs, fully indexes the build
//! side into a partitioned row table plus chained hash tables, then probes
//! it in parallel to produce joined output chunks for all supported join
//! types, with optional non-equi residual predicates.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::error::{JoinError, JoinResult};
pub use common::options::EngineOptions;
pub use exec::chunk::{Chunk, ChunkBuilder};
pub use exec::join::desc::{JoinKeyDesc, JoinType};
pub use exec::join::engine::{
    ChunkSink, ChunkSource, HashJoinEngine, JoinRuntimeStats, JoinSpec, ResidualPredicate,
};
pub use runtime::cancel::CancelToken;
pub use runtime::mem_tracker::MemTracker;
