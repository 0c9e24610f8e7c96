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
//! Error kinds surfaced by the join engine.
//!
//! The first error raised by any worker wins; everything after it is
//! discarded while the remaining workers unwind through the abort flag.

use thiserror::Error;

/// Errors surfaced from `build` and `probe`.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The external cancellation token was flipped.
    #[error("join cancelled")]
    Cancelled,

    /// The memory tracker refused an allocation.
    #[error("memory quota exceeded: requested {requested} bytes over limit {limit}")]
    OutOfQuota { limit: i64, requested: i64 },

    /// A build or probe chunk source failed.
    #[error("upstream batch source failed: {0}")]
    Upstream(String),

    /// The residual predicate evaluator failed.
    #[error("residual predicate failed: {0}")]
    Predicate(String),

    /// The output sink rejected a chunk.
    #[error("output sink failed: {0}")]
    Sink(String),

    /// The requested join configuration is not expressible by this engine.
    #[error("unsupported join configuration: {0}")]
    Unsupported(String),

    /// Internal consistency check failed. Should be impossible in a correct build.
    #[error("join invariant violated: {0}")]
    InvariantViolated(String),
}

impl JoinError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        JoinError::InvariantViolated(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        JoinError::Unsupported(message.into())
    }
}

pub type JoinResult<T> = Result<T, JoinError>;
