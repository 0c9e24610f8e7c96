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
//! Parallel hash join execution.
//!
//! Build-side chunks are encoded into a partitioned row table and linked
//! into per-partition chained hash tables; probe-side chunks are then
//! matched against it in parallel. Outer/semi/anti variants whose outer
//! side is the build side finish with a scan over the row table.

pub mod build;
pub mod desc;
pub mod engine;
pub mod hash_table;
pub mod key_codec;
pub mod probe;
pub mod row_layout;
pub mod row_table;
pub mod scan;
