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
//! Join type and key configuration.
//!
//! Responsibilities:
//! - Declares the supported join types and equality key descriptors.
//! - Derives the per-join probe/mark/scan strategy once at setup so the
//!   probe hot path dispatches on a single discriminator.

use crate::common::error::{JoinError, JoinResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
    NullAwareLeftAnti,
}

impl JoinType {
    /// Stable string label used by diagnostics and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT_OUTER",
            JoinType::RightOuter => "RIGHT_OUTER",
            JoinType::FullOuter => "FULL_OUTER",
            JoinType::LeftSemi => "LEFT_SEMI",
            JoinType::RightSemi => "RIGHT_SEMI",
            JoinType::LeftAnti => "LEFT_ANTI",
            JoinType::RightAnti => "RIGHT_ANTI",
            JoinType::NullAwareLeftAnti => "NULL_AWARE_LEFT_ANTI",
        }
    }
}

/// One equality key: a build column joined to a probe column.
///
/// `null_safe_eq` selects `<=>` semantics: null matches null for this key.
#[derive(Clone, Copy, Debug)]
pub struct JoinKeyDesc {
    pub build_column: usize,
    pub probe_column: usize,
    pub null_safe_eq: bool,
}

impl JoinKeyDesc {
    pub fn new(build_column: usize, probe_column: usize) -> Self {
        Self {
            build_column,
            probe_column,
            null_safe_eq: false,
        }
    }

    pub fn null_safe(build_column: usize, probe_column: usize) -> Self {
        Self {
            build_column,
            probe_column,
            null_safe_eq: true,
        }
    }
}

/// What the probe stage emits per probe row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeBehavior {
    /// Matched pairs only.
    EmitPairs,
    /// Matched pairs, plus a null-extended row per unmatched probe row.
    EmitPairsAndUnmatchedProbe,
    /// The probe row once, on its first surviving match.
    EmitProbeOnMatch,
    /// The probe row, when no match survives.
    EmitProbeOnNoMatch,
    /// Anti join with null-as-wildcard key semantics.
    NullAwareAnti,
    /// Nothing; only build-side used flags are updated.
    MarkOnly,
}

/// What the post-probe row-table scan emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScanEmit {
    None,
    /// Unused build rows, null-extended on the probe side.
    UnmatchedWithNullProbe,
    /// Used build rows alone (build-side semi).
    MatchedBuildOnly,
    /// Unused build rows alone (build-side anti).
    UnmatchedBuildOnly,
}

/// Shape of the output chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputLayout {
    /// Probe and build columns, ordered left-then-right.
    PairsBoth,
    ProbeOnly,
    BuildOnly,
}

/// Join-type strategy resolved once at engine setup.
#[derive(Clone, Copy, Debug)]
pub(crate) struct JoinStrategy {
    pub behavior: ProbeBehavior,
    pub mark_used: bool,
    pub scan: ScanEmit,
}

impl JoinStrategy {
    pub(crate) fn derive(join_type: JoinType, probe_is_left: bool) -> JoinResult<Self> {
        use JoinType::*;
        let strategy = match (join_type, probe_is_left) {
            (Inner, _) => Self::new(ProbeBehavior::EmitPairs, false, ScanEmit::None),
            (LeftOuter, true) | (RightOuter, false) => Self::new(
                ProbeBehavior::EmitPairsAndUnmatchedProbe,
                false,
                ScanEmit::None,
            ),
            (LeftOuter, false) | (RightOuter, true) => Self::new(
                ProbeBehavior::EmitPairs,
                true,
                ScanEmit::UnmatchedWithNullProbe,
            ),
            (FullOuter, _) => Self::new(
                ProbeBehavior::EmitPairsAndUnmatchedProbe,
                true,
                ScanEmit::UnmatchedWithNullProbe,
            ),
            (LeftSemi, true) | (RightSemi, false) => {
                Self::new(ProbeBehavior::EmitProbeOnMatch, false, ScanEmit::None)
            }
            (LeftSemi, false) | (RightSemi, true) => {
                Self::new(ProbeBehavior::MarkOnly, true, ScanEmit::MatchedBuildOnly)
            }
            (LeftAnti, true) | (RightAnti, false) => {
                Self::new(ProbeBehavior::EmitProbeOnNoMatch, false, ScanEmit::None)
            }
            (LeftAnti, false) | (RightAnti, true) => {
                Self::new(ProbeBehavior::MarkOnly, true, ScanEmit::UnmatchedBuildOnly)
            }
            (NullAwareLeftAnti, true) => {
                Self::new(ProbeBehavior::NullAwareAnti, false, ScanEmit::None)
            }
            (NullAwareLeftAnti, false) => {
                return Err(JoinError::unsupported(
                    "NULL_AWARE_LEFT_ANTI requires the probe side to be the left input",
                ));
            }
        };
        Ok(strategy)
    }

    fn new(behavior: ProbeBehavior, mark_used: bool, scan: ScanEmit) -> Self {
        Self {
            behavior,
            mark_used,
            scan,
        }
    }

    pub(crate) fn needs_used_flag(&self) -> bool {
        self.mark_used
    }

    pub(crate) fn needs_scan_row_table(&self) -> bool {
        self.scan != ScanEmit::None
    }

    pub(crate) fn output_layout(&self) -> OutputLayout {
        match self.behavior {
            ProbeBehavior::EmitPairs | ProbeBehavior::EmitPairsAndUnmatchedProbe => {
                OutputLayout::PairsBoth
            }
            ProbeBehavior::EmitProbeOnMatch
            | ProbeBehavior::EmitProbeOnNoMatch
            | ProbeBehavior::NullAwareAnti => OutputLayout::ProbeOnly,
            ProbeBehavior::MarkOnly => OutputLayout::BuildOnly,
        }
    }
}
