//! Build lifecycle states.
//!
//! The states form a rooted forest: a linear backbone
//! (`REQUESTING` through `BENCHMARKING`), a failure leaf hanging off each
//! stage that can fail, and one terminal success leaf (`BENCHMARKED`).
//! Every non-initial state names the state it must follow.
//!
//! Nothing here enforces transitions. The registry tracks whatever the
//! caller asks it to; [`BuildState::is_legal_transition`] is available for
//! callers that want to validate a jump against the graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

/// Lifecycle tag of a build.
///
/// Serialized as its wire tag; [`BuildState::as_str`] is the only table of tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum BuildState {
    Requesting,
    Requested,
    UpdatingSource,
    SourceUpdated,
    SourceUpdateFailed,
    Building,
    Built,
    BuildFailed,
    Benchmarking,
    BenchmarkingFailed,
    Benchmarked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Progress,
    Failure,
    FinalSuccess,
}

impl BuildState {
    /// Every state, in backbone order.
    pub const ALL: [BuildState; 11] = [
        BuildState::Requesting,
        BuildState::Requested,
        BuildState::UpdatingSource,
        BuildState::SourceUpdated,
        BuildState::SourceUpdateFailed,
        BuildState::Building,
        BuildState::Built,
        BuildState::BuildFailed,
        BuildState::Benchmarking,
        BuildState::BenchmarkingFailed,
        BuildState::Benchmarked,
    ];

    /// The state this one must follow, or `None` for the initial state.
    pub fn predecessor(self) -> Option<BuildState> {
        match self {
            BuildState::Requesting => None,
            BuildState::Requested => Some(BuildState::Requesting),
            BuildState::UpdatingSource => Some(BuildState::Requested),
            BuildState::SourceUpdated | BuildState::SourceUpdateFailed => {
                Some(BuildState::UpdatingSource)
            }
            BuildState::Building => Some(BuildState::SourceUpdated),
            BuildState::Built | BuildState::BuildFailed => Some(BuildState::Building),
            BuildState::Benchmarking => Some(BuildState::Built),
            BuildState::BenchmarkingFailed | BuildState::Benchmarked => {
                Some(BuildState::Benchmarking)
            }
        }
    }

    fn category(self) -> Category {
        match self {
            BuildState::SourceUpdateFailed
            | BuildState::BuildFailed
            | BuildState::BenchmarkingFailed => Category::Failure,
            BuildState::Benchmarked => Category::FinalSuccess,
            _ => Category::Progress,
        }
    }

    /// True for backbone states: the build is still moving forward.
    pub fn is_progress_state(self) -> bool {
        self.category() == Category::Progress
    }

    /// True for the failure leaves.
    pub fn is_failure_state(self) -> bool {
        self.category() == Category::Failure
    }

    /// True only for the terminal success leaf.
    pub fn is_final_success_state(self) -> bool {
        self.category() == Category::FinalSuccess
    }

    /// True when no further transition is expected.
    pub fn is_final_state(self) -> bool {
        self.is_failure_state() || self.is_final_success_state()
    }

    /// True if `to` directly follows `from` in the predecessor graph.
    pub fn is_legal_transition(from: BuildState, to: BuildState) -> bool {
        to.predecessor() == Some(from)
    }

    /// True if `self` lies on the path from the root to `later`, excluding `later`.
    pub fn precedes(self, later: BuildState) -> bool {
        let mut current = later.predecessor();
        while let Some(state) = current {
            if state == self {
                return true;
            }
            current = state.predecessor();
        }
        false
    }

    /// Wire tag, e.g. `"BUILDING"`.
    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Requesting => "REQUESTING",
            BuildState::Requested => "REQUESTED",
            BuildState::UpdatingSource => "UPDATING_SOURCE",
            BuildState::SourceUpdated => "SOURCE_UPDATED",
            BuildState::SourceUpdateFailed => "SOURCE_UPDATE_FAILED",
            BuildState::Building => "BUILDING",
            BuildState::Built => "BUILT",
            BuildState::BuildFailed => "BUILD_FAILED",
            BuildState::Benchmarking => "BENCHMARKING",
            BuildState::BenchmarkingFailed => "BENCHMARKING_FAILED",
            BuildState::Benchmarked => "BENCHMARKED",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ProtoError::UnknownState(s.to_string()))
    }
}

impl From<BuildState> for &'static str {
    fn from(state: BuildState) -> Self {
        state.as_str()
    }
}

impl TryFrom<String> for BuildState {
    type Error = ProtoError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}
