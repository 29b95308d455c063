//! Build requests: the work items handed to workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::webhook::WebHookPayloadSummary;

/// Globally unique identifier of a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Creates an id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The thing being built repeatedly, in practice a git ref.
///
/// All admission and backlog decisions are scoped per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTarget(String);

impl BuildTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BuildTarget {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An immutable request to build and benchmark one revision of a target.
///
/// Flows unchanged from the orchestrator to a worker and comes back
/// embedded in every [`BuildResponse`](crate::BuildResponse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildId,
    pub timestamp: DateTime<Utc>,

    /// Repository location to check out from.
    pub source: String,

    /// Ref being built.
    pub target: BuildTarget,

    /// Revision to build.
    pub revision: String,

    /// Who asked for the build.
    pub requester: String,
}

impl BuildRequest {
    /// Translates a push summary into a build request.
    ///
    /// The summary's id and timestamp carry over, so redelivering the same
    /// event always yields the same build id.
    pub fn from_summary(summary: &WebHookPayloadSummary) -> Self {
        Self {
            id: summary.id.clone(),
            timestamp: summary.timestamp,
            source: summary.repository.clone(),
            target: BuildTarget::new(summary.git_ref.clone()),
            revision: summary.after.clone(),
            requester: summary.pusher.clone(),
        }
    }
}
