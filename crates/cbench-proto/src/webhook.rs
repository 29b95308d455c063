//! Summary of a GitHub push webhook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::BuildId;

/// The parts of a push event the orchestrator cares about.
///
/// Produced by the webhook listener after it has parsed and verified the
/// raw GitHub payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebHookPayloadSummary {
    pub id: BuildId,
    pub timestamp: DateTime<Utc>,

    /// Pushed ref, e.g. `refs/heads/main`.
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Revision before the push.
    pub before: String,

    /// Revision after the push.
    pub after: String,

    /// Clone URL of the repository.
    pub repository: String,

    pub pusher: String,
    pub sender: String,
}

impl WebHookPayloadSummary {
    /// Creates a summary with a fresh id and the current time.
    pub fn new(
        git_ref: impl Into<String>,
        before: impl Into<String>,
        after: impl Into<String>,
        repository: impl Into<String>,
        pusher: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            id: BuildId::generate(),
            timestamp: Utc::now(),
            git_ref: git_ref.into(),
            before: before.into(),
            after: after.into(),
            repository: repository.into(),
            pusher: pusher.into(),
            sender: sender.into(),
        }
    }
}
