//! Build responses reported by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

use crate::detail::BuildDetail;
use crate::request::{BuildId, BuildRequest};
use crate::state::BuildState;

/// Progress or completion report for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub id: BuildId,
    pub timestamp: DateTime<Utc>,
    pub state: BuildState,

    /// The request being reported on, echoed back verbatim.
    pub request: BuildRequest,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BuildStatistics>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<BuildDetail>>,
}

impl BuildResponse {
    /// Creates a bare response for `request` in `state`.
    pub fn new(request: BuildRequest, state: BuildState) -> Self {
        Self {
            id: BuildId::generate(),
            timestamp: Utc::now(),
            state,
            request,
            statistics: None,
            details: None,
        }
    }

    pub fn with_statistics(mut self, statistics: BuildStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_detail(mut self, detail: BuildDetail) -> Self {
        self.details.get_or_insert_with(Vec::new).push(detail);
        self
    }
}

/// Wall-clock time spent in each worker stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildStatistics {
    #[serde(rename = "update_source_ms", with = "millis")]
    pub update_source: Duration,

    #[serde(rename = "build_ms", with = "millis")]
    pub build: Duration,

    #[serde(rename = "benchmark_ms", with = "millis")]
    pub benchmark: Duration,
}

impl BuildStatistics {
    pub fn total(&self) -> Duration {
        self.update_source + self.build + self.benchmark
    }
}

mod millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
