//! # cbench-proto
//!
//! Shared types, error definitions, and the build state machine for cbench.
//!
//! This crate provides the records exchanged between the orchestrator,
//! the build workers, and the publisher:
//! - `WebHookPayloadSummary` for inbound push events
//! - `BuildRequest` and `BuildResponse` for work items and results
//! - `BuildState` and its predecessor graph
//! - Text codec helpers for putting records on a queue

pub mod codec;
mod detail;
mod error;
mod request;
mod response;
mod state;
mod webhook;

pub use detail::{BuildDetail, Compression, Encoding};
pub use error::{ProtoError, Result};
pub use request::{BuildId, BuildRequest, BuildTarget};
pub use response::{BuildResponse, BuildStatistics};
pub use state::BuildState;
pub use webhook::WebHookPayloadSummary;
