//! Core of the cbench orchestrator.
//!
//! This crate provides:
//! - [`BuildRegistry`]: per-target tracking of in-flight builds
//! - [`Backlog`]: newest-wins holding area for pushes to busy targets
//! - [`broker`]: message broker traits and an in-process implementation
//! - [`service`]: lifecycle wrapper for queue-driven services
//! - [`Orchestrator`]: the control loop tying them together
//! - [`OrchestratorConfig`]: YAML configuration

mod backlog;
pub mod broker;
mod config;
mod orchestrator;
mod registry;
pub mod service;

pub use backlog::Backlog;
pub use config::{ConfigError, ConfigWarning, OrchestratorConfig, Settings};
pub use orchestrator::{ControlLoop, Orchestrator, OrchestratorError};
pub use registry::{Admission, BuildRecord, BuildRegistry, Completion};
pub use service::{
    Disposition, Lifecycle, MessageHandler, QueueService, ServiceError, ServiceHandle,
    ServiceRunner, ServiceState, Subscription,
};
