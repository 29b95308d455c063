//! The orchestrator: turns push events into build jobs and routes results.
//!
//! Two handlers run against shared state:
//!
//! - **events**: webhook summaries are filtered by target pattern and
//!   admitted one build per target at a time. Pushes that arrive while a
//!   target is busy are coalesced in the [`Backlog`].
//! - **results**: worker reports advance the registry. A finished build
//!   frees its target, promotes the backlog entry, and is forwarded to the
//!   output queue.

use async_trait::async_trait;
use cbench_proto::{
    BuildId, BuildRequest, BuildResponse, BuildState, BuildTarget, ProtoError,
    WebHookPayloadSummary, codec,
};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backlog::Backlog;
use crate::broker::{BrokerError, Message, Producer};
use crate::config::Settings;
use crate::registry::{Admission, BuildRegistry};
use crate::service::{Disposition, MessageHandler, QueueService, ServiceError, Subscription};

/// Reasons a build request could not be turned into a job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("build {build_id} for '{target}' is already tracked in another state")]
    RegistryConflict { target: BuildTarget, build_id: BuildId },

    #[error("failed to encode build {build_id}: {source}")]
    Encode {
        build_id: BuildId,
        #[source]
        source: ProtoError,
    },

    #[error("failed to dispatch build {build_id}: {source}")]
    Dispatch {
        build_id: BuildId,
        #[source]
        source: BrokerError,
    },
}

/// Orchestrator service. Owns the registry and backlog across runs.
#[derive(Debug)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    registry: Arc<BuildRegistry>,
    backlog: Arc<Backlog>,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(BuildRegistry::new()),
            backlog: Arc::new(Backlog::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    pub fn backlog(&self) -> &Arc<Backlog> {
        &self.backlog
    }

    /// Binds the shared state to a producer for one run.
    pub fn control_loop(&self, producer: Arc<dyn Producer>) -> ControlLoop {
        ControlLoop {
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            backlog: Arc::clone(&self.backlog),
            producer,
            dispatching: DashSet::new(),
        }
    }
}

#[async_trait]
impl QueueService for Orchestrator {
    fn name(&self) -> &str {
        "orchestrator"
    }

    fn queues(&self) -> Vec<String> {
        vec![
            self.settings.event_queue.clone(),
            self.settings.result_queue.clone(),
            self.settings.work_queue.clone(),
            self.settings.output_queue.clone(),
        ]
    }

    fn handler_concurrency(&self) -> usize {
        self.settings.handler_concurrency
    }

    async fn subscribe(&self, producer: Arc<dyn Producer>) -> Result<Vec<Subscription>, ServiceError> {
        let control = Arc::new(self.control_loop(producer));
        Ok(vec![
            Subscription::new(
                self.settings.event_queue.clone(),
                Arc::new(EventHandler(Arc::clone(&control))),
            ),
            Subscription::new(
                self.settings.result_queue.clone(),
                Arc::new(ResultHandler(control)),
            ),
        ])
    }
}

/// Message handling for one run of the orchestrator.
pub struct ControlLoop {
    settings: Arc<Settings>,
    registry: Arc<BuildRegistry>,
    backlog: Arc<Backlog>,
    producer: Arc<dyn Producer>,
    /// Builds with a send in flight.
    dispatching: DashSet<BuildId>,
}

impl ControlLoop {
    /// Handles one webhook summary from the event queue.
    ///
    /// Malformed and filtered events are acknowledged and dropped. An event
    /// whose job could not be dispatched is left for redelivery.
    pub async fn on_event(&self, message: &Message) -> Disposition {
        let Some(summary) = decode::<WebHookPayloadSummary>(&self.settings.event_queue, message)
        else {
            return Disposition::Ack;
        };

        let request = BuildRequest::from_summary(&summary);
        if !self.settings.matches(&request.target) {
            debug!(
                target_ref = %request.target,
                build_id = %request.id,
                "No target pattern matches; event discarded"
            );
            return Disposition::Ack;
        }

        match self.process_build_request(request).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(error = %e, "Event left for redelivery");
                Disposition::Leave
            }
        }
    }

    /// Handles one worker report from the result queue. Always acknowledged.
    pub async fn on_result(&self, message: &Message) -> Disposition {
        let Some(response) = decode::<BuildResponse>(&self.settings.result_queue, message) else {
            return Disposition::Ack;
        };

        let request = &response.request;
        let target = &request.target;
        match response.state {
            BuildState::Building => {
                self.registry
                    .update(target, request, BuildState::Requested, BuildState::Building);
            }
            BuildState::Built => {
                let completion =
                    self.registry
                        .complete(target, request, BuildState::Building, &self.backlog);
                if !completion.removed {
                    warn!(
                        target_ref = %target,
                        build_id = %request.id,
                        "Finished build is tracked past BUILDING; target stays busy"
                    );
                }
                if let Some(next) = completion.next {
                    info!(target_ref = %target, build_id = %next.id, "Promoting backlogged request");
                    if let Err(e) = self.dispatch(&next).await {
                        error!(error = %e, "Promoted request could not be dispatched");
                    }
                }
                self.forward(message, &response).await;
            }
            state if state.is_failure_state() => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    state = %state,
                    "Worker reported a failure; not tracked"
                );
            }
            state => {
                debug!(
                    target_ref = %target,
                    build_id = %request.id,
                    state = %state,
                    "Result state not tracked"
                );
            }
        }
        Disposition::Ack
    }

    /// Admits a request and, if its target is free, hands it to a worker.
    pub async fn process_build_request(&self, request: BuildRequest) -> Result<(), OrchestratorError> {
        let target = request.target.clone();

        if self.settings.admit_all {
            if !self
                .registry
                .insert(&target, &request, BuildState::Requesting)
            {
                return Err(OrchestratorError::RegistryConflict {
                    target,
                    build_id: request.id,
                });
            }
            return self.dispatch(&request).await;
        }

        match self.registry.admit(&target, &request, &self.backlog) {
            Admission::Admitted => self.dispatch(&request).await,
            Admission::Duplicate(BuildState::Requesting) => {
                info!(target_ref = %target, build_id = %request.id, "Retrying dispatch");
                self.dispatch(&request).await
            }
            Admission::Duplicate(state) => {
                debug!(
                    target_ref = %target,
                    build_id = %request.id,
                    state = %state,
                    "Duplicate event for a tracked build"
                );
                Ok(())
            }
            Admission::Backlogged => {
                info!(target_ref = %target, build_id = %request.id, "Target busy; request backlogged");
                Ok(())
            }
        }
    }

    /// Sends a `REQUESTING` build to the work queue and marks it `REQUESTED`.
    ///
    /// At most one send per build is in flight; a concurrent attempt for the
    /// same build returns without sending.
    async fn dispatch(&self, request: &BuildRequest) -> Result<(), OrchestratorError> {
        let Some(_claim) = DispatchClaim::take(&self.dispatching, &request.id) else {
            debug!(build_id = %request.id, "Dispatch already in progress");
            return Ok(());
        };

        let payload = codec::encode(request).map_err(|source| OrchestratorError::Encode {
            build_id: request.id.clone(),
            source,
        })?;
        self.producer
            .send(&self.settings.work_queue, Message::Text(payload))
            .await
            .map_err(|source| OrchestratorError::Dispatch {
                build_id: request.id.clone(),
                source,
            })?;

        self.registry.update(
            &request.target,
            request,
            BuildState::Requesting,
            BuildState::Requested,
        );
        info!(
            target_ref = %request.target,
            build_id = %request.id,
            revision = %request.revision,
            "Build dispatched"
        );
        Ok(())
    }

    async fn forward(&self, message: &Message, response: &BuildResponse) {
        match self
            .producer
            .send(&self.settings.output_queue, message.clone())
            .await
        {
            Ok(()) => debug!(build_id = %response.request.id, "Result forwarded"),
            Err(e) => error!(
                build_id = %response.request.id,
                error = %e,
                "Failed to forward result"
            ),
        }
    }
}

/// Marks a build as being dispatched until dropped.
struct DispatchClaim<'a> {
    claims: &'a DashSet<BuildId>,
    id: BuildId,
}

impl<'a> DispatchClaim<'a> {
    fn take(claims: &'a DashSet<BuildId>, id: &BuildId) -> Option<Self> {
        claims.insert(id.clone()).then(|| Self {
            claims,
            id: id.clone(),
        })
    }
}

impl Drop for DispatchClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

fn decode<T: DeserializeOwned>(queue: &str, message: &Message) -> Option<T> {
    let Some(text) = message.as_text() else {
        warn!(queue = %queue, "Discarding non-text message");
        return None;
    };
    match codec::decode(text) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(queue = %queue, error = %e, "Discarding undecodable message");
            None
        }
    }
}

struct EventHandler(Arc<ControlLoop>);

#[async_trait]
impl MessageHandler for EventHandler {
    async fn handle(&self, message: &Message) -> Disposition {
        self.0.on_event(message).await
    }
}

struct ResultHandler(Arc<ControlLoop>);

#[async_trait]
impl MessageHandler for ResultHandler {
    async fn handle(&self, message: &Message) -> Disposition {
        self.0.on_result(message).await
    }
}
