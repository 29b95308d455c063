//! End-to-end scenarios for the orchestrator running against the in-process broker.
//!
//! Tests cover:
//! - Admission of the first push to a target
//! - Coalescing of pushes while a target is busy
//! - Result handling and backlog promotion, including reordered results
//! - Target filtering
//! - Redelivery of events (duplicates and failed dispatches)

use cbench_core::broker::{InMemoryBroker, Message};
use cbench_core::{Orchestrator, OrchestratorConfig, ServiceHandle, ServiceRunner};
use cbench_proto::{BuildRequest, BuildResponse, BuildState, BuildTarget, WebHookPayloadSummary, codec};
use std::sync::Arc;
use std::time::Duration;

const EVENTS: &str = "cbench.events";
const RESULTS: &str = "cbench.results";
const REQUESTS: &str = "cbench.requests";
const OUTPUTS: &str = "cbench.outputs";
const TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    broker: InMemoryBroker,
    runner: ServiceRunner<Orchestrator>,
    handle: ServiceHandle,
}

impl Harness {
    async fn start(config: OrchestratorConfig) -> Self {
        let broker = InMemoryBroker::new();
        let orchestrator = Orchestrator::new(config.settings().expect("valid config"));
        let runner = ServiceRunner::new(orchestrator, Arc::new(broker.clone()));
        let handle = runner.run_async().await.expect("service starts");
        Self {
            broker,
            runner,
            handle,
        }
    }

    fn orchestrator(&self) -> &Orchestrator {
        self.runner.service()
    }

    fn state_of(&self, request: &BuildRequest) -> Option<BuildState> {
        self.orchestrator()
            .registry()
            .state_of(&request.target, &request.id)
    }

    /// Publishes an event and waits until it has been acknowledged.
    async fn push(&self, summary: &WebHookPayloadSummary) {
        self.broker
            .publish(EVENTS, Message::Text(codec::encode(summary).unwrap()));
        self.settle(EVENTS).await;
    }

    async fn report(&self, request: &BuildRequest, state: BuildState) -> Message {
        let message = self.publish_result(request, state);
        self.settle(RESULTS).await;
        message
    }

    /// Publishes a worker report without waiting for it to be handled.
    fn publish_result(&self, request: &BuildRequest, state: BuildState) -> Message {
        let message = Message::Text(
            codec::encode(&BuildResponse::new(request.clone(), state)).unwrap(),
        );
        self.broker.publish(RESULTS, message.clone());
        message
    }

    /// Waits until `queue` has nothing ready and nothing outstanding.
    async fn settle(&self, queue: &str) {
        let broker = &self.broker;
        assert!(
            eventually(|| broker.ready_len(queue) == 0 && broker.unacked_len(queue) == 0).await,
            "{queue} did not settle"
        );
    }

    fn jobs(&self) -> Vec<BuildRequest> {
        self.broker
            .drain(REQUESTS)
            .iter()
            .map(|m| codec::decode(m.as_text().unwrap()).unwrap())
            .collect()
    }

    async fn stop(self) {
        self.handle.close().await.expect("service closes");
        assert_eq!(self.broker.open_connections(), 0);
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll).await.is_ok()
}

fn summary(git_ref: &str, after: &str) -> WebHookPayloadSummary {
    WebHookPayloadSummary::new(
        git_ref,
        "0000000",
        after,
        "https://github.com/acme/widgets.git",
        "alice",
        "alice",
    )
}

#[tokio::test]
async fn push_build_and_backlog_promotion() {
    let harness = Harness::start(OrchestratorConfig::default()).await;
    let main = BuildTarget::from("refs/heads/main");

    // First push to an idle target becomes a job.
    let first = summary("refs/heads/main", "aaa");
    harness.push(&first).await;
    let first_request = BuildRequest::from_summary(&first);
    assert!(eventually(|| harness.state_of(&first_request) == Some(BuildState::Requested)).await);
    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, first.id);

    // A second push while busy is held back.
    let second = summary("refs/heads/main", "bbb");
    harness.push(&second).await;
    assert!(harness.jobs().is_empty());
    assert_eq!(
        harness.orchestrator().backlog().peek(&main).map(|r| r.id),
        Some(second.id.clone())
    );

    // Building only advances the registry.
    harness.report(&first_request, BuildState::Building).await;
    assert_eq!(harness.state_of(&first_request), Some(BuildState::Building));
    assert_eq!(harness.broker.ready_len(OUTPUTS), 0);

    // Built frees the target, promotes the backlog, and forwards the result.
    let built = harness.report(&first_request, BuildState::Built).await;
    assert!(harness.broker.wait_for_ready(OUTPUTS, 1, TIMEOUT).await);
    assert_eq!(harness.broker.drain(OUTPUTS), vec![built]);
    assert!(harness.broker.wait_for_ready(REQUESTS, 1, TIMEOUT).await);

    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, second.id);
    assert_eq!(jobs[0].revision, "bbb");
    assert_eq!(harness.state_of(&first_request), None);
    let second_request = BuildRequest::from_summary(&second);
    assert!(eventually(|| harness.state_of(&second_request) == Some(BuildState::Requested)).await);
    assert!(harness.orchestrator().backlog().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn backlog_keeps_only_the_newest_push() {
    let harness = Harness::start(OrchestratorConfig::default()).await;
    let main = BuildTarget::from("refs/heads/main");

    let first = summary("refs/heads/main", "aaa");
    harness.push(&first).await;
    let newer = summary("refs/heads/main", "bbb");
    let newest = summary("refs/heads/main", "ccc");
    harness.push(&newer).await;
    harness.push(&newest).await;

    assert_eq!(
        harness.orchestrator().backlog().peek(&main).map(|r| r.revision),
        Some("ccc".to_string())
    );
    assert_eq!(harness.jobs().len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn unmatched_refs_are_discarded() {
    let config = OrchestratorConfig {
        target_patterns: vec!["refs/heads/main".to_string()],
        ..OrchestratorConfig::default()
    };
    let harness = Harness::start(config).await;

    harness.push(&summary("refs/heads/feature/x", "aaa")).await;

    assert!(harness.jobs().is_empty());
    assert!(harness.orchestrator().registry().is_empty());
    assert!(harness.orchestrator().backlog().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn targets_build_in_parallel() {
    let harness = Harness::start(OrchestratorConfig::default()).await;

    harness.push(&summary("refs/heads/main", "aaa")).await;
    harness.push(&summary("refs/heads/dev", "bbb")).await;

    assert!(harness.broker.wait_for_ready(REQUESTS, 2, TIMEOUT).await);
    assert_eq!(harness.orchestrator().registry().len(), 2);
    assert!(harness.orchestrator().backlog().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn redelivered_event_is_not_built_twice() {
    let harness = Harness::start(OrchestratorConfig::default()).await;
    let push = summary("refs/heads/main", "aaa");
    let request = BuildRequest::from_summary(&push);

    harness.push(&push).await;
    assert!(eventually(|| harness.state_of(&request) == Some(BuildState::Requested)).await);
    harness.push(&push).await;

    assert_eq!(harness.jobs().len(), 1);
    assert!(harness.orchestrator().backlog().is_empty());
    assert_eq!(harness.state_of(&request), Some(BuildState::Requested));
    harness.stop().await;
}

#[tokio::test]
async fn failed_dispatch_is_retried_on_redelivery() {
    let harness = Harness::start(OrchestratorConfig::default()).await;
    let push = summary("refs/heads/main", "aaa");
    let request = BuildRequest::from_summary(&push);

    harness.broker.fail_sends_to(REQUESTS);
    harness
        .broker
        .publish(EVENTS, Message::Text(codec::encode(&push).unwrap()));
    let broker = &harness.broker;
    assert!(eventually(|| broker.unacked_len(EVENTS) == 1).await);
    assert_eq!(harness.state_of(&request), Some(BuildState::Requesting));

    broker.restore_sends_to(REQUESTS);
    assert_eq!(broker.recover(EVENTS), 1);
    harness.settle(EVENTS).await;

    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, push.id);
    assert!(eventually(|| harness.state_of(&request) == Some(BuildState::Requested)).await);
    harness.stop().await;
}

#[tokio::test]
async fn admit_all_skips_the_backlog() {
    let config = OrchestratorConfig {
        admit_all: true,
        ..OrchestratorConfig::default()
    };
    let harness = Harness::start(config).await;

    harness.push(&summary("refs/heads/main", "aaa")).await;
    harness.push(&summary("refs/heads/main", "bbb")).await;

    assert!(harness.broker.wait_for_ready(REQUESTS, 2, TIMEOUT).await);
    assert!(harness.orchestrator().backlog().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn malformed_messages_do_not_block_queues() {
    let harness = Harness::start(OrchestratorConfig::default()).await;

    harness.broker.publish(EVENTS, Message::Binary(vec![1, 2, 3]));
    harness
        .broker
        .publish(EVENTS, Message::Text("not json".to_string()));
    harness
        .broker
        .publish(RESULTS, Message::Text("{}".to_string()));
    harness.settle(EVENTS).await;
    harness.settle(RESULTS).await;

    harness.push(&summary("refs/heads/main", "aaa")).await;
    assert!(harness.broker.wait_for_ready(REQUESTS, 1, TIMEOUT).await);
    harness.stop().await;
}

#[tokio::test]
async fn built_before_building_promotes_backlog() {
    let harness = Harness::start(OrchestratorConfig::default()).await;
    let first = summary("refs/heads/main", "aaa");
    let second = summary("refs/heads/main", "bbb");
    let first_request = BuildRequest::from_summary(&first);
    let second_request = BuildRequest::from_summary(&second);

    harness.push(&first).await;
    assert!(eventually(|| harness.state_of(&first_request) == Some(BuildState::Requested)).await);
    harness.push(&second).await;
    assert_eq!(harness.jobs().len(), 1);

    // The worker's reports arrive out of order.
    harness.report(&first_request, BuildState::Built).await;
    harness.report(&first_request, BuildState::Building).await;

    assert!(harness.broker.wait_for_ready(REQUESTS, 1, TIMEOUT).await);
    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, second.id);
    assert_eq!(harness.state_of(&first_request), None);
    assert!(eventually(|| harness.state_of(&second_request) == Some(BuildState::Requested)).await);
    assert!(harness.orchestrator().backlog().is_empty());
    assert_eq!(harness.orchestrator().registry().len(), 1);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_results_promote_backlog() {
    let config = OrchestratorConfig {
        handler_concurrency: 8,
        ..OrchestratorConfig::default()
    };
    let harness = Harness::start(config).await;
    let first = summary("refs/heads/main", "aaa");
    let second = summary("refs/heads/main", "bbb");
    let first_request = BuildRequest::from_summary(&first);
    let second_request = BuildRequest::from_summary(&second);

    harness.push(&first).await;
    assert!(eventually(|| harness.state_of(&first_request) == Some(BuildState::Requested)).await);
    harness.push(&second).await;
    assert_eq!(harness.jobs().len(), 1);

    // Both reports may be handled in either order.
    harness.publish_result(&first_request, BuildState::Building);
    harness.publish_result(&first_request, BuildState::Built);
    harness.settle(RESULTS).await;

    assert!(harness.broker.wait_for_ready(REQUESTS, 1, TIMEOUT).await);
    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, second.id);
    assert!(eventually(|| harness.state_of(&second_request) == Some(BuildState::Requested)).await);
    assert_eq!(harness.state_of(&first_request), None);
    assert_eq!(harness.orchestrator().registry().len(), 1);

    harness.stop().await;
}
