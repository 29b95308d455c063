//! Concurrent registry of in-flight builds.
//!
//! Maps each target to the builds known for it. Every operation locks only
//! the shard holding its target, so work on different targets never waits
//! on each other while work on one target is serialized.
//!
//! Operations report success as a `bool`. Divergence from the state a
//! caller expected is logged and otherwise tolerated: duplicated or
//! reordered messages must not wedge the pipeline.

use cbench_proto::{BuildId, BuildRequest, BuildState, BuildTarget};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::backlog::Backlog;

/// A tracked build and where it is in its lifecycle.
///
/// Records are never mutated in place; each transition replaces the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub request: BuildRequest,
    pub state: BuildState,
}

impl BuildRecord {
    pub fn new(request: BuildRequest, state: BuildState) -> Self {
        Self { request, state }
    }
}

/// Outcome of [`BuildRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The target was idle; the request is now tracked as `REQUESTING`.
    Admitted,
    /// Another build for the target is in flight; the request went to the backlog.
    Backlogged,
    /// This exact build is already tracked, in the given state. A build that
    /// recently finished is reported as `BUILT`.
    Duplicate(BuildState),
}

/// Outcome of [`BuildRegistry::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// False if the record was left in place because it had moved past the
    /// expected state.
    pub removed: bool,
    /// Backlogged request promoted to `REQUESTING`, ready to dispatch.
    pub next: Option<BuildRequest>,
}

/// Finished build ids remembered per target.
const FINISHED_HISTORY: usize = 32;

/// Builds of one target.
#[derive(Debug, Default)]
struct Builds {
    active: HashMap<BuildId, BuildRecord>,
    /// Recently completed ids, oldest first. Late reports for these are ignored.
    finished: VecDeque<BuildId>,
}

impl Builds {
    fn finish(&mut self, id: &BuildId) {
        if self.finished.contains(id) {
            return;
        }
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(id.clone());
    }

    fn is_finished(&self, id: &BuildId) -> bool {
        self.finished.contains(id)
    }

    fn is_unused(&self) -> bool {
        self.active.is_empty() && self.finished.is_empty()
    }

    fn track(&mut self, request: &BuildRequest, state: BuildState) {
        self.active
            .insert(request.id.clone(), BuildRecord::new(request.clone(), state));
    }
}

/// Target-sharded map of build records.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    builds: DashMap<BuildTarget, Builds>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `request` in `state`.
    ///
    /// Succeeds if the build was unknown or is already tracked in exactly
    /// `state`. A record in any other state is left alone.
    pub fn insert(&self, target: &BuildTarget, request: &BuildRequest, state: BuildState) -> bool {
        let mut builds = self.builds.entry(target.clone()).or_default();
        match builds.active.get(&request.id).map(|record| record.state) {
            None => {
                builds.track(request, state);
                debug!(target_ref = %target, build_id = %request.id, state = %state, "Build tracked");
                true
            }
            Some(current) if current == state => {
                debug!(
                    target_ref = %target,
                    build_id = %request.id,
                    state = %state,
                    "Build already tracked in this state"
                );
                true
            }
            Some(current) => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    current = %current,
                    requested = %state,
                    "Refusing to overwrite build tracked in another state"
                );
                false
            }
        }
    }

    /// Tracks `request` in `state` only if this build id is unknown.
    ///
    /// Returns true iff this call created the record.
    pub fn insert_if_absent(
        &self,
        target: &BuildTarget,
        request: &BuildRequest,
        state: BuildState,
    ) -> bool {
        let mut builds = self.builds.entry(target.clone()).or_default();
        if builds.active.contains_key(&request.id) {
            return false;
        }
        builds.track(request, state);
        true
    }

    /// Moves a build from `from` to `to`.
    ///
    /// An unknown build is tracked directly in `to`, recovering from a
    /// missed insert, unless it finished recently: a late report must not
    /// bring it back. A build in a state other than `from` is left alone.
    pub fn update(
        &self,
        target: &BuildTarget,
        request: &BuildRequest,
        from: BuildState,
        to: BuildState,
    ) -> bool {
        if !BuildState::is_legal_transition(from, to) {
            debug!(
                build_id = %request.id,
                from = %from,
                to = %to,
                "Transition skips states in the build lifecycle"
            );
        }

        let mut builds = self.builds.entry(target.clone()).or_default();
        match builds.active.get(&request.id).map(|record| record.state) {
            None if builds.is_finished(&request.id) => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    to = %to,
                    "Ignoring update for a build that already finished"
                );
                false
            }
            None => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    expected = %from,
                    "No record for build, tracking it as {}",
                    to
                );
                builds.track(request, to);
                true
            }
            Some(current) if current == from => {
                builds.track(request, to);
                debug!(target_ref = %target, build_id = %request.id, from = %from, to = %to, "Build advanced");
                true
            }
            Some(current) => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    current = %current,
                    expected = %from,
                    to = %to,
                    "Rejecting update from unexpected state"
                );
                false
            }
        }
    }

    /// Stops tracking a build that is in `expected`.
    ///
    /// Returns true iff no record for the build remains.
    pub fn remove(&self, target: &BuildTarget, request: &BuildRequest, expected: BuildState) -> bool {
        let Some(mut builds) = self.builds.get_mut(target) else {
            return true;
        };
        let removed = match builds.active.get(&request.id).map(|record| record.state) {
            None => {
                debug!(target_ref = %target, build_id = %request.id, "Build already untracked");
                true
            }
            Some(current) if current == expected => {
                builds.active.remove(&request.id);
                debug!(target_ref = %target, build_id = %request.id, state = %current, "Build untracked");
                true
            }
            Some(current) => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    current = %current,
                    expected = %expected,
                    "Not removing build tracked in unexpected state"
                );
                false
            }
        };
        let unused = builds.is_unused();
        drop(builds);

        if unused {
            self.builds.remove_if(target, |_, builds| builds.is_unused());
        }
        removed
    }

    /// Target-level admission gate.
    ///
    /// Atomically with respect to the target: a known or recently finished
    /// build id is reported as a duplicate, a busy target sends the request
    /// to `backlog`, and an idle target starts tracking the request as
    /// `REQUESTING`.
    pub fn admit(&self, target: &BuildTarget, request: &BuildRequest, backlog: &Backlog) -> Admission {
        let mut builds = self.builds.entry(target.clone()).or_default();

        if let Some(record) = builds.active.get(&request.id) {
            return Admission::Duplicate(record.state);
        }
        if builds.is_finished(&request.id) {
            return Admission::Duplicate(BuildState::Built);
        }

        if !builds.active.is_empty() {
            backlog.offer(target, request.clone());
            return Admission::Backlogged;
        }

        builds.track(request, BuildState::Requesting);
        Admission::Admitted
    }

    /// Retires a finished build and promotes the target's backlog entry.
    ///
    /// The record is removed if it is in `expected`, or in an earlier
    /// backbone state when progress reports were lost or reordered. A record
    /// that has moved past `expected` stays. The id is remembered as
    /// finished either way so late reports cannot resurrect it.
    ///
    /// If the target is idle afterwards, the backlog is drained and the
    /// drained request is tracked as `REQUESTING` before the target lock is
    /// released, so no newer arrival can slip in ahead of it.
    pub fn complete(
        &self,
        target: &BuildTarget,
        request: &BuildRequest,
        expected: BuildState,
        backlog: &Backlog,
    ) -> Completion {
        let mut builds = self.builds.entry(target.clone()).or_default();

        let removed = match builds.active.get(&request.id).map(|record| record.state) {
            None => {
                debug!(target_ref = %target, build_id = %request.id, "Build already untracked");
                true
            }
            Some(current) if current == expected => {
                builds.active.remove(&request.id);
                debug!(target_ref = %target, build_id = %request.id, state = %current, "Build untracked");
                true
            }
            Some(current) if current.precedes(expected) => {
                builds.active.remove(&request.id);
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    current = %current,
                    expected = %expected,
                    "Finished build was still tracked in an earlier state; dropped"
                );
                true
            }
            Some(current) => {
                warn!(
                    target_ref = %target,
                    build_id = %request.id,
                    current = %current,
                    expected = %expected,
                    "Not removing build tracked past the expected state"
                );
                false
            }
        };
        builds.finish(&request.id);

        let next = if builds.active.is_empty() {
            backlog
                .drain(target)
                .inspect(|next| builds.track(next, BuildState::Requesting))
        } else {
            None
        };

        Completion { removed, next }
    }

    /// Current state of one build.
    pub fn state_of(&self, target: &BuildTarget, id: &BuildId) -> Option<BuildState> {
        self.builds
            .get(target)
            .and_then(|builds| builds.active.get(id).map(|record| record.state))
    }

    /// Snapshot of the builds tracked for a target.
    pub fn builds_for(&self, target: &BuildTarget) -> Vec<BuildRecord> {
        self.builds
            .get(target)
            .map(|builds| builds.active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of tracked builds across all targets.
    pub fn len(&self) -> usize {
        self.builds.iter().map(|entry| entry.value().active.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn request(id: &str, target: &str) -> BuildRequest {
        BuildRequest {
            id: BuildId::new(id),
            timestamp: Utc::now(),
            source: "https://github.com/acme/widgets.git".to_string(),
            target: BuildTarget::from(target),
            revision: format!("rev-{id}"),
            requester: "alice".to_string(),
        }
    }

    const MAIN: &str = "refs/heads/main";

    #[test]
    fn insert_is_idempotent_for_same_state() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let req = request("a", MAIN);

        assert!(registry.insert(&target, &req, BuildState::Requesting));
        assert!(registry.insert(&target, &req, BuildState::Requesting));
        assert!(!registry.insert(&target, &req, BuildState::Building));
        assert_eq!(
            registry.state_of(&target, &req.id),
            Some(BuildState::Requesting)
        );
    }

    #[test]
    fn insert_if_absent_is_per_build_id() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let a = request("a", MAIN);
        let b = request("b", MAIN);

        assert!(registry.insert_if_absent(&target, &a, BuildState::Requesting));
        assert!(!registry.insert_if_absent(&target, &a, BuildState::Requesting));
        // A second id on the same target is still a fresh insert.
        assert!(registry.insert_if_absent(&target, &b, BuildState::Requesting));
        assert_eq!(registry.builds_for(&target).len(), 2);
    }

    #[test]
    fn update_does_not_double_advance() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let req = request("a", MAIN);
        registry.insert(&target, &req, BuildState::Requesting);

        assert!(registry.update(&target, &req, BuildState::Requesting, BuildState::Requested));
        assert!(!registry.update(&target, &req, BuildState::Requesting, BuildState::Requested));
        assert_eq!(
            registry.state_of(&target, &req.id),
            Some(BuildState::Requested)
        );
    }

    #[test]
    fn update_recovers_missing_record() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let req = request("a", MAIN);

        assert!(registry.update(&target, &req, BuildState::Requested, BuildState::Building));
        assert_eq!(
            registry.state_of(&target, &req.id),
            Some(BuildState::Building)
        );
    }

    #[test]
    fn update_allows_jumps_off_the_graph() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let req = request("a", MAIN);
        registry.insert(&target, &req, BuildState::Requesting);

        assert!(registry.update(&target, &req, BuildState::Requesting, BuildState::Building));
    }

    #[test]
    fn remove_respects_expected_state() {
        let registry = BuildRegistry::new();
        let target = BuildTarget::from(MAIN);
        let req = request("a", MAIN);
        registry.insert(&target, &req, BuildState::Requested);

        assert!(!registry.remove(&target, &req, BuildState::Building));
        assert_eq!(
            registry.state_of(&target, &req.id),
            Some(BuildState::Requested)
        );

        assert!(registry.remove(&target, &req, BuildState::Requested));
        assert!(registry.is_empty());
        assert!(registry.remove(&target, &req, BuildState::Requested));
    }

    #[test]
    fn admit_gates_on_target_not_id() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let first = request("a", MAIN);
        let second = request("b", MAIN);

        assert_eq!(registry.admit(&target, &first, &backlog), Admission::Admitted);
        assert_eq!(registry.admit(&target, &second, &backlog), Admission::Backlogged);
        assert_eq!(
            registry.admit(&target, &first, &backlog),
            Admission::Duplicate(BuildState::Requesting)
        );
        assert_eq!(backlog.peek(&target).unwrap().id.as_str(), "b");
        assert_eq!(registry.builds_for(&target).len(), 1);

        let other = BuildTarget::from("refs/heads/dev");
        assert_eq!(
            registry.admit(&other, &request("c", "refs/heads/dev"), &backlog),
            Admission::Admitted
        );
    }

    #[test]
    fn complete_promotes_backlog() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let first = request("a", MAIN);
        let second = request("b", MAIN);

        registry.admit(&target, &first, &backlog);
        registry.update(&target, &first, BuildState::Requesting, BuildState::Building);
        registry.admit(&target, &second, &backlog);

        let completion = registry.complete(&target, &first, BuildState::Building, &backlog);
        assert!(completion.removed);
        assert_eq!(completion.next.as_ref().map(|r| r.id.as_str()), Some("b"));
        assert_eq!(
            registry.state_of(&target, &second.id),
            Some(BuildState::Requesting)
        );
        assert!(backlog.is_empty());
    }

    #[test]
    fn complete_drops_build_stuck_in_earlier_state() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let first = request("a", MAIN);
        let mut second = request("b", MAIN);
        second.timestamp = first.timestamp + Duration::seconds(1);

        registry.admit(&target, &first, &backlog);
        registry.update(&target, &first, BuildState::Requesting, BuildState::Requested);
        registry.admit(&target, &second, &backlog);

        // BUILT overtook BUILDING.
        let completion = registry.complete(&target, &first, BuildState::Building, &backlog);
        assert!(completion.removed);
        assert_eq!(completion.next.as_ref().map(|r| r.id.as_str()), Some("b"));
        assert_eq!(registry.state_of(&target, &first.id), None);

        // The late BUILDING must not bring the finished build back.
        assert!(!registry.update(&target, &first, BuildState::Requested, BuildState::Building));
        assert_eq!(registry.state_of(&target, &first.id), None);
        assert_eq!(registry.builds_for(&target).len(), 1);
    }

    #[test]
    fn complete_keeps_build_past_expected_state() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let first = request("a", MAIN);
        let mut second = request("b", MAIN);
        second.timestamp = first.timestamp + Duration::seconds(1);

        registry.insert(&target, &first, BuildState::Benchmarking);
        registry.admit(&target, &second, &backlog);

        let completion = registry.complete(&target, &first, BuildState::Building, &backlog);
        assert!(!completion.removed);
        assert!(completion.next.is_none());
        assert!(backlog.peek(&target).is_some());
    }

    #[test]
    fn finished_build_is_a_duplicate() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let first = request("a", MAIN);

        registry.admit(&target, &first, &backlog);
        registry.update(&target, &first, BuildState::Requesting, BuildState::Building);
        registry.complete(&target, &first, BuildState::Building, &backlog);

        assert_eq!(
            registry.admit(&target, &first, &backlog),
            Admission::Duplicate(BuildState::Built)
        );
        assert!(registry.is_empty());
        assert_eq!(
            registry.admit(&target, &request("b", MAIN), &backlog),
            Admission::Admitted
        );
    }

    #[test]
    fn finished_history_is_bounded() {
        let registry = BuildRegistry::new();
        let backlog = Backlog::new();
        let target = BuildTarget::from(MAIN);
        let oldest = request("old", MAIN);
        registry.complete(&target, &oldest, BuildState::Building, &backlog);

        for i in 0..FINISHED_HISTORY {
            registry.complete(&target, &request(&format!("b{i}"), MAIN), BuildState::Building, &backlog);
        }

        // Forgotten ids fall back to recovering the missing record.
        assert!(registry.update(&target, &oldest, BuildState::Requested, BuildState::Building));
    }

    #[test]
    fn concurrent_admission_admits_exactly_one() {
        let registry = Arc::new(BuildRegistry::new());
        let backlog = Arc::new(Backlog::new());
        let target = BuildTarget::from(MAIN);

        let outcomes: Vec<Admission> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    let backlog = Arc::clone(&backlog);
                    let target = target.clone();
                    scope.spawn(move || registry.admit(&target, &request(&format!("b{i}"), MAIN), &backlog))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let admitted = outcomes
            .iter()
            .filter(|o| **o == Admission::Admitted)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(backlog.len(), 1);
    }
}
