//! Per-target backlog of pending build requests.
//!
//! Holds at most one request per target: the newest one that arrived while
//! another build for that target was in flight.

use cbench_proto::{BuildRequest, BuildTarget};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

/// Most-recent-wins holding area, one slot per target.
#[derive(Debug, Default)]
pub struct Backlog {
    pending: DashMap<BuildTarget, BuildRequest>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `request` as the pending entry for `target`.
    ///
    /// An existing entry with a strictly newer timestamp is kept instead.
    /// Returns true if `request` was stored.
    pub fn offer(&self, target: &BuildTarget, request: BuildRequest) -> bool {
        match self.pending.entry(target.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().timestamp > request.timestamp {
                    debug!(
                        target_ref = %target,
                        kept = %slot.get().id,
                        dropped = %request.id,
                        "Backlog already holds a newer request"
                    );
                    false
                } else {
                    let replaced = slot.insert(request);
                    debug!(
                        target_ref = %target,
                        pending = %slot.get().id,
                        superseded = %replaced.id,
                        "Backlog entry superseded"
                    );
                    true
                }
            }
            Entry::Vacant(slot) => {
                debug!(target_ref = %target, pending = %request.id, "Request backlogged");
                slot.insert(request);
                true
            }
        }
    }

    /// Removes and returns the pending entry for `target`.
    pub fn drain(&self, target: &BuildTarget) -> Option<BuildRequest> {
        self.pending.remove(target).map(|(_, request)| request)
    }

    /// Returns a copy of the pending entry without removing it.
    pub fn peek(&self, target: &BuildTarget) -> Option<BuildRequest> {
        self.pending.get(target).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
