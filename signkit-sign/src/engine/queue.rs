//! Ordering helpers: the session-request queue and the last-applied ids
//! used to drop stale controller messages.

use crate::types::PendingRequest;
use std::collections::{HashMap, VecDeque};

/// Surfaces inbound session requests one at a time.
///
/// The next request is handed out only after the active one was answered
/// or expired.
#[derive(Debug, Default)]
pub(crate) struct SessionRequestQueue {
    active: Option<PendingRequest>,
    queued: VecDeque<PendingRequest>,
}

impl SessionRequestQueue {
    /// Stage a request. Returns the request to surface now, if any.
    pub fn push(&mut self, request: PendingRequest, now: u64) -> Option<PendingRequest> {
        let known = self.active.as_ref().is_some_and(|a| a.id == request.id)
            || self.queued.iter().any(|r| r.id == request.id);
        if !known {
            self.queued.push_back(request);
        }
        self.advance(now)
    }

    /// Request `id` was answered or expired.
    pub fn finish(&mut self, id: u64, now: u64) -> Option<PendingRequest> {
        if self.active.as_ref().is_some_and(|a| a.id == id) {
            self.active = None;
            return self.advance(now);
        }
        self.queued.retain(|r| r.id != id);
        None
    }

    /// Drop everything belonging to a deleted session.
    pub fn remove_topic(&mut self, topic: &str, now: u64) -> Option<PendingRequest> {
        self.queued.retain(|r| r.topic != topic);
        if self.active.as_ref().is_some_and(|a| a.topic == topic) {
            self.active = None;
            return self.advance(now);
        }
        None
    }

    #[cfg(test)]
    pub fn active_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.id)
    }

    fn advance(&mut self, now: u64) -> Option<PendingRequest> {
        if self.active.is_some() {
            return None;
        }
        while let Some(next) = self.queued.pop_front() {
            // Expired ones are cleaned up by the expirer.
            if next.expiry > now {
                self.active = Some(next.clone());
                return Some(next);
            }
        }
        None
    }
}

/// Last applied request id per topic and message kind.
///
/// Ids are time-ordered, so anything not newer than the last applied id is a
/// stale or duplicate delivery.
#[derive(Debug, Default)]
pub(crate) struct LastApplied {
    ids: HashMap<(String, String), u64>,
}

impl LastApplied {
    /// Record `id` if it is newer than the last one applied. Returns false for
    /// a stale id.
    pub fn accept(&mut self, topic: &str, kind: &str, id: u64) -> bool {
        let slot = self
            .ids
            .entry((topic.to_string(), kind.to_string()))
            .or_insert(0);
        if id <= *slot {
            return false;
        }
        *slot = id;
        true
    }

    pub fn forget_topic(&mut self, topic: &str) {
        self.ids.retain(|(t, _), _| t != topic);
    }
}
