//! Session-based reference tracking.
//!
//! Every object can be pinned by the sessions working with it. An object
//! whose only holders are expired sessions becomes collectable, but a
//! session is only treated as truly expired on its second sighting past
//! expiry: the first sighting quarantines it, tolerating a client that
//! restarts with the same session id faster than the collection interval.

use dataclay_common::{ObjectId, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tracing::debug;

#[derive(Default)]
struct TrackerState {
    /// Sessions currently holding a reference to each object.
    references: HashMap<ObjectId, HashSet<SessionId>>,
    /// Expiry instant per known session.
    expiry: HashMap<SessionId, SystemTime>,
    /// Sessions seen past expiry once (first strike).
    quarantine: HashSet<SessionId>,
}

/// Tracks which sessions depend on which objects.
#[derive(Default)]
pub struct SessionReferenceTracker {
    inner: Mutex<TrackerState>,
}

impl SessionReferenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` holds a reference to `object_id`. The
    /// expiry is recorded on first sight only; renewals go through
    /// `renew_session`.
    pub fn add_session_reference(
        &self,
        object_id: ObjectId,
        session_id: SessionId,
        expires_at: SystemTime,
    ) {
        let mut state = self.inner.lock();
        state
            .references
            .entry(object_id)
            .or_default()
            .insert(session_id);
        state.expiry.entry(session_id).or_insert(expires_at);
    }

    /// Drop `session_id`'s reference to `object_id`.
    pub fn detach_object_from_session(&self, object_id: ObjectId, session_id: SessionId) {
        let mut state = self.inner.lock();
        if let Some(sessions) = state.references.get_mut(&object_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                state.references.remove(&object_id);
            }
        }
    }

    /// Make the session immediately eligible for expiry processing.
    pub fn close_session(&self, session_id: SessionId) {
        let mut state = self.inner.lock();
        if state.expiry.contains_key(&session_id) {
            state.expiry.insert(session_id, SystemTime::now());
        }
    }

    /// Push the session's expiry forward and clear any quarantine strike.
    pub fn renew_session(&self, session_id: SessionId, expires_at: SystemTime) {
        let mut state = self.inner.lock();
        state.expiry.insert(session_id, expires_at);
        state.quarantine.remove(&session_id);
    }

    /// True if any session (live or not yet collected) references the object.
    #[must_use]
    pub fn is_referenced(&self, object_id: ObjectId) -> bool {
        self.inner.lock().references.contains_key(&object_id)
    }

    /// The floor for garbage collection: objects currently loaded plus
    /// objects referenced by at least one non-expired session. Expired
    /// sessions are processed through the two-strike quarantine here.
    #[must_use]
    pub fn collect_retained_references(&self, loaded: &[ObjectId]) -> HashSet<ObjectId> {
        self.collect_retained_references_at(SystemTime::now(), loaded)
    }

    pub(crate) fn collect_retained_references_at(
        &self,
        now: SystemTime,
        loaded: &[ObjectId],
    ) -> HashSet<ObjectId> {
        let mut state = self.inner.lock();
        let TrackerState {
            references,
            expiry,
            quarantine,
        } = &mut *state;

        let mut retained: HashSet<ObjectId> = loaded.iter().copied().collect();

        references.retain(|object_id, sessions| {
            sessions.retain(|session_id| {
                let expired = match expiry.get(session_id) {
                    Some(at) => *at <= now,
                    // Unknown expiry: treat as long gone
                    None => true,
                };
                if !expired {
                    quarantine.remove(session_id);
                    return true;
                }
                if quarantine.contains(session_id) {
                    debug!(%session_id, %object_id, "session expired, dropping reference");
                    false
                } else {
                    debug!(%session_id, "session past expiry, quarantined");
                    quarantine.insert(*session_id);
                    true
                }
            });
            if sessions.is_empty() {
                false
            } else {
                retained.insert(*object_id);
                true
            }
        });

        // Expiry and quarantine bookkeeping survives only while some object
        // still references the session
        let referenced: HashSet<SessionId> =
            references.values().flatten().copied().collect();
        expiry.retain(|session_id, _| referenced.contains(session_id));
        quarantine.retain(|session_id| referenced.contains(session_id));

        retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn instants() -> (SystemTime, SystemTime, SystemTime) {
        let t0 = SystemTime::now();
        (t0, t0 + Duration::from_secs(1), t0 + Duration::from_secs(2))
    }

    #[test]
    fn test_two_strike_quarantine() {
        let tracker = SessionReferenceTracker::new();
        let (t0, t1, t2) = instants();
        let object_id = ObjectId::new();
        let session_id = SessionId::new();

        tracker.add_session_reference(object_id, session_id, t0);

        // First sighting past expiry: quarantined, still retained
        let retained = tracker.collect_retained_references_at(t1, &[]);
        assert!(retained.contains(&object_id));

        // Second sighting with no renewal: truly expired
        let retained = tracker.collect_retained_references_at(t2, &[]);
        assert!(!retained.contains(&object_id));
        assert!(!tracker.is_referenced(object_id));
    }

    #[test]
    fn test_renewal_clears_quarantine() {
        let tracker = SessionReferenceTracker::new();
        let (t0, t1, t2) = instants();
        let object_id = ObjectId::new();
        let session_id = SessionId::new();

        tracker.add_session_reference(object_id, session_id, t0);
        let retained = tracker.collect_retained_references_at(t1, &[]);
        assert!(retained.contains(&object_id));

        // Client restarted with the same session id before the second pass
        tracker.renew_session(session_id, t2 + Duration::from_secs(60));

        let retained = tracker.collect_retained_references_at(t2, &[]);
        assert!(retained.contains(&object_id));
        assert!(tracker.is_referenced(object_id));
    }

    #[test]
    fn test_live_session_sighting_unquarantines() {
        let tracker = SessionReferenceTracker::new();
        let (t0, t1, _) = instants();
        let object_id = ObjectId::new();
        let session_id = SessionId::new();

        tracker.add_session_reference(object_id, session_id, t1);

        // Session still live: retained, no strike accumulates
        let retained = tracker.collect_retained_references_at(t0, &[]);
        assert!(retained.contains(&object_id));
        let retained = tracker.collect_retained_references_at(t0, &[]);
        assert!(retained.contains(&object_id));
    }

    #[test]
    fn test_detach_removes_empty_entry() {
        let tracker = SessionReferenceTracker::new();
        let object_id = ObjectId::new();
        let session_id = SessionId::new();

        tracker.add_session_reference(object_id, session_id, SystemTime::now());
        assert!(tracker.is_referenced(object_id));
        tracker.detach_object_from_session(object_id, session_id);
        assert!(!tracker.is_referenced(object_id));
    }

    #[test]
    fn test_close_session_expires_immediately() {
        let tracker = SessionReferenceTracker::new();
        let object_id = ObjectId::new();
        let session_id = SessionId::new();
        let far = SystemTime::now() + Duration::from_secs(3600);

        tracker.add_session_reference(object_id, session_id, far);
        tracker.close_session(session_id);

        let later = SystemTime::now() + Duration::from_secs(1);
        // Quarantine still applies: one strike, then gone
        let retained = tracker.collect_retained_references_at(later, &[]);
        assert!(retained.contains(&object_id));
        let retained = tracker.collect_retained_references_at(later, &[]);
        assert!(!retained.contains(&object_id));
    }

    #[test]
    fn test_loaded_objects_always_retained() {
        let tracker = SessionReferenceTracker::new();
        let object_id = ObjectId::new();
        let retained = tracker.collect_retained_references(&[object_id]);
        assert!(retained.contains(&object_id));
    }
}
