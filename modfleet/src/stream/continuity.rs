//! Seen-identifier tracking shared between a stream and its replacement.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Deferred {
    id: String,
    due: Instant,
}

/// Bounded, insertion-ordered set of seen identifiers.
///
/// Once `cap` is exceeded the oldest identifiers are evicted. Items parked
/// until they are old enough to emit are tracked here as well, so a
/// replacement stream picks them up.
#[derive(Debug)]
pub struct ContinuityState {
    cap: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
    deferred: Vec<Deferred>,
    baselined: bool,
}

impl ContinuityState {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
            deferred: Vec::new(),
            baselined: false,
        }
    }

    /// Record `id`. Returns `false` when it was already seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn defer(&mut self, id: impl Into<String>, due: Instant) {
        self.deferred.push(Deferred { id: id.into(), due });
    }

    /// Remove and return the parked identifiers due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        self.deferred.retain(|d| {
            if d.due <= now {
                due.push(d.id.clone());
                false
            } else {
                true
            }
        });
        due
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

/// Shared handle to a [`ContinuityState`].
#[derive(Debug, Clone)]
pub struct ContinuityHandle(Arc<Mutex<ContinuityState>>);

impl ContinuityHandle {
    pub fn new(cap: usize) -> Self {
        Self(Arc::new(Mutex::new(ContinuityState::new(cap))))
    }

    pub fn insert(&self, id: &str) -> bool {
        self.0.lock().insert(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn defer(&self, id: impl Into<String>, due: Instant) {
        self.0.lock().defer(id, due);
    }

    pub fn take_due(&self, now: Instant) -> Vec<String> {
        self.0.lock().take_due(now)
    }

    pub fn deferred_len(&self) -> usize {
        self.0.lock().deferred_len()
    }

    /// Whether a first listing has already been recorded.
    pub fn is_baselined(&self) -> bool {
        self.0.lock().baselined
    }

    /// Record every id of a baseline listing.
    pub fn record_baseline<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut state = self.0.lock();
        for id in ids {
            state.insert(id);
        }
        state.baselined = true;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
