//! Producer arena and request queue.
//!
//! The registry owns every registered producer, keyed by handle.  Each
//! producer sits behind its own `RwLock` so the tick can `try_write` one
//! producer at a time without holding the registry lock while producer code
//! runs.
//!
//! While a compositing pass is in progress, structural changes (removals,
//! priority changes, prunes, retirements) are queued and applied at the safe
//! point that ends the pass.  Producers added mid-pass are registered at once
//! but only started at that safe point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use motionmux_types::{MotionId, MuxError, Persistence, Priority};
use parking_lot::RwLock;

use crate::motion::MotionCommand;

pub(crate) type SharedMotion = Arc<RwLock<Box<dyn MotionCommand>>>;

/// Why a producer is leaving the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicit `remove` call.
    Removed,
    /// Prunable and no longer alive.
    Pruned,
    /// Exhausted its retry budget.
    RetryBudget,
    /// Lost a contention past the deadline.
    Contention,
}

/// One registration record.
#[derive(Clone)]
pub(crate) struct Entry {
    pub id: MotionId,
    pub priority: Priority,
    pub persistence: Persistence,
    pub seq: u64,
    pub motion: SharedMotion,
    pub checked_out: Arc<AtomicBool>,
    pub started: bool,
}

impl Entry {
    pub fn is_checked_out(&self) -> bool {
        self.checked_out.load(Ordering::Acquire)
    }
}

/// An entry whose removal has been applied but whose `on_stop` has not run.
pub(crate) struct Retiring {
    pub entry: Entry,
    pub reason: RemovalReason,
}

enum Request {
    Remove(MotionId, RemovalReason),
    SetPriority(MotionId, Priority),
}

/// Work handed back to the engine at a safe point.  Producer hooks run
/// outside the registry lock.
pub(crate) struct SafePoint {
    pub to_start: Vec<Entry>,
    pub to_stop: Vec<Retiring>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: BTreeMap<MotionId, Entry>,
    retiring: Vec<Retiring>,
    requests: Vec<Request>,
    in_pass: bool,
    next_raw: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_raw: 1,
            ..Self::default()
        }
    }

    /// Issue a fresh handle; handles are never reused.
    pub fn mint(&mut self) -> (MotionId, u64) {
        let raw = self.next_raw;
        self.next_raw += 1;
        (MotionId::from_raw(raw), raw)
    }

    pub fn in_pass(&self) -> bool {
        self.in_pass
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, id: MotionId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: MotionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> Vec<MotionId> {
        self.entries.keys().copied().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Request removal.  Applied now between passes, queued during one.
    /// Returns the retiring record when applied immediately.
    pub fn remove(&mut self, id: MotionId, reason: RemovalReason) -> Result<Option<Retiring>, MuxError> {
        if !self.entries.contains_key(&id) {
            return Err(MuxError::UnknownMotion(id));
        }
        if self.in_pass {
            self.requests.push(Request::Remove(id, reason));
            return Ok(None);
        }
        Ok(self.take(id, reason))
    }

    /// Request a priority change, effective from the next pass.
    pub fn set_priority(&mut self, id: MotionId, priority: Priority) -> Result<(), MuxError> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(MuxError::UnknownMotion(id));
        };
        if self.in_pass {
            self.requests.push(Request::SetPriority(id, priority));
        } else {
            entry.priority = priority;
        }
        Ok(())
    }

    /// Start a pass and return the active entries in compositing order:
    /// ascending priority, then registration order.
    pub fn begin_pass(&mut self) -> Vec<Entry> {
        self.in_pass = true;
        let mut snapshot: Vec<Entry> = self.entries.values().filter(|e| e.started).cloned().collect();
        snapshot.sort_by_key(|e| (e.priority, e.seq));
        snapshot
    }

    /// End the pass: apply queued requests and hand back the hooks to run.
    pub fn end_pass(&mut self) -> SafePoint {
        self.in_pass = false;
        for request in std::mem::take(&mut self.requests) {
            match request {
                Request::SetPriority(id, priority) => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.priority = priority;
                    }
                }
                Request::Remove(id, reason) => {
                    if let Some(retiring) = self.take(id, reason) {
                        self.retiring.push(retiring);
                    }
                }
            }
        }
        SafePoint {
            to_start: self.entries.values().filter(|e| !e.started).cloned().collect(),
            to_stop: std::mem::take(&mut self.retiring),
        }
    }

    pub fn mark_started(&mut self, id: MotionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.started = true;
        }
    }

    /// Park a record whose `on_stop` could not run yet.
    pub fn defer_retiring(&mut self, retiring: Retiring) {
        self.retiring.push(retiring);
    }

    fn take(&mut self, id: MotionId, reason: RemovalReason) -> Option<Retiring> {
        self.entries
            .remove(&id)
            .map(|entry| Retiring { entry, reason })
    }
}
