//! Batching dispatcher
//!
//! Coalesces bursts of local edits so only each feature's final state is
//! sent to the remote store. One dispatcher per layer; the reactor polls
//! `deadline()` and calls `take()` once it has passed.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::models::{LocalFeature, LocalId};

/// Default batching window
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(250);

/// Latest pending operation for one feature
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Insert(LocalFeature),
    Update(LocalFeature),
    Delete,
}

/// Dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Idle,
    Accumulating,
    Flushing,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Idle => write!(f, "idle"),
            BatchState::Accumulating => write!(f, "accumulating"),
            BatchState::Flushing => write!(f, "flushing"),
        }
    }
}

/// Snapshot of one window, partitioned by operation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushPlan {
    pub inserts: Vec<(LocalId, LocalFeature)>,
    pub updates: Vec<(LocalId, LocalFeature)>,
    pub deletes: Vec<LocalId>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

#[derive(Debug)]
pub struct BatchDispatcher {
    window: Duration,
    state: BatchState,
    deadline: Option<Instant>,
    entries: BTreeMap<LocalId, PendingOp>,
}

impl Default for BatchDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_WINDOW)
    }
}

impl BatchDispatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: BatchState::Idle,
            deadline: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// When the current window closes, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, local: &LocalId) -> bool {
        self.entries.contains_key(local)
    }

    pub fn pending(&self, local: &LocalId) -> Option<&PendingOp> {
        self.entries.get(local)
    }

    /// Record an edit, merging it with the feature's pending operation
    pub fn record(&mut self, local: LocalId, op: PendingOp, now: Instant) {
        if self.state == BatchState::Idle {
            self.state = BatchState::Accumulating;
            self.deadline = Some(now + self.window);
        }

        let merged = match (self.entries.remove(&local), op) {
            (None, op) => Some(op),
            (Some(PendingOp::Insert(_)), PendingOp::Delete) => None,
            (Some(PendingOp::Insert(_)), PendingOp::Insert(f) | PendingOp::Update(f)) => {
                Some(PendingOp::Insert(f))
            }
            (Some(PendingOp::Update(_)), PendingOp::Insert(f) | PendingOp::Update(f)) => {
                Some(PendingOp::Update(f))
            }
            (Some(PendingOp::Update(_)), PendingOp::Delete) => Some(PendingOp::Delete),
            (Some(PendingOp::Delete), op) => Some(op),
        };

        if let Some(op) = merged {
            self.entries.insert(local, op);
        }
    }

    /// Drop the pending operation of one feature
    pub fn remove(&mut self, local: &LocalId) -> Option<PendingOp> {
        self.entries.remove(local)
    }

    /// Snapshot and clear the window
    pub fn take(&mut self) -> FlushPlan {
        self.state = BatchState::Flushing;
        self.deadline = None;

        let mut plan = FlushPlan::default();
        for (local, op) in std::mem::take(&mut self.entries) {
            match op {
                PendingOp::Insert(feature) => plan.inserts.push((local, feature)),
                PendingOp::Update(feature) => plan.updates.push((local, feature)),
                PendingOp::Delete => plan.deletes.push(local),
            }
        }

        self.state = BatchState::Idle;
        plan
    }

    /// Drop every pending entry without sending anything
    pub fn cancel(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.deadline = None;
        self.state = BatchState::Idle;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Point3;

    fn feature(x: f64) -> LocalFeature {
        LocalFeature::new(Point3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_first_edit_arms_window() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        assert_eq!(batch.state(), BatchState::Idle);
        assert!(batch.deadline().is_none());

        batch.record(LocalId(1), PendingOp::Insert(feature(1.0)), now);
        assert_eq!(batch.state(), BatchState::Accumulating);
        assert_eq!(batch.deadline(), Some(now + DEFAULT_BATCH_WINDOW));

        // Later edits do not extend the window
        batch.record(LocalId(2), PendingOp::Update(feature(2.0)), now + Duration::from_millis(100));
        assert_eq!(batch.deadline(), Some(now + DEFAULT_BATCH_WINDOW));
        assert!(!batch.is_due(now + Duration::from_millis(249)));
        assert!(batch.is_due(now + Duration::from_millis(250)));
    }

    #[test]
    fn test_updates_collapse_to_latest() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        for i in 0..10 {
            batch.record(LocalId(1), PendingOp::Update(feature(i as f64)), now);
        }
        let plan = batch.take();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.updates[0].1.geometry.x, 9.0);
    }

    #[test]
    fn test_insert_then_update_stays_insert() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        batch.record(LocalId(1), PendingOp::Insert(feature(1.0)), now);
        batch.record(LocalId(1), PendingOp::Update(feature(5.0)), now);

        let plan = batch.take();
        assert!(plan.updates.is_empty());
        assert_eq!(plan.inserts, vec![(LocalId(1), feature(5.0))]);
    }

    #[test]
    fn test_insert_then_delete_cancels_out() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        batch.record(LocalId(1), PendingOp::Insert(feature(1.0)), now);
        batch.record(LocalId(1), PendingOp::Delete, now);

        assert!(batch.is_empty());
        assert!(batch.take().is_empty());
    }

    #[test]
    fn test_update_then_delete_is_delete() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        batch.record(LocalId(4), PendingOp::Update(feature(1.0)), now);
        batch.record(LocalId(4), PendingOp::Delete, now);
        assert_eq!(batch.pending(&LocalId(4)), Some(&PendingOp::Delete));
    }

    #[test]
    fn test_take_partitions_in_local_id_order() {
        let mut batch = BatchDispatcher::default();
        let now = Instant::now();
        batch.record(LocalId(3), PendingOp::Insert(feature(3.0)), now);
        batch.record(LocalId(1), PendingOp::Insert(feature(1.0)), now);
        batch.record(LocalId(2), PendingOp::Update(feature(2.0)), now);
        batch.record(LocalId(5), PendingOp::Delete, now);

        let plan = batch.take();
        let inserted: Vec<LocalId> = plan.inserts.iter().map(|(id, _)| *id).collect();
        assert_eq!(inserted, vec![LocalId(1), LocalId(3)]);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.deletes, vec![LocalId(5)]);

        assert_eq!(batch.state(), BatchState::Idle);
        assert!(batch.deadline().is_none());
    }

    #[test]
    fn test_edit_after_flush_rearms() {
        let mut batch = BatchDispatcher::default();
        let start = Instant::now();
        batch.record(LocalId(1), PendingOp::Update(feature(1.0)), start);
        batch.take();

        let later = start + Duration::from_secs(1);
        batch.record(LocalId(1), PendingOp::Update(feature(2.0)), later);
        assert_eq!(batch.deadline(), Some(later + DEFAULT_BATCH_WINDOW));
    }

    #[test]
    fn test_cancel_discards_entries() {
        let mut batch = BatchDispatcher::new(Duration::from_millis(10));
        let now = Instant::now();
        batch.record(LocalId(1), PendingOp::Insert(feature(1.0)), now);
        batch.record(LocalId(2), PendingOp::Delete, now);

        assert_eq!(batch.cancel(), 2);
        assert!(batch.is_empty());
        assert!(batch.deadline().is_none());
        assert_eq!(batch.state(), BatchState::Idle);
    }
}
