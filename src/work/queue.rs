//! Shared backlog drained by the scheduler's workers
//!
//! The queue hands out units in priority order (lower first, then submission
//! order) and tracks how many units are in flight. A worker that finds the
//! backlog empty waits while other units are still in flight, because a
//! cooled-down unit may be pushed back at any time.

use crate::work::WorkUnit;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
struct QueuedUnit {
    unit: WorkUnit,
    seq: u64,
}

// BinaryHeap is a max-heap; reverse both keys so the lowest priority value
// and then the earliest sequence number pop first.
impl Ord for QueuedUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .unit
            .priority
            .cmp(&self.unit.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedUnit {}

#[derive(Debug, Default)]
struct QueueState {
    backlog: BinaryHeap<QueuedUnit>,
    in_flight: usize,
    next_seq: u64,
    /// Ids that are queued or in flight
    live: HashSet<String>,
}

impl QueueState {
    fn push(&mut self, unit: WorkUnit) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.backlog.push(QueuedUnit { unit, seq });
    }
}

/// Priority backlog with in-flight accounting
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds units to the backlog, ignoring ids that are already live
    ///
    /// # Returns
    ///
    /// The number of units actually enqueued
    pub async fn push_batch(&self, units: impl IntoIterator<Item = WorkUnit>) -> usize {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for unit in units {
            if !state.live.insert(unit.id.clone()) {
                tracing::debug!("Ignoring duplicate unit {}", unit.id);
                continue;
            }
            state.push(unit);
            added += 1;
        }
        drop(state);
        self.changed.notify_waiters();
        added
    }

    /// Takes the next unit, waiting while the backlog is empty but units are in flight
    ///
    /// # Returns
    ///
    /// * `Some(WorkUnit)` - a unit now counted as in flight
    /// * `None` - nothing queued and nothing in flight; the run is drained
    pub async fn next(&self) -> Option<WorkUnit> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(queued) = state.backlog.pop() {
                    state.in_flight += 1;
                    return Some(queued.unit);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Returns an in-flight unit to the backlog
    pub async fn requeue(&self, unit: WorkUnit) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.push(unit);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Retires an in-flight unit
    pub async fn complete(&self, unit_id: &str) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.live.remove(unit_id);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Removes and returns everything still queued
    pub async fn drain(&self) -> Vec<WorkUnit> {
        let mut state = self.state.lock().await;
        let units: Vec<WorkUnit> = std::mem::take(&mut state.backlog)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|queued| queued.unit)
            .collect();
        for unit in &units {
            state.live.remove(&unit.id);
        }
        drop(state);
        self.changed.notify_waiters();
        units
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }
}
