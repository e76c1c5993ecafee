//! Per-parent concurrency admission gate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::state::{Admission, AdmissionState, InMemoryAdmission};
use crate::metrics;

/// Shared, runtime-adjustable concurrency limit. Read on every admission and
/// release, so a change applies to the next decision.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit(Arc<AtomicUsize>);

impl ConcurrencyLimit {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(limit.max(1))))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Change the limit. Values below one are raised to one.
    pub fn set(&self, limit: usize) {
        self.0.store(limit.max(1), Ordering::SeqCst);
    }
}

/// Bounds how many children of one parent run at once; excess children wait
/// in arrival order.
pub struct AdmissionGate {
    name: String,
    limit: ConcurrencyLimit,
    state: Arc<dyn AdmissionState>,
}

impl AdmissionGate {
    pub fn new(name: impl Into<String>, limit: ConcurrencyLimit) -> Self {
        Self::with_state(name, limit, Arc::new(InMemoryAdmission::new()))
    }

    pub fn with_state(
        name: impl Into<String>,
        limit: ConcurrencyLimit,
        state: Arc<dyn AdmissionState>,
    ) -> Self {
        Self {
            name: name.into(),
            limit,
            state,
        }
    }

    pub fn limit(&self) -> &ConcurrencyLimit {
        &self.limit
    }

    pub fn state(&self) -> &Arc<dyn AdmissionState> {
        &self.state
    }

    /// Wait for a slot in `group` (usually the parent id). The slot is held
    /// until the returned permit is dropped.
    pub async fn admit(&self, group: &str, task_id: &str) -> GatePermit {
        let admission = self.state.enqueue(group, task_id, self.limit.get());

        // Built before waiting so an abandoned wait still leaves the group.
        let permit = GatePermit {
            state: Arc::clone(&self.state),
            limit: self.limit.clone(),
            group: group.to_string(),
            task_id: task_id.to_string(),
        };

        if let Admission::Queued(signal) = admission {
            debug!("Task {} waiting for a {} slot under {}", task_id, self.name, group);
            let waiting = metrics::GATE_WAITING.with_label_values(&[self.name.as_str()]);
            waiting.inc();
            // A closed channel means the entry was dropped from the state; run anyway.
            let _ = signal.await;
            waiting.dec();
        }

        debug!("Task {} admitted to {} under {}", task_id, self.name, group);
        permit
    }
}

/// A held gate slot. Dropping it releases the slot and promotes the next
/// waiter.
pub struct GatePermit {
    state: Arc<dyn AdmissionState>,
    limit: ConcurrencyLimit,
    group: String,
    task_id: String,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.state
            .release(&self.group, &self.task_id, self.limit.get());
    }
}
