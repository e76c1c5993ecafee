//! Phase progress blocks stored in orchestrating payloads.

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Progress of one fan-out phase, stored under the phase key of the parent
/// payload (`{"downloads": {"total": 5, "completed": 3, "done": false}}`).
///
/// `done` is the only completion predicate; the counters are informational
/// and may over-count under duplicate delivery.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseProgress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub done: bool,
}

impl PhaseProgress {
    /// Reads the progress block of `phase` from a task, defaulting when absent.
    pub fn of(task: &Task, phase: &Phase) -> Self {
        task.payload_at(phase.key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether the counters claim every child finished.
    pub fn counts_complete(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }
}

/// A fan-out phase of an orchestrating task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// Payload key holding the [`PhaseProgress`] block.
    pub key: &'static str,
    /// Topics of the children this phase spawns.
    pub child_topics: &'static [&'static str],
}

impl Phase {
    pub const fn new(key: &'static str, child_topics: &'static [&'static str]) -> Self {
        Self { key, child_topics }
    }

    pub fn done_path(&self) -> String {
        format!("{}.done", self.key)
    }

    pub fn completed_path(&self) -> String {
        format!("{}.completed", self.key)
    }

    pub fn total_path(&self) -> String {
        format!("{}.total", self.key)
    }
}
