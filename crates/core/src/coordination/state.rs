//! Swappable bookkeeping for the aggregator and the admission gate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

/// Outstanding children per (tracked topic, parent).
pub trait MembershipState: Send + Sync {
    /// Record a child as outstanding. Creates the group on first use.
    fn add(&self, topic: &str, parent_id: &str, child_id: &str);

    /// Drop a child from its group. Returns `true` when this removal left the
    /// group empty; the group is then deleted.
    fn remove(&self, topic: &str, parent_id: &str, child_id: &str) -> bool;

    /// Number of outstanding children in a group.
    fn outstanding(&self, topic: &str, parent_id: &str) -> usize;
}

type GroupKey = (String, String);

/// In-memory membership with one lock per group.
#[derive(Default)]
pub struct InMemoryMembership {
    groups: Mutex<HashMap<GroupKey, Arc<Mutex<HashSet<String>>>>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<GroupKey, Arc<Mutex<HashSet<String>>>>> {
        lock(&self.groups)
    }

    fn group(&self, topic: &str, parent_id: &str) -> Option<Arc<Mutex<HashSet<String>>>> {
        self.groups()
            .get(&(topic.to_string(), parent_id.to_string()))
            .cloned()
    }
}

impl MembershipState for InMemoryMembership {
    fn add(&self, topic: &str, parent_id: &str, child_id: &str) {
        // Insert while the outer lock is held so a concurrent emptying
        // removal cannot unmap the group in between.
        let mut groups = self.groups();
        let group = groups
            .entry((topic.to_string(), parent_id.to_string()))
            .or_default()
            .clone();
        lock(&group).insert(child_id.to_string());
        drop(groups);
    }

    fn remove(&self, topic: &str, parent_id: &str, child_id: &str) -> bool {
        let Some(group) = self.group(topic, parent_id) else {
            return false;
        };

        let emptied = {
            let mut members = lock(&group);
            members.remove(child_id) && members.is_empty()
        };
        if !emptied {
            return false;
        }

        // Outer then inner, same order as `add`.
        let key = (topic.to_string(), parent_id.to_string());
        let mut groups = self.groups();
        let still_empty = lock(&group).is_empty();
        if still_empty && groups.get(&key).is_some_and(|g| Arc::ptr_eq(g, &group)) {
            groups.remove(&key);
        }
        true
    }

    fn outstanding(&self, topic: &str, parent_id: &str) -> usize {
        self.group(topic, parent_id)
            .map(|group| lock(&group).len())
            .unwrap_or(0)
    }
}

/// Status of an entry in an admission group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    InProgress,
}

/// Result of registering with an admission group.
#[derive(Debug)]
pub enum Admission {
    /// Below the limit; run now.
    Admitted,
    /// Queued; the receiver fires on promotion.
    Queued(oneshot::Receiver<()>),
}

/// Ordered admission entries per group.
pub trait AdmissionState: Send + Sync {
    /// Append a task to its group, admitting it immediately when fewer than
    /// `limit` entries are running.
    fn enqueue(&self, group: &str, task_id: &str, limit: usize) -> Admission;

    /// Remove a task from its group and promote pending entries in FIFO
    /// order up to `limit`. The group is deleted once empty.
    fn release(&self, group: &str, task_id: &str, limit: usize);

    /// Entries of a group in arrival order.
    fn entries(&self, group: &str) -> Vec<(String, EntryStatus)>;
}

struct Entry {
    task_id: String,
    status: EntryStatus,
    resume: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Group {
    entries: VecDeque<Entry>,
}

impl Group {
    fn running(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::InProgress)
            .count()
    }

    fn promote(&mut self, limit: usize) {
        let mut running = self.running();
        let mut abandoned = Vec::new();
        for entry in self.entries.iter_mut() {
            if running >= limit {
                break;
            }
            if entry.status != EntryStatus::Pending {
                continue;
            }
            entry.status = EntryStatus::InProgress;
            let delivered = entry
                .resume
                .take()
                .map(|signal| signal.send(()).is_ok())
                .unwrap_or(false);
            if delivered {
                running += 1;
            } else {
                abandoned.push(entry.task_id.clone());
            }
        }
        self.entries.retain(|e| !abandoned.contains(&e.task_id));
        if !abandoned.is_empty() {
            self.promote(limit);
        }
    }
}

/// In-memory admission state with one lock per group.
#[derive(Default)]
pub struct InMemoryAdmission {
    groups: Mutex<HashMap<String, Arc<Mutex<Group>>>>,
}

impl InMemoryAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }
}

impl AdmissionState for InMemoryAdmission {
    fn enqueue(&self, group: &str, task_id: &str, limit: usize) -> Admission {
        let mut groups = lock(&self.groups);
        let entry = groups.entry(group.to_string()).or_default().clone();
        let mut group = lock(&entry);
        drop(groups);

        // Earlier arrivals go first when the limit was raised since they queued.
        group.promote(limit);
        if group.running() < limit {
            group.entries.push_back(Entry {
                task_id: task_id.to_string(),
                status: EntryStatus::InProgress,
                resume: None,
            });
            Admission::Admitted
        } else {
            let (tx, rx) = oneshot::channel();
            group.entries.push_back(Entry {
                task_id: task_id.to_string(),
                status: EntryStatus::Pending,
                resume: Some(tx),
            });
            Admission::Queued(rx)
        }
    }

    fn release(&self, group: &str, task_id: &str, limit: usize) {
        let mut groups = lock(&self.groups);
        let Some(entry) = groups.get(group).cloned() else {
            return;
        };
        let mut members = lock(&entry);

        if let Some(pos) = members.entries.iter().position(|e| e.task_id == task_id) {
            members.entries.remove(pos);
        }
        members.promote(limit);

        if members.entries.is_empty() {
            groups.remove(group);
        }
    }

    fn entries(&self, group: &str) -> Vec<(String, EntryStatus)> {
        let Some(entry) = lock(&self.groups).get(group).cloned() else {
            return Vec::new();
        };
        let members = lock(&entry);
        members
            .entries
            .iter()
            .map(|e| (e.task_id.clone(), e.status))
            .collect()
    }
}

/// Locks a std mutex, recovering the data from a poisoned lock. The guarded
/// maps stay structurally valid across a panic in another holder.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
