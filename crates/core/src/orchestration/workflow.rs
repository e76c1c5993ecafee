//! The [`Orchestrator`]: ordered store writes and emits for workflows.
//!
//! Every algorithm here awaits its status write before emitting anything
//! that depends on it. The bus gives no ordering guarantee, so ordering is
//! only ever established by sequencing in this module.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::progress::{Phase, PhaseProgress};
use crate::bus::{task_message, MessageBus};
use crate::dispatch::DispatchError;
use crate::task::{NewTask, StoreError, Task, TaskFilter, TaskPatch, TaskStatus, TaskStore};

/// Where a phase stands when its parent is (re)dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// No children exist yet; the caller fans out.
    NotStarted,
    /// The phase is complete; the caller moves on to the next phase.
    Done,
    /// Children are outstanding; unfinished ones were re-emitted and the
    /// parent is back in `ChildPending`.
    Waiting { outstanding: usize },
}

/// Store/bus sequencing shared by the workflows of one worker.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    process_topic: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        process_topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            process_topic: process_topic.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Bus topic this worker's tasks are processed on.
    pub fn process_topic(&self) -> &str {
        &self.process_topic
    }

    /// Emit a process message for a task on this worker's topic.
    pub async fn emit(&self, task: &Task) -> Result<(), DispatchError> {
        self.emit_on(&self.process_topic, task).await
    }

    /// Emit a process message for a task on another worker's topic.
    pub async fn emit_on(&self, topic: &str, task: &Task) -> Result<(), DispatchError> {
        self.bus.emit(topic, task_message(task)?).await?;
        Ok(())
    }

    /// Spawn the children of `phase`: mark the parent `ChildPending` and
    /// reset the phase progress, persist every child in one batch, then emit
    /// each child.
    pub async fn fan_out(
        &self,
        parent: &Task,
        phase: &Phase,
        children: Vec<NewTask>,
    ) -> Result<Vec<Task>, DispatchError> {
        if children.is_empty() {
            return Err(DispatchError::Validation(format!(
                "task {} has no {} children to spawn",
                parent.id, phase.key
            )));
        }

        let total = children.len();
        self.store
            .update(
                &parent.id,
                TaskPatch::status(TaskStatus::ChildPending)
                    .set(phase.total_path(), Value::from(total))
                    .set(phase.completed_path(), Value::from(0))
                    .set(phase.done_path(), Value::Bool(false)),
            )
            .await?;

        let children = children
            .into_iter()
            .map(|child| child.with_parent(&parent.id))
            .collect();
        let created = self.store.create_many(children).await?;
        info!(
            "Created {} {} child tasks for task {}",
            created.len(),
            phase.key,
            parent.id
        );

        try_join_all(created.iter().map(|child| self.emit(child))).await?;
        Ok(created)
    }

    /// Single-step continuation on this worker: create `next` under
    /// `current`, complete `current`, emit `next`.
    pub async fn continue_with(&self, current: &Task, next: NewTask) -> Result<Task, DispatchError> {
        let topic = self.process_topic.clone();
        self.continue_on(&topic, current, next).await
    }

    /// Single-step continuation whose follow-up is processed on `topic`.
    pub async fn continue_on(
        &self,
        topic: &str,
        current: &Task,
        next: NewTask,
    ) -> Result<Task, DispatchError> {
        let next = self.store.create(next.with_parent(&current.id)).await?;
        self.store
            .update(&current.id, TaskPatch::completed())
            .await?;
        info!(
            "Task {} completed, continuing with {} task {}",
            current.id, next.topic, next.id
        );
        self.emit_on(topic, &next).await?;
        Ok(next)
    }

    /// Mark a task completed.
    pub async fn complete(&self, task: &Task) -> Result<Task, DispatchError> {
        let task = self.store.update(&task.id, TaskPatch::completed()).await?;
        info!("Task {} completed", task.id);
        Ok(task)
    }

    /// Complete a fan-out child, then count it on its parent.
    ///
    /// `result` may carry extra `set` fields (output paths...); its status is
    /// forced to `Completed`. The parent counter is advanced only after the
    /// child is durably completed, so a crash in between under-counts.
    pub async fn complete_child(
        &self,
        child: &Task,
        result: TaskPatch,
        counter_path: &str,
    ) -> Result<Task, DispatchError> {
        let mut patch = result;
        patch.status = Some(TaskStatus::Completed);
        let completed = self.store.update(&child.id, patch).await?;

        if let Some(parent_id) = &child.parent_task_id {
            self.store
                .update(parent_id, TaskPatch::new().inc(counter_path, 1))
                .await?;
            debug!("Counted task {} on {} of task {}", child.id, counter_path, parent_id);
        }
        Ok(completed)
    }

    /// Decide where `phase` of `parent` stands, repairing what the Store
    /// shows is missing.
    ///
    /// - `done` flag set: [`Resume::Done`].
    /// - no children: [`Resume::NotStarted`].
    /// - a failed child: [`DispatchError::ChildFailed`].
    /// - all children completed: the flag is set under a guard and
    ///   [`Resume::Done`] returned; if another caller won the guard the phase
    ///   is left to it ([`Resume::Waiting`]).
    /// - otherwise: parent back to `ChildPending` and every unfinished child
    ///   re-emitted.
    pub async fn resume(&self, parent: &Task, phase: &Phase) -> Result<Resume, DispatchError> {
        let progress = PhaseProgress::of(parent, phase);
        if progress.done {
            debug!("Phase {} of task {} already done", phase.key, parent.id);
            return Ok(Resume::Done);
        }

        let mut filter = TaskFilter::new().with_parent(&parent.id);
        for topic in phase.child_topics {
            filter = filter.with_topic(*topic);
        }
        let children = self.store.find_all(&filter).await?;

        if children.is_empty() {
            return Ok(Resume::NotStarted);
        }

        if let Some(failed) = children.iter().find(|c| c.status == TaskStatus::Failed) {
            return Err(DispatchError::ChildFailed {
                child_id: failed.id.clone(),
                message: failed
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            });
        }

        let unfinished: Vec<&Task> = children
            .iter()
            .filter(|c| c.status != TaskStatus::Completed)
            .collect();

        if unfinished.is_empty() {
            let patch = TaskPatch::new()
                .set(phase.done_path(), Value::Bool(true))
                .set(phase.completed_path(), Value::from(children.len()))
                .only_if(phase.done_path(), Value::Bool(false));
            return match self.store.update(&parent.id, patch).await {
                Ok(_) => {
                    info!(
                        "All {} children of task {} completed on resume",
                        phase.key, parent.id
                    );
                    Ok(Resume::Done)
                }
                Err(StoreError::PreconditionFailed { .. }) => {
                    debug!("Phase {} of task {} completed elsewhere", phase.key, parent.id);
                    Ok(Resume::Waiting { outstanding: 0 })
                }
                Err(e) => Err(e.into()),
            };
        }

        if progress.counts_complete() {
            warn!(
                "Task {} counts {}/{} {} children but {} are unfinished",
                parent.id,
                progress.completed,
                progress.total,
                phase.key,
                unfinished.len()
            );
        }

        self.store
            .update(&parent.id, TaskPatch::status(TaskStatus::ChildPending))
            .await?;
        try_join_all(unfinished.iter().map(|child| self.emit(child))).await?;
        info!(
            "Re-emitted {} unfinished {} children of task {}",
            unfinished.len(),
            phase.key,
            parent.id
        );
        Ok(Resume::Waiting {
            outstanding: unfinished.len(),
        })
    }

    /// Re-emit every `ChildPending` task of the given orchestrating topics.
    /// Used at startup to rebuild coordination state lost with the process.
    pub async fn recover(&self, topics: &[&str]) -> Result<usize, DispatchError> {
        if topics.is_empty() {
            return Ok(0);
        }
        let mut filter = TaskFilter::new().with_status(TaskStatus::ChildPending);
        for topic in topics {
            filter = filter.with_topic(*topic);
        }

        let stuck = self.store.find_all(&filter).await?;
        for task in &stuck {
            info!("Recovering task {} on {}", task.id, task.topic);
            self.emit(task).await?;
        }
        Ok(stuck.len())
    }
}
