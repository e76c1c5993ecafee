//! Manual recovery and cleanup.
//!
//! Nothing in the pipeline retries on its own. An operator replays failed
//! tasks or republishes a stuck one; resumption re-derives everything else
//! from the Store.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::bus::{task_message, MessageBus};
use crate::config::CleanupConfig;
use crate::dispatch::{DispatchError, ExternalError};
use crate::metrics;
use crate::task::{Task, TaskFilter, TaskPatch, TaskStatus, TaskStore};
use crate::workflows::process_topic_for;

/// Result of [`Maintenance::replay_failed`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReplayReport {
    /// Ids of the republished tasks.
    pub replayed: Vec<String>,
    /// Failed children reset to `Pending` (not emitted).
    pub children_reset: usize,
}

/// Result of [`Maintenance::purge`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PurgeReport {
    /// Task rows removed from the store.
    pub removed: usize,
    /// Top-level entries deleted from the target directory.
    pub entries_deleted: usize,
}

pub struct Maintenance {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    cleanup: CleanupConfig,
}

impl Maintenance {
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            store,
            bus,
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Reset every failed task of `topic` to `Pending` and republish it.
    ///
    /// With `with_children`, failed children of each replayed task are reset
    /// as well; the parent's resume path re-emits them.
    pub async fn replay_failed(
        &self,
        topic: &str,
        with_children: bool,
    ) -> Result<ReplayReport, DispatchError> {
        let process_topic = process_topic_for(topic)
            .ok_or_else(|| DispatchError::UnknownTopic(topic.to_string()))?;

        let failed = self
            .store
            .find_all(
                &TaskFilter::new()
                    .with_topic(topic)
                    .with_status(TaskStatus::Failed),
            )
            .await?;

        let mut report = ReplayReport::default();
        for task in failed {
            if with_children {
                report.children_reset += self.reset_failed_children(&task).await?;
            }
            let task = self.store.update(&task.id, TaskPatch::replay()).await?;
            self.bus.emit(process_topic, task_message(&task)?).await?;
            info!("Replayed task {} on {}", task.id, topic);
            metrics::TASKS_REPLAYED.with_label_values(&[topic]).inc();
            report.replayed.push(task.id);
        }
        Ok(report)
    }

    async fn reset_failed_children(&self, parent: &Task) -> Result<usize, DispatchError> {
        let children = self
            .store
            .find_all(
                &TaskFilter::new()
                    .with_parent(&parent.id)
                    .with_status(TaskStatus::Failed),
            )
            .await?;
        for child in &children {
            self.store.update(&child.id, TaskPatch::replay()).await?;
        }
        if !children.is_empty() {
            info!(
                "Reset {} failed children of task {}",
                children.len(),
                parent.id
            );
        }
        Ok(children.len())
    }

    /// Republish a non-terminal task as stored, e.g. a `ChildPending` parent
    /// whose fan-in was lost.
    pub async fn republish(&self, id: &str) -> Result<Task, DispatchError> {
        let task = self.store.get(id).await?;
        if task.status.is_terminal() {
            return Err(DispatchError::Validation(format!(
                "task {} is {} and cannot be republished",
                task.id, task.status
            )));
        }
        let process_topic = process_topic_for(&task.topic)
            .ok_or_else(|| DispatchError::UnknownTopic(task.topic.clone()))?;
        self.bus.emit(process_topic, task_message(&task)?).await?;
        info!("Republished task {} on {}", task.id, process_topic);
        Ok(task)
    }

    /// Clean up one book by its target directory.
    ///
    /// Deletes the directory's contents when `cleanup.directory` is set (the
    /// directory itself stays) and the book's task rows when `cleanup.db` is.
    pub async fn purge(&self, target_directory: &Path) -> Result<PurgeReport, DispatchError> {
        if target_directory.as_os_str().is_empty() {
            return Err(DispatchError::Validation(
                "target_directory must not be empty".to_string(),
            ));
        }

        let mut report = PurgeReport::default();
        if self.cleanup.directory {
            if !target_directory.is_absolute() || target_directory.parent().is_none() {
                return Err(DispatchError::Validation(format!(
                    "refusing to clear {}",
                    target_directory.display()
                )));
            }
            report.entries_deleted = clear_directory(target_directory).await.map_err(|e| {
                ExternalError::with_source(
                    format!("failed to clear {}", target_directory.display()),
                    e,
                )
            })?;
            info!(
                "Deleted {} entries from {}",
                report.entries_deleted,
                target_directory.display()
            );
        }

        if self.cleanup.db {
            let filter = TaskFilter::new().with_payload(
                "target_directory",
                Value::String(target_directory.to_string_lossy().into_owned()),
            );
            report.removed = self.store.remove_many(&filter).await?;
            if report.removed == 0 {
                warn!("No tasks found for {}", target_directory.display());
            } else {
                info!(
                    "Removed {} tasks for {}",
                    report.removed,
                    target_directory.display()
                );
            }
            metrics::TASKS_PURGED
                .with_label_values(&[])
                .inc_by(report.removed as u64);
        }
        Ok(report)
    }
}

/// Delete everything inside `dir`, keeping `dir` itself. A missing directory
/// has nothing to delete.
async fn clear_directory(dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        // Symlinks are unlinked, never followed.
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, SqliteTaskStore, TaskError};
    use crate::testing::RecordingBus;
    use serde_json::json;

    struct Fixture {
        store: Arc<SqliteTaskStore>,
        bus: Arc<RecordingBus>,
        maintenance: Maintenance,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let bus = Arc::new(RecordingBus::new());
        let maintenance = Maintenance::new(store.clone(), bus.clone());
        Fixture {
            store,
            bus,
            maintenance,
        }
    }

    async fn failed(f: &Fixture, topic: &str, parent: Option<&str>) -> Task {
        let mut new = NewTask::pending(topic, json!({ "target_directory": "/books/a" }));
        if let Some(parent) = parent {
            new = new.with_parent(parent);
        }
        let task = f.store.create(new).await.unwrap();
        f.store
            .update(&task.id, TaskPatch::failed(TaskError::new("disk full")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replay_failed_republishes() {
        let f = fixture();
        let parent = failed(&f, "odm.downloads", None).await;
        let child = failed(&f, "odm.download.file", Some(&parent.id)).await;

        let report = f
            .maintenance
            .replay_failed("odm.downloads", false)
            .await
            .unwrap();
        assert_eq!(report.replayed, vec![parent.id.clone()]);
        assert_eq!(report.children_reset, 0);

        let stored = f.store.get(&parent.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.error.is_none());
        assert_eq!(
            f.store.get(&child.id).await.unwrap().status,
            TaskStatus::Failed
        );

        let emitted = f.bus.emitted_on("odm.process").await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["status"], json!("pending"));
    }

    #[tokio::test]
    async fn test_replay_with_children_resets_without_emitting_them() {
        let f = fixture();
        let parent = failed(&f, "encoder.book", None).await;
        let child = failed(&f, "encoder.remux.audio", Some(&parent.id)).await;

        let report = f
            .maintenance
            .replay_failed("encoder.book", true)
            .await
            .unwrap();
        assert_eq!(report.children_reset, 1);
        assert_eq!(
            f.store.get(&child.id).await.unwrap().status,
            TaskStatus::Pending
        );

        let emitted = f.bus.emitted_on("encoder.process").await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["id"], json!(parent.id));
    }

    #[tokio::test]
    async fn test_replay_unknown_topic() {
        let f = fixture();
        let err = f.maintenance.replay_failed("mystery", false).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn test_republish_rejects_terminal_tasks() {
        let f = fixture();
        let task = failed(&f, "odm.downloads", None).await;
        assert!(f.maintenance.republish(&task.id).await.is_err());

        let pending = f
            .store
            .create(NewTask::pending("odm.downloads", json!({})))
            .await
            .unwrap();
        f.maintenance.republish(&pending.id).await.unwrap();
        assert_eq!(f.bus.emitted_on("odm.process").await.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_by_target_directory() {
        let f = fixture();
        failed(&f, "odm.downloads", None).await;
        failed(&f, "odm.download.file", None).await;
        f.store
            .create(NewTask::pending(
                "odm.downloads",
                json!({ "target_directory": "/books/b" }),
            ))
            .await
            .unwrap();

        let report = f.maintenance.purge(Path::new("/books/a")).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.entries_deleted, 0);
        assert_eq!(f.store.find_all(&TaskFilter::new()).await.unwrap().len(), 1);
        assert!(f.maintenance.purge(Path::new("")).await.is_err());
    }

    async fn book_on_disk(f: &Fixture) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("book.odm"), b"<odm/>").unwrap();
        std::fs::create_dir_all(dir.path().join("parts/nested")).unwrap();
        std::fs::write(dir.path().join("parts/nested/Part01.mp3"), b"mp3").unwrap();
        f.store
            .create(NewTask::pending(
                "odm.downloads",
                json!({ "target_directory": dir.path().to_string_lossy() }),
            ))
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_purge_clears_directory_contents_when_enabled() {
        let mut f = fixture();
        f.maintenance = Maintenance::new(f.store.clone(), f.bus.clone()).with_cleanup(
            CleanupConfig {
                directory: true,
                db: true,
            },
        );
        let dir = book_on_disk(&f).await;

        let report = f.maintenance.purge(dir.path()).await.unwrap();
        assert_eq!(report.entries_deleted, 2);
        assert_eq!(report.removed, 1);
        assert!(dir.path().is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_purge_leaves_files_by_default() {
        let f = fixture();
        let dir = book_on_disk(&f).await;

        let report = f.maintenance.purge(dir.path()).await.unwrap();
        assert_eq!(report.entries_deleted, 0);
        assert_eq!(report.removed, 1);
        assert!(dir.path().join("book.odm").exists());
    }

    #[tokio::test]
    async fn test_purge_directory_only_keeps_tasks() {
        let mut f = fixture();
        f.maintenance = Maintenance::new(f.store.clone(), f.bus.clone()).with_cleanup(
            CleanupConfig {
                directory: true,
                db: false,
            },
        );
        let dir = book_on_disk(&f).await;

        let report = f.maintenance.purge(dir.path()).await.unwrap();
        assert_eq!(report.entries_deleted, 2);
        assert_eq!(report.removed, 0);
        assert_eq!(f.store.find_all(&TaskFilter::new()).await.unwrap().len(), 1);

        // Already empty, and a vanished directory is not an error.
        assert_eq!(f.maintenance.purge(dir.path()).await.unwrap().entries_deleted, 0);
        let gone = dir.path().join("missing");
        assert_eq!(f.maintenance.purge(&gone).await.unwrap().entries_deleted, 0);
    }

    #[tokio::test]
    async fn test_purge_refuses_to_clear_relative_or_root() {
        let mut f = fixture();
        f.maintenance = Maintenance::new(f.store.clone(), f.bus.clone()).with_cleanup(
            CleanupConfig {
                directory: true,
                db: true,
            },
        );
        for path in ["books/a", "/"] {
            let err = f.maintenance.purge(Path::new(path)).await.unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)));
        }
    }
}
