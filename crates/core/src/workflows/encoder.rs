//! The encoder worker: remux every part, then tag every part.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{encode_payload, path_value};
use crate::bus::MessageBus;
use crate::collaborators::{AudioMetadata, ImageKind, Part, Transcoder};
use crate::config::EncoderConfig;
use crate::coordination::{AdmissionGate, CompletionAggregator, ConcurrencyLimit};
use crate::dispatch::{DispatchError, RouteTable, Router, TopicHandler, Validate};
use crate::orchestration::{Orchestrator, Phase, PhaseProgress, Resume};
use crate::task::{NewTask, Task, TaskPatch, TaskStore};

/// Bus topic the encoder listens on.
pub const PROCESS_TOPIC: &str = "encoder.process";

pub mod topics {
    pub const BOOK: &str = "encoder.book";
    pub const REMUX: &str = "encoder.remux.audio";
    pub const METADATA: &str = "encoder.metadata.embed";
}

/// Topics whose `ChildPending` tasks are re-emitted at startup.
pub const ORCHESTRATING_TOPICS: &[&str] = &[topics::BOOK];

pub const REMUX: Phase = Phase::new("remux", &[topics::REMUX]);
pub const METADATA: Phase = Phase::new("metadata", &[topics::METADATA]);

/// A downloaded audio part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePart {
    pub file_path: PathBuf,
    pub part: Part,
}

/// Downloaded artwork.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageFile {
    pub kind: ImageKind,
    pub file_path: PathBuf,
}

/// Root payload of the encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeJob {
    pub content_directory: PathBuf,
    pub audio_metadata: AudioMetadata,
    /// Ordered by part number.
    pub file_parts: Vec<FilePart>,
    #[serde(default)]
    pub images: Vec<ImageFile>,
    #[serde(default)]
    pub remux: PhaseProgress,
    #[serde(default)]
    pub metadata: PhaseProgress,
}

impl Validate for EncodeJob {
    fn validate(&self) -> Result<(), String> {
        if self.file_parts.is_empty() {
            return Err("file_parts must not be empty".to_string());
        }
        if let Some(part) = self
            .file_parts
            .iter()
            .find(|p| p.file_path.as_os_str().is_empty())
        {
            return Err(format!("part {} has an empty file_path", part.part.number));
        }
        Ok(())
    }
}

/// Payload of `encoder.remux.audio`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemuxJob {
    pub file_path: PathBuf,
}

impl Validate for RemuxJob {
    fn validate(&self) -> Result<(), String> {
        if self.file_path.as_os_str().is_empty() {
            return Err("file_path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Payload of `encoder.metadata.embed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataJob {
    pub audio_metadata: AudioMetadata,
    pub file_part: FilePart,
    pub total_parts: usize,
}

impl Validate for MetadataJob {
    fn validate(&self) -> Result<(), String> {
        if self.total_parts == 0 {
            return Err("total_parts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Collaborators the encoder needs.
#[derive(Clone)]
pub struct Encoder {
    pub transcoder: Arc<dyn Transcoder>,
}

impl Encoder {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }

    /// Build the encoder's router: the book orchestrator, the gated remux
    /// topic and the metadata topic, both aggregated into the book.
    pub fn router(
        &self,
        config: &EncoderConfig,
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Router {
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), PROCESS_TOPIC));

        let routes = RouteTable::new()
            .route(
                topics::BOOK,
                BookHandler {
                    orchestrator: orchestrator.clone(),
                },
            )
            .route(
                topics::REMUX,
                RemuxHandler {
                    orchestrator: orchestrator.clone(),
                    transcoder: self.transcoder.clone(),
                },
            )
            .route(
                topics::METADATA,
                MetadataHandler {
                    orchestrator,
                    transcoder: self.transcoder.clone(),
                },
            );

        let aggregator = CompletionAggregator::new(store.clone(), bus)
            .track(topics::REMUX, REMUX.done_path(), PROCESS_TOPIC)
            .track(topics::METADATA, METADATA.done_path(), PROCESS_TOPIC);
        let gate = AdmissionGate::new(
            topics::REMUX,
            ConcurrencyLimit::new(config.remux_concurrency),
        );

        Router::new(routes, store)
            .with_aggregator(Arc::new(aggregator))
            .with_gate(topics::REMUX, Arc::new(gate))
    }
}

struct BookHandler {
    orchestrator: Arc<Orchestrator>,
}

impl BookHandler {
    fn remux_children(job: &EncodeJob) -> Result<Vec<NewTask>, DispatchError> {
        job.file_parts
            .iter()
            .map(|file_part| {
                let remux = RemuxJob {
                    file_path: file_part.file_path.clone(),
                };
                Ok(NewTask::pending(
                    topics::REMUX,
                    encode_payload(topics::REMUX, &remux)?,
                ))
            })
            .collect()
    }

    fn metadata_children(job: &EncodeJob) -> Result<Vec<NewTask>, DispatchError> {
        job.file_parts
            .iter()
            .map(|file_part| {
                let metadata = MetadataJob {
                    audio_metadata: job.audio_metadata.clone(),
                    file_part: file_part.clone(),
                    total_parts: job.file_parts.len(),
                };
                Ok(NewTask::pending(
                    topics::METADATA,
                    encode_payload(topics::METADATA, &metadata)?,
                ))
            })
            .collect()
    }

    /// Fans out `phase` if it never started. Returns whether the phase is done.
    async fn advance(
        &self,
        task: &Task,
        phase: &Phase,
        children: impl FnOnce() -> Result<Vec<NewTask>, DispatchError>,
    ) -> Result<bool, DispatchError> {
        match self.orchestrator.resume(task, phase).await? {
            Resume::Done => Ok(true),
            Resume::NotStarted => {
                self.orchestrator.fan_out(task, phase, children()?).await?;
                Ok(false)
            }
            Resume::Waiting { outstanding } => {
                debug!(
                    "Task {} waiting for {} {} children",
                    task.id, outstanding, phase.key
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl TopicHandler for BookHandler {
    type Payload = EncodeJob;

    async fn handle(&self, task: Task, job: EncodeJob) -> Result<(), DispatchError> {
        if !self
            .advance(&task, &REMUX, || Self::remux_children(&job))
            .await?
        {
            return Ok(());
        }

        if !self
            .advance(&task, &METADATA, || Self::metadata_children(&job))
            .await?
        {
            return Ok(());
        }

        self.orchestrator.complete(&task).await?;
        info!(
            "Encoded {} ({} parts)",
            job.audio_metadata.title,
            job.file_parts.len()
        );
        Ok(())
    }
}

struct RemuxHandler {
    orchestrator: Arc<Orchestrator>,
    transcoder: Arc<dyn Transcoder>,
}

#[async_trait]
impl TopicHandler for RemuxHandler {
    type Payload = RemuxJob;

    async fn handle(&self, task: Task, job: RemuxJob) -> Result<(), DispatchError> {
        let path = self.transcoder.remux(&job.file_path).await?;
        self.orchestrator
            .complete_child(
                &task,
                TaskPatch::new().set("file_path", path_value(&path)),
                &REMUX.completed_path(),
            )
            .await?;
        Ok(())
    }
}

struct MetadataHandler {
    orchestrator: Arc<Orchestrator>,
    transcoder: Arc<dyn Transcoder>,
}

#[async_trait]
impl TopicHandler for MetadataHandler {
    type Payload = MetadataJob;

    async fn handle(&self, task: Task, job: MetadataJob) -> Result<(), DispatchError> {
        self.transcoder
            .embed_metadata(
                &job.file_part.file_path,
                &job.audio_metadata,
                &job.file_part.part,
                job.total_parts,
            )
            .await?;
        self.orchestrator
            .complete_child(&task, TaskPatch::new(), &METADATA.completed_path())
            .await?;
        Ok(())
    }
}
