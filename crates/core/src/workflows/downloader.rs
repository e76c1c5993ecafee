//! The ODM downloader worker.
//!
//! ```text
//! odm.license.download ─▶ odm.downloads ─┬▶ odm.download.file  (per part, gated)
//!                                        └▶ odm.download.image (cover, thumbnail)
//!                          ◀── downloads.done ──┘
//!                         odm.downloads ─▶ odm.assemble ─▶ encoder.book
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::encoder::{self, EncodeJob, FilePart, ImageFile};
use super::{encode_payload, path_value};
use crate::bus::MessageBus;
use crate::collaborators::{
    part_number_width, ImageKind, License, LicenseClient, MediaFetcher, OdmContent, Part,
};
use crate::config::DownloaderConfig;
use crate::coordination::{AdmissionGate, CompletionAggregator, ConcurrencyLimit};
use crate::dispatch::{DispatchError, RouteTable, Router, TopicHandler, Validate};
use crate::orchestration::{Orchestrator, Phase, PhaseProgress, Resume};
use crate::task::{NewTask, Task, TaskFilter, TaskPatch, TaskStatus, TaskStore};

/// Bus topic the downloader listens on.
pub const PROCESS_TOPIC: &str = "odm.process";

pub mod topics {
    pub const LICENSE: &str = "odm.license.download";
    pub const DOWNLOADS: &str = "odm.downloads";
    pub const FILE: &str = "odm.download.file";
    pub const IMAGE: &str = "odm.download.image";
    pub const ASSEMBLE: &str = "odm.assemble";
}

/// Topics whose `ChildPending` tasks are re-emitted at startup.
pub const ORCHESTRATING_TOPICS: &[&str] = &[topics::DOWNLOADS];

/// The single fan-out phase of `odm.downloads`.
pub const DOWNLOADS: Phase = Phase::new("downloads", &[topics::FILE, topics::IMAGE]);

/// Root payload: a parsed order and where to put the book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OdmJob {
    pub target_directory: PathBuf,
    /// Stem of the saved `.odm` and `.license` files.
    pub file_stem: String,
    pub odm: OdmContent,
}

impl Validate for OdmJob {
    fn validate(&self) -> Result<(), String> {
        if self.target_directory.as_os_str().is_empty() {
            return Err("target_directory must not be empty".to_string());
        }
        if self.file_stem.trim().is_empty() {
            return Err("file_stem must not be empty".to_string());
        }
        if self.odm.media_id.trim().is_empty() {
            return Err("odm.media_id must not be empty".to_string());
        }
        if self.odm.parts.is_empty() {
            return Err("odm has no parts".to_string());
        }
        Ok(())
    }
}

/// Payload of `odm.downloads`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadsJob {
    #[serde(flatten)]
    pub job: OdmJob,
    pub license: License,
    #[serde(default)]
    pub downloads: PhaseProgress,
}

impl Validate for DownloadsJob {
    fn validate(&self) -> Result<(), String> {
        self.job.validate()
    }
}

/// Payload of `odm.download.file`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDownload {
    pub target_directory: PathBuf,
    pub part: Part,
    /// Zero-padding width of part numbers in file names.
    pub width: usize,
    pub odm: OdmContent,
    pub license: License,
    /// Set when the download completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Validate for FileDownload {
    fn validate(&self) -> Result<(), String> {
        if self.part.filename.trim().is_empty() {
            return Err(format!("part {} has no filename", self.part.number));
        }
        Ok(())
    }
}

/// Payload of `odm.download.image`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDownload {
    pub target_directory: PathBuf,
    pub kind: ImageKind,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Validate for ImageDownload {
    fn validate(&self) -> Result<(), String> {
        if !self.image_url.starts_with("http://") && !self.image_url.starts_with("https://") {
            return Err(format!("unsupported image url {}", self.image_url));
        }
        Ok(())
    }
}

/// Collaborators the downloader needs.
#[derive(Clone)]
pub struct Downloader {
    pub licenses: Arc<dyn LicenseClient>,
    pub fetcher: Arc<dyn MediaFetcher>,
}

impl Downloader {
    pub fn new(licenses: Arc<dyn LicenseClient>, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { licenses, fetcher }
    }

    /// Build the downloader's router: every `odm.*` topic, the part
    /// download gate and the `downloads.done` aggregator.
    pub fn router(
        &self,
        config: &DownloaderConfig,
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Router {
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), PROCESS_TOPIC));

        let routes = RouteTable::new()
            .route(
                topics::LICENSE,
                LicenseHandler {
                    orchestrator: orchestrator.clone(),
                    licenses: self.licenses.clone(),
                },
            )
            .route(
                topics::DOWNLOADS,
                DownloadsHandler {
                    orchestrator: orchestrator.clone(),
                },
            )
            .route(
                topics::FILE,
                FileHandler {
                    orchestrator: orchestrator.clone(),
                    fetcher: self.fetcher.clone(),
                },
            )
            .route(
                topics::IMAGE,
                ImageHandler {
                    orchestrator: orchestrator.clone(),
                    fetcher: self.fetcher.clone(),
                },
            )
            .route(topics::ASSEMBLE, AssembleHandler { orchestrator });

        let done = DOWNLOADS.done_path();
        let aggregator = CompletionAggregator::new(store.clone(), bus)
            .track(topics::FILE, done.as_str(), PROCESS_TOPIC)
            .track(topics::IMAGE, done.as_str(), PROCESS_TOPIC);
        let gate = AdmissionGate::new(
            topics::FILE,
            ConcurrencyLimit::new(config.file_concurrency),
        );

        Router::new(routes, store)
            .with_aggregator(Arc::new(aggregator))
            .with_gate(topics::FILE, Arc::new(gate))
    }
}

struct LicenseHandler {
    orchestrator: Arc<Orchestrator>,
    licenses: Arc<dyn LicenseClient>,
}

#[async_trait]
impl TopicHandler for LicenseHandler {
    type Payload = OdmJob;

    async fn handle(&self, task: Task, job: OdmJob) -> Result<(), DispatchError> {
        let license = self
            .licenses
            .acquire(&job.odm, &job.target_directory, &job.file_stem)
            .await?;
        info!(
            "Acquired license for {} into {}",
            job.odm.media_id,
            license.path.display()
        );

        let next = DownloadsJob {
            job,
            license,
            downloads: PhaseProgress::default(),
        };
        let payload = encode_payload(topics::DOWNLOADS, &next)?;
        self.orchestrator
            .continue_with(&task, NewTask::pending(topics::DOWNLOADS, payload))
            .await?;
        Ok(())
    }
}

struct DownloadsHandler {
    orchestrator: Arc<Orchestrator>,
}

impl DownloadsHandler {
    fn children(job: &DownloadsJob) -> Result<Vec<NewTask>, DispatchError> {
        let odm = &job.job.odm;
        let width = part_number_width(odm.parts.len());

        let mut children = Vec::with_capacity(odm.parts.len() + 2);
        for part in &odm.parts {
            let download = FileDownload {
                target_directory: job.job.target_directory.clone(),
                part: part.clone(),
                width,
                odm: odm.clone(),
                license: job.license.clone(),
                file_path: None,
            };
            children.push(NewTask::pending(
                topics::FILE,
                encode_payload(topics::FILE, &download)?,
            ));
        }

        let images = [
            (ImageKind::Cover, &odm.cover_url),
            (ImageKind::Thumbnail, &odm.thumbnail_url),
        ];
        for (kind, url) in images {
            let Some(url) = url else { continue };
            let download = ImageDownload {
                target_directory: job.job.target_directory.clone(),
                kind,
                image_url: url.clone(),
                file_path: None,
            };
            children.push(NewTask::pending(
                topics::IMAGE,
                encode_payload(topics::IMAGE, &download)?,
            ));
        }
        Ok(children)
    }
}

#[async_trait]
impl TopicHandler for DownloadsHandler {
    type Payload = DownloadsJob;

    async fn handle(&self, task: Task, job: DownloadsJob) -> Result<(), DispatchError> {
        match self.orchestrator.resume(&task, &DOWNLOADS).await? {
            Resume::NotStarted => {
                let children = Self::children(&job)?;
                self.orchestrator
                    .fan_out(&task, &DOWNLOADS, children)
                    .await?;
            }
            Resume::Done => {
                let payload = encode_payload(topics::ASSEMBLE, &job.job)?;
                self.orchestrator
                    .continue_with(&task, NewTask::pending(topics::ASSEMBLE, payload))
                    .await?;
            }
            Resume::Waiting { outstanding } => {
                debug!("Task {} waiting for {} downloads", task.id, outstanding);
            }
        }
        Ok(())
    }
}

struct FileHandler {
    orchestrator: Arc<Orchestrator>,
    fetcher: Arc<dyn MediaFetcher>,
}

#[async_trait]
impl TopicHandler for FileHandler {
    type Payload = FileDownload;

    async fn handle(&self, task: Task, download: FileDownload) -> Result<(), DispatchError> {
        let path = self
            .fetcher
            .fetch_part(
                &download.odm,
                &download.license,
                &download.part,
                download.width,
                &download.target_directory,
            )
            .await?;
        info!("Downloaded part {} to {}", download.part.number, path.display());

        self.orchestrator
            .complete_child(
                &task,
                TaskPatch::new().set("file_path", path_value(&path)),
                &DOWNLOADS.completed_path(),
            )
            .await?;
        Ok(())
    }
}

struct ImageHandler {
    orchestrator: Arc<Orchestrator>,
    fetcher: Arc<dyn MediaFetcher>,
}

#[async_trait]
impl TopicHandler for ImageHandler {
    type Payload = ImageDownload;

    async fn handle(&self, task: Task, download: ImageDownload) -> Result<(), DispatchError> {
        let path = self
            .fetcher
            .fetch_image(&download.image_url, download.kind, &download.target_directory)
            .await?;
        info!("Downloaded {} to {}", download.kind.as_str(), path.display());

        self.orchestrator
            .complete_child(
                &task,
                TaskPatch::new().set("file_path", path_value(&path)),
                &DOWNLOADS.completed_path(),
            )
            .await?;
        Ok(())
    }
}

struct AssembleHandler {
    orchestrator: Arc<Orchestrator>,
}

impl AssembleHandler {
    /// Downloaded parts and images of the `odm.downloads` task, from the Store.
    async fn downloaded(
        &self,
        downloads_id: &str,
    ) -> Result<(Vec<FilePart>, Vec<ImageFile>), DispatchError> {
        let children = self
            .orchestrator
            .store()
            .find_all(
                &TaskFilter::new()
                    .with_parent(downloads_id)
                    .with_topic(topics::FILE)
                    .with_topic(topics::IMAGE),
            )
            .await?;

        let mut parts = Vec::new();
        let mut images = Vec::new();
        for child in children {
            if child.status != TaskStatus::Completed {
                return Err(DispatchError::Validation(format!(
                    "download {} of task {} is {}",
                    child.id, downloads_id, child.status
                )));
            }
            let missing = || {
                DispatchError::Validation(format!("download {} has no file_path", child.id))
            };
            if child.topic == topics::FILE {
                let download: FileDownload = decode_child(&child)?;
                let file_path = download.file_path.ok_or_else(missing)?;
                parts.push(FilePart {
                    file_path,
                    part: download.part,
                });
            } else {
                let download: ImageDownload = decode_child(&child)?;
                let file_path = download.file_path.ok_or_else(missing)?;
                images.push(ImageFile {
                    kind: download.kind,
                    file_path,
                });
            }
        }
        parts.sort_by_key(|p| p.part.number);
        Ok((parts, images))
    }
}

fn decode_child<T: serde::de::DeserializeOwned>(child: &Task) -> Result<T, DispatchError> {
    serde_json::from_value(child.payload.clone()).map_err(|e| DispatchError::InvalidPayload {
        topic: child.topic.clone(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl TopicHandler for AssembleHandler {
    type Payload = OdmJob;

    async fn handle(&self, task: Task, job: OdmJob) -> Result<(), DispatchError> {
        let downloads_id = task.parent_task_id.clone().ok_or_else(|| {
            DispatchError::Validation(format!("task {} has no downloads parent", task.id))
        })?;

        let (file_parts, images) = self.downloaded(&downloads_id).await?;
        if file_parts.len() != job.odm.parts.len() {
            return Err(DispatchError::Validation(format!(
                "expected {} downloaded parts, found {}",
                job.odm.parts.len(),
                file_parts.len()
            )));
        }

        let encode = EncodeJob {
            content_directory: job.target_directory.clone(),
            audio_metadata: job.odm.metadata.clone(),
            file_parts,
            images,
            remux: PhaseProgress::default(),
            metadata: PhaseProgress::default(),
        };
        let payload = encode_payload(encoder::topics::BOOK, &encode)?;
        let next = self
            .orchestrator
            .continue_on(
                encoder::PROCESS_TOPIC,
                &task,
                NewTask::pending(encoder::topics::BOOK, payload),
            )
            .await?;
        info!(
            "Handed {} to the encoder as task {}",
            job.odm.metadata.title, next.id
        );
        Ok(())
    }
}
