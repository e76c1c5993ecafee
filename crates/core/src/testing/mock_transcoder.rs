//! Mock transcoder for testing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collaborators::{AudioMetadata, Part, Transcoder};
use crate::dispatch::ExternalError;

/// A recorded transcoder call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedTranscode {
    Remux {
        path: PathBuf,
    },
    Metadata {
        path: PathBuf,
        title: String,
        track: u32,
        total_parts: usize,
    },
}

/// Mock implementation of [`Transcoder`]. Files are left untouched.
#[derive(Debug, Default)]
pub struct MockTranscoder {
    calls: Arc<RwLock<Vec<RecordedTranscode>>>,
    /// If set, the next call fails with this message.
    next_error: Arc<RwLock<Option<String>>>,
}

impl MockTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_calls(&self) -> Vec<RecordedTranscode> {
        self.calls.read().await.clone()
    }

    pub async fn remux_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, RecordedTranscode::Remux { .. }))
            .count()
    }

    pub async fn metadata_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, RecordedTranscode::Metadata { .. }))
            .count()
    }

    pub async fn set_next_error(&self, message: impl Into<String>) {
        *self.next_error.write().await = Some(message.into());
    }

    async fn take_error(&self) -> Result<(), ExternalError> {
        match self.next_error.write().await.take() {
            Some(message) => Err(ExternalError::new(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn remux(&self, path: &Path) -> Result<PathBuf, ExternalError> {
        self.take_error().await?;
        self.calls.write().await.push(RecordedTranscode::Remux {
            path: path.to_path_buf(),
        });
        Ok(path.to_path_buf())
    }

    async fn embed_metadata(
        &self,
        path: &Path,
        metadata: &AudioMetadata,
        part: &Part,
        total_parts: usize,
    ) -> Result<(), ExternalError> {
        self.take_error().await?;
        self.calls.write().await.push(RecordedTranscode::Metadata {
            path: path.to_path_buf(),
            title: metadata.title.clone(),
            track: part.number,
            total_parts,
        });
        Ok(())
    }
}
