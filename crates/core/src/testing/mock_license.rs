//! Mock license client for testing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collaborators::{License, LicenseClient, OdmContent};
use crate::dispatch::ExternalError;

/// Mock implementation of [`LicenseClient`].
///
/// Issues a fixed license saved as `<target>/<stem>.license` without
/// touching the filesystem, and records every acquisition.
#[derive(Debug, Default)]
pub struct MockLicenseClient {
    /// Media ids acquisitions were requested for.
    acquisitions: Arc<RwLock<Vec<String>>>,
    /// If set, the next acquisition fails with this message.
    next_error: Arc<RwLock<Option<String>>>,
}

impl MockLicenseClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquisition_count(&self) -> usize {
        self.acquisitions.read().await.len()
    }

    pub async fn recorded_acquisitions(&self) -> Vec<String> {
        self.acquisitions.read().await.clone()
    }

    pub async fn set_next_error(&self, message: impl Into<String>) {
        *self.next_error.write().await = Some(message.into());
    }
}

#[async_trait]
impl LicenseClient for MockLicenseClient {
    async fn acquire(
        &self,
        odm: &OdmContent,
        target_directory: &Path,
        file_stem: &str,
    ) -> Result<License, ExternalError> {
        if let Some(message) = self.next_error.write().await.take() {
            return Err(ExternalError::new(message));
        }
        self.acquisitions.write().await.push(odm.media_id.clone());

        let path: PathBuf = target_directory.join(format!("{}.license", file_stem));
        Ok(License {
            client_id: "00000000-0000-0000-0000-000000000000".to_string(),
            contents: format!("<License><MediaID>{}</MediaID></License>", odm.media_id),
            path,
        })
    }
}
