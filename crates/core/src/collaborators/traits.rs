use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::types::{AudioMetadata, ImageKind, License, OdmContent, Part};
use crate::dispatch::ExternalError;

/// Acquires the license for an ODM order.
#[async_trait]
pub trait LicenseClient: Send + Sync {
    /// Acquire (or reuse a previously saved) license into `target_directory`.
    async fn acquire(
        &self,
        odm: &OdmContent,
        target_directory: &Path,
        file_stem: &str,
    ) -> Result<License, ExternalError>;
}

/// Downloads book content.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download one audio part, resuming a partial download when possible.
    /// Returns the final file path.
    async fn fetch_part(
        &self,
        odm: &OdmContent,
        license: &License,
        part: &Part,
        width: usize,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError>;

    /// Download cover or thumbnail artwork.
    async fn fetch_image(
        &self,
        url: &str,
        kind: ImageKind,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError>;
}

/// Rewrites audio files in place.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Strip container-level tags by stream-copying the file.
    async fn remux(&self, path: &Path) -> Result<PathBuf, ExternalError>;

    /// Write book metadata and the part's track number.
    async fn embed_metadata(
        &self,
        path: &Path,
        metadata: &AudioMetadata,
        part: &Part,
        total_parts: usize,
    ) -> Result<(), ExternalError>;
}
