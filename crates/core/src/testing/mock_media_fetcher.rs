//! Mock media fetcher for testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collaborators::{
    image_file_name, part_file_name, ImageKind, License, MediaFetcher, OdmContent, Part,
};
use crate::dispatch::ExternalError;

/// A recorded download for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedFetch {
    Part { number: u32, path: PathBuf },
    Image { kind: ImageKind, path: PathBuf },
}

/// Mock implementation of [`MediaFetcher`].
///
/// Returns the paths the real fetcher would write without writing them.
/// Individual parts can be made to fail, and a per-download delay makes
/// concurrency observable through [`MockMediaFetcher::max_concurrent`].
#[derive(Debug, Default)]
pub struct MockMediaFetcher {
    fetches: Arc<RwLock<Vec<RecordedFetch>>>,
    /// Part number -> error message.
    failing_parts: Arc<RwLock<HashMap<u32, String>>>,
    delay_ms: Arc<RwLock<u64>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_fetches(&self) -> Vec<RecordedFetch> {
        self.fetches.read().await.clone()
    }

    pub async fn part_count(&self) -> usize {
        self.fetches
            .read()
            .await
            .iter()
            .filter(|f| matches!(f, RecordedFetch::Part { .. }))
            .count()
    }

    /// Make every download of `number` fail until [`Self::heal_part`].
    pub async fn fail_part(&self, number: u32, message: impl Into<String>) {
        self.failing_parts
            .write()
            .await
            .insert(number, message.into());
    }

    pub async fn heal_part(&self, number: u32) {
        self.failing_parts.write().await.remove(&number);
    }

    pub async fn set_delay_ms(&self, delay_ms: u64) {
        *self.delay_ms.write().await = delay_ms;
    }

    /// Highest number of part downloads observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay_ms.read().await;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaFetcher for MockMediaFetcher {
    async fn fetch_part(
        &self,
        odm: &OdmContent,
        _license: &License,
        part: &Part,
        width: usize,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError> {
        self.simulate().await;
        if let Some(message) = self.failing_parts.read().await.get(&part.number) {
            return Err(ExternalError::new(message.clone()));
        }

        let path = target_directory.join(part_file_name(&odm.metadata.title, part.number, width));
        self.fetches.write().await.push(RecordedFetch::Part {
            number: part.number,
            path: path.clone(),
        });
        Ok(path)
    }

    async fn fetch_image(
        &self,
        url: &str,
        kind: ImageKind,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError> {
        let path = target_directory.join(image_file_name(url, kind));
        self.fetches.write().await.push(RecordedFetch::Image {
            kind,
            path: path.clone(),
        });
        Ok(path)
    }
}
