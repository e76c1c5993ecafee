//! HTTP collaborators: license acquisition and content download.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{RANGE, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use sha1::{Digest, Sha1};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::traits::{LicenseClient, MediaFetcher};
use super::types::{image_file_name, part_file_name, ImageKind, License, OdmContent, Part};
use crate::config::DownloaderConfig;
use crate::dispatch::ExternalError;
use crate::metrics;

/// Salt appended to the license hash input.
const LICENSE_HASH_SALT: &str = "ELOSNOC*AIDEM*EVIRDREVO";

fn build_client(config: &DownloaderConfig) -> Result<Client, ExternalError> {
    Client::builder()
        .timeout(Duration::from_secs(config.download_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| ExternalError::with_source("failed to build HTTP client", e))
}

/// Computes the acquisition hash: base64(sha1(utf16le("id|omc|os|salt"))).
pub fn license_hash(client_id: &str, omc_version: &str, os_version: &str) -> String {
    let raw = format!(
        "{}|{}|{}|{}",
        client_id, omc_version, os_version, LICENSE_HASH_SALT
    );
    let utf16le: Vec<u8> = raw.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
    let digest = Sha1::digest(&utf16le);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Pulls `<ClientID>` out of a saved license document.
fn license_client_id(contents: &str) -> Option<String> {
    let start = contents.find("<ClientID>")? + "<ClientID>".len();
    let end = start + contents[start..].find("</ClientID>")?;
    Some(contents[start..end].trim().to_string())
}

/// License client talking to the ODM acquisition endpoint.
pub struct HttpLicenseClient {
    client: Client,
    omc_version: String,
    os_version: String,
}

impl HttpLicenseClient {
    pub fn new(config: &DownloaderConfig) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(config)?,
            omc_version: config.omc_version.clone(),
            os_version: config.os_version.clone(),
        })
    }

    async fn request_license(&self, odm: &OdmContent, client_id: &str) -> Result<String, ExternalError> {
        let hash = license_hash(client_id, &self.omc_version, &self.os_version);
        let response = self
            .client
            .get(&odm.acquisition_url)
            .query(&[
                ("MediaID", odm.media_id.as_str()),
                ("ClientID", client_id),
                ("OMC", self.omc_version.as_str()),
                ("OS", self.os_version.as_str()),
                ("Hash", hash.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ExternalError::with_source("license request failed", e))?;

        if !response.status().is_success() {
            return Err(ExternalError::new(format!(
                "license server returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ExternalError::with_source("failed to read license", e))
    }
}

#[async_trait]
impl LicenseClient for HttpLicenseClient {
    async fn acquire(
        &self,
        odm: &OdmContent,
        target_directory: &Path,
        file_stem: &str,
    ) -> Result<License, ExternalError> {
        let path = target_directory.join(format!("{}.license", file_stem));

        if fs::try_exists(&path).await.unwrap_or(false) {
            let contents = fs::read_to_string(&path)
                .await
                .map_err(|e| ExternalError::with_source("failed to read saved license", e))?;
            debug!("Reusing license at {}", path.display());
            return Ok(License {
                client_id: license_client_id(&contents).unwrap_or_default(),
                contents,
                path,
            });
        }

        let client_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        info!("Acquiring license for media {}", odm.media_id);

        let started = Instant::now();
        let result = self.request_license(odm, &client_id).await;
        metrics::observe_external(
            "license",
            "acquire",
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        let contents = result?;

        fs::create_dir_all(target_directory)
            .await
            .map_err(|e| ExternalError::with_source("failed to create target directory", e))?;
        fs::write(&path, &contents)
            .await
            .map_err(|e| ExternalError::with_source("failed to save license", e))?;

        Ok(License {
            client_id: license_client_id(&contents).unwrap_or(client_id),
            contents,
            path,
        })
    }
}

/// Downloads parts and artwork over HTTP into `.part` files, renaming on
/// completion.
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(config: &DownloaderConfig) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    async fn download(
        &self,
        request: RequestBuilder,
        partial: &Path,
        destination: &Path,
        resume_from: u64,
    ) -> Result<PathBuf, ExternalError> {
        let request = if resume_from > 0 {
            request.header(RANGE, format!("bytes={}-", resume_from))
        } else {
            request
        };

        let mut response = request
            .send()
            .await
            .map_err(|e| ExternalError::with_source("download request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExternalError::new(format!(
                "download of {} returned {}",
                destination.display(),
                status
            )));
        }

        // A server ignoring the range sends the whole file again.
        let append = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(partial)
            .await
            .map_err(|e| ExternalError::with_source("failed to open download file", e))?;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ExternalError::with_source("download interrupted", e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| ExternalError::with_source("failed to write download", e))?;
        }
        file.flush()
            .await
            .map_err(|e| ExternalError::with_source("failed to flush download", e))?;
        drop(file);

        fs::rename(partial, destination)
            .await
            .map_err(|e| ExternalError::with_source("failed to finalize download", e))?;
        Ok(destination.to_path_buf())
    }

    async fn timed(
        &self,
        operation: &str,
        request: RequestBuilder,
        partial: &Path,
        destination: &Path,
        resume_from: u64,
    ) -> Result<PathBuf, ExternalError> {
        let started = Instant::now();
        let result = self
            .download(request, partial, destination, resume_from)
            .await;
        metrics::observe_external(
            "cdn",
            operation,
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        result
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch_part(
        &self,
        odm: &OdmContent,
        license: &License,
        part: &Part,
        width: usize,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError> {
        let name = part_file_name(&odm.metadata.title, part.number, width);
        let destination = target_directory.join(&name);
        if fs::try_exists(&destination).await.unwrap_or(false) {
            debug!("Part {} already downloaded", name);
            return Ok(destination);
        }

        fs::create_dir_all(target_directory)
            .await
            .map_err(|e| ExternalError::with_source("failed to create target directory", e))?;

        let partial = partial_path(&destination);
        let existing = fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);
        if existing > 0 && existing == part.filesize {
            fs::rename(&partial, &destination)
                .await
                .map_err(|e| ExternalError::with_source("failed to finalize download", e))?;
            info!("Part {} was fully downloaded already", name);
            return Ok(destination);
        }

        let url = format!("{}/{}", odm.base_url.trim_end_matches('/'), part.filename);
        info!("Downloading part {} of {}", part.number, odm.metadata.title);
        let request = self
            .client
            .get(&url)
            .header("ClientID", license.client_id.as_str())
            .header("License", license.contents.replace(['\r', '\n'], ""));

        self.timed("fetch_part", request, &partial, &destination, existing)
            .await
    }

    async fn fetch_image(
        &self,
        url: &str,
        kind: ImageKind,
        target_directory: &Path,
    ) -> Result<PathBuf, ExternalError> {
        let destination = target_directory.join(image_file_name(url, kind));
        if fs::try_exists(&destination).await.unwrap_or(false) {
            return Ok(destination);
        }

        fs::create_dir_all(target_directory)
            .await
            .map_err(|e| ExternalError::with_source("failed to create target directory", e))?;

        let partial = partial_path(&destination);
        let _ = fs::remove_file(&partial).await;

        info!("Downloading {} image", kind.as_str());
        self.timed("fetch_image", self.client.get(url), &partial, &destination, 0)
            .await
    }
}
