//! FFmpeg-based transcoder: stream-copy remux and metadata tagging.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use super::traits::Transcoder;
use super::types::{AudioMetadata, Part};
use crate::config::EncoderConfig;
use crate::dispatch::ExternalError;
use crate::metrics;

/// FFmpeg-based transcoder.
///
/// Both operations rewrite a file in place: the original is moved to
/// `<file>.part`, ffmpeg writes the original path, and the `.part` file is
/// removed once the output exists.
pub struct FfmpegTranscoder {
    config: EncoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// Creates a transcoder with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EncoderConfig::default())
    }

    fn base_args(&self, input: &Path) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-nostdin".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            self.config.ffmpeg_log_level.clone().into(),
            "-i".into(),
            input.as_os_str().to_os_string(),
        ]
    }

    /// Arguments for a tag-stripping stream copy.
    fn build_remux_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = self.base_args(input);
        args.extend(
            ["-map_metadata", "-1", "-c:a", "copy", "-c:v", "copy"]
                .into_iter()
                .map(OsString::from),
        );
        args.push(output.as_os_str().to_os_string());
        args
    }

    /// Arguments for writing book tags onto one part.
    fn build_metadata_args(
        &self,
        input: &Path,
        output: &Path,
        metadata: &AudioMetadata,
        part: &Part,
        total_parts: usize,
    ) -> Vec<OsString> {
        let mut args = self.base_args(input);
        args.extend(["-map", "0", "-c", "copy", "-id3v2_version", "3"].map(OsString::from));
        for (key, value) in metadata_tags(metadata, part, total_parts) {
            args.push("-metadata".into());
            args.push(format!("{}={}", key, value).into());
        }
        args.push(output.as_os_str().to_os_string());
        args
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<(), ExternalError> {
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExternalError::with_source(
                        format!("ffmpeg not found at {}", self.config.ffmpeg_path.display()),
                        e,
                    )
                } else {
                    ExternalError::with_source("failed to start ffmpeg", e)
                }
            })?;

        let mut stderr = child.stderr.take();
        let timeout_duration = Duration::from_secs(self.config.transcode_timeout_secs);
        let result = timeout(timeout_duration, async {
            let mut error_output = String::new();
            if let Some(stderr) = stderr.as_mut() {
                stderr.read_to_string(&mut error_output).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, error_output))
        })
        .await;

        match result {
            Ok(Ok((status, error_output))) if status.success() => {
                if !error_output.trim().is_empty() {
                    debug!("ffmpeg: {}", error_output.trim());
                }
                Ok(())
            }
            Ok(Ok((status, error_output))) => Err(ExternalError::new(format!(
                "ffmpeg exited with code {:?}: {}",
                status.code(),
                error_output.trim()
            ))),
            Ok(Err(e)) => Err(ExternalError::with_source("ffmpeg I/O failed", e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(ExternalError::new(format!(
                    "ffmpeg timed out after {}s",
                    self.config.transcode_timeout_secs
                )))
            }
        }
    }

    /// Moves `path` aside, lets ffmpeg write `path` from it, then drops the
    /// moved file. A leftover `.part` from an earlier crash is used as input.
    async fn rewrite_in_place<F>(
        &self,
        operation: &str,
        path: &Path,
        build_args: F,
    ) -> Result<PathBuf, ExternalError>
    where
        F: FnOnce(&Path, &Path) -> Vec<OsString>,
    {
        let input = part_path(path);
        let started = Instant::now();

        let result = async {
            if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
                tokio::fs::rename(path, &input).await.map_err(|e| {
                    ExternalError::with_source(format!("failed to move {}", path.display()), e)
                })?;
            }

            self.run_ffmpeg(build_args(&input, path)).await?;

            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(ExternalError::new(format!(
                    "ffmpeg did not produce {}",
                    path.display()
                )));
            }
            tokio::fs::remove_file(&input).await.map_err(|e| {
                ExternalError::with_source(format!("failed to remove {}", input.display()), e)
            })?;
            Ok::<_, ExternalError>(path.to_path_buf())
        }
        .await;

        metrics::observe_external(
            "ffmpeg",
            operation,
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        result
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// ID3 tags written for a part, in a stable order.
fn metadata_tags(metadata: &AudioMetadata, part: &Part, total_parts: usize) -> Vec<(&'static str, String)> {
    let mut tags = vec![
        ("album", metadata.title.clone()),
        ("title", format!("{} - Part {}", metadata.title, part.number)),
        ("track", format!("{}/{}", part.number, total_parts)),
    ];
    if !metadata.authors.is_empty() {
        let authors = metadata.authors.join(", ");
        tags.push(("artist", authors.clone()));
        tags.push(("album_artist", authors));
    }
    if !metadata.narrators.is_empty() {
        tags.push(("composer", metadata.narrators.join(", ")));
    }
    if let Some(publisher) = &metadata.publisher {
        tags.push(("publisher", publisher.clone()));
    }
    if !metadata.genres.is_empty() {
        tags.push(("genre", metadata.genres.join(", ")));
    }
    if !metadata.languages.is_empty() {
        tags.push(("language", metadata.languages.join(", ")));
    }
    if let Some(description) = &metadata.description {
        tags.push(("comment", description.clone()));
    }
    if let Some(subtitle) = &metadata.subtitle {
        tags.push(("subtitle", subtitle.clone()));
    }
    if let Some(series) = metadata.series.first() {
        tags.push(("grouping", series.clone()));
    }
    tags
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn remux(&self, path: &Path) -> Result<PathBuf, ExternalError> {
        info!("Remuxing {}", path.display());
        self.rewrite_in_place("remux", path, |input, output| {
            self.build_remux_args(input, output)
        })
        .await
    }

    async fn embed_metadata(
        &self,
        path: &Path,
        metadata: &AudioMetadata,
        part: &Part,
        total_parts: usize,
    ) -> Result<(), ExternalError> {
        info!("Tagging {}", path.display());
        self.rewrite_in_place("embed_metadata", path, |input, output| {
            self.build_metadata_args(input, output, metadata, part, total_parts)
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    fn part() -> Part {
        Part {
            number: 3,
            name: "Part 3".to_string(),
            filename: "x.mp3".to_string(),
            filesize: 10,
            duration: "10:00".to_string(),
        }
    }

    #[test]
    fn test_build_remux_args() {
        let transcoder = FfmpegTranscoder::with_defaults();
        let args = strings(&transcoder.build_remux_args(
            Path::new("/books/a.mp3.part"),
            Path::new("/books/a.mp3"),
        ));

        assert_eq!(&args[..5], &["-y", "-nostdin", "-hide_banner", "-loglevel", "error"]);
        assert!(args.windows(2).any(|w| w == ["-i", "/books/a.mp3.part"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert_eq!(args.last().unwrap(), "/books/a.mp3");
    }

    #[test]
    fn test_build_metadata_args() {
        let transcoder = FfmpegTranscoder::with_defaults();
        let metadata = AudioMetadata {
            title: "Dune".to_string(),
            authors: vec!["Frank Herbert".to_string()],
            narrators: vec!["Scott Brick".to_string(), "Orlagh Cassidy".to_string()],
            ..Default::default()
        };
        let args = strings(&transcoder.build_metadata_args(
            Path::new("in.part"),
            Path::new("out.mp3"),
            &metadata,
            &part(),
            9,
        ));

        assert!(args.windows(2).any(|w| w == ["-metadata", "album=Dune"]));
        assert!(args.windows(2).any(|w| w == ["-metadata", "track=3/9"]));
        assert!(args.windows(2).any(|w| w == ["-metadata", "artist=Frank Herbert"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-metadata", "composer=Scott Brick, Orlagh Cassidy"]));
        assert!(!args.iter().any(|a| a.starts_with("publisher=")));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let transcoder = FfmpegTranscoder::new(EncoderConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ..EncoderConfig::default()
        });
        let err = transcoder.remux(&file).await.unwrap_err();
        assert!(err.message.contains("/nonexistent/ffmpeg"));
        // The original was moved aside and is kept for the next attempt.
        assert!(dir.path().join("a.mp3.part").exists());
    }
}
