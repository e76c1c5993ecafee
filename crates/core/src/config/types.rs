use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

/// Task store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("abd.db")
}

/// Admin HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Downloader worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloaderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Part downloads running at once per book (default: 1)
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,

    /// Bound on a single license or file transfer in seconds (default: 300)
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// User agent presented to the license server and CDN
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Client version reported during license acquisition
    #[serde(default = "default_omc_version")]
    pub omc_version: String,

    /// OS version reported during license acquisition
    #[serde(default = "default_os_version")]
    pub os_version: String,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_concurrency: default_file_concurrency(),
            download_timeout_secs: default_download_timeout(),
            user_agent: default_user_agent(),
            omc_version: default_omc_version(),
            os_version: default_os_version(),
            cleanup: CleanupConfig::default(),
        }
    }
}

/// What purging a book's tasks also removes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CleanupConfig {
    /// Delete the contents of the book's target directory (default: false)
    #[serde(default)]
    pub directory: bool,

    /// Remove the book's task rows (default: true)
    #[serde(default = "default_true")]
    pub db: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            directory: false,
            db: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_file_concurrency() -> usize {
    1
}

fn default_download_timeout() -> u64 {
    300
}

fn default_user_agent() -> String {
    "OverDrive Media Console".to_string()
}

fn default_omc_version() -> String {
    "1.2.0".to_string()
}

fn default_os_version() -> String {
    "10.11.6".to_string()
}

/// Encoder worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Remux jobs running at once per book (default: 2)
    #[serde(default = "default_remux_concurrency")]
    pub remux_concurrency: usize,

    /// Bound on a single ffmpeg invocation in seconds (default: 3600)
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,

    /// Path to ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// ffmpeg log level (quiet, error, warning, info...)
    #[serde(default = "default_ffmpeg_log_level")]
    pub ffmpeg_log_level: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remux_concurrency: default_remux_concurrency(),
            transcode_timeout_secs: default_transcode_timeout(),
            ffmpeg_path: default_ffmpeg_path(),
            ffmpeg_log_level: default_ffmpeg_log_level(),
        }
    }
}

fn default_remux_concurrency() -> usize {
    2
}

fn default_transcode_timeout() -> u64 {
    3600
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffmpeg_log_level() -> String {
    "error".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.admin.port, 8080);
        assert_eq!(config.store.path, PathBuf::from("abd.db"));
        assert_eq!(config.downloader.file_concurrency, 1);
        assert_eq!(config.encoder.remux_concurrency, 2);
        assert!(config.downloader.enabled);
        assert!(config.encoder.enabled);
        assert_eq!(config.downloader.cleanup, CleanupConfig::default());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let toml = r#"
[downloader]
file_concurrency = 5

[encoder]
enabled = false
ffmpeg_path = "/usr/local/bin/ffmpeg"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.downloader.file_concurrency, 5);
        assert_eq!(config.downloader.download_timeout_secs, 300);
        assert!(!config.encoder.enabled);
        assert_eq!(config.encoder.ffmpeg_path, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.encoder.ffmpeg_log_level, "error");
    }

    #[test]
    fn test_deserialize_cleanup_section() {
        let toml = r#"
[downloader.cleanup]
directory = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.downloader.cleanup.directory);
        assert!(config.downloader.cleanup.db);
        assert!(config.downloader.enabled);
    }

    #[test]
    fn test_deserialize_custom_admin() {
        let toml = r#"
[admin]
host = "127.0.0.1"
port = 9000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.admin.host.to_string(), "127.0.0.1");
        assert_eq!(config.admin.port, 9000);
    }
}
