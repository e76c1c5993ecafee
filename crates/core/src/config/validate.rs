use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Admin port is not 0
/// - Concurrency limits are at least 1
/// - Collaborator timeouts are at least 1 second
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.admin.port == 0 {
        return Err(ConfigError::ValidationError(
            "admin.port cannot be 0".to_string(),
        ));
    }

    if config.downloader.file_concurrency == 0 {
        return Err(ConfigError::ValidationError(
            "downloader.file_concurrency must be at least 1".to_string(),
        ));
    }

    if config.encoder.remux_concurrency == 0 {
        return Err(ConfigError::ValidationError(
            "encoder.remux_concurrency must be at least 1".to_string(),
        ));
    }

    if config.downloader.download_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "downloader.download_timeout_secs must be at least 1".to_string(),
        ));
    }

    if config.encoder.transcode_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "encoder.transcode_timeout_secs must be at least 1".to_string(),
        ));
    }

    Ok(())
}
