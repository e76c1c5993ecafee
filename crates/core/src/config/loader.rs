use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Prefix of environment overrides. Nested keys split on `__`, so
/// `ABD_DOWNLOADER__CLEANUP__DIRECTORY=true` sets `downloader.cleanup.directory`.
const ENV_PREFIX: &str = "ABD_";

/// Read the worker configuration from `path`, then apply `ABD_*` overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    extract(Figment::new().merge(Toml::file(path)))
}

/// Parse a TOML document without environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn extract(figment: Figment) -> Result<Config, ConfigError> {
    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}
