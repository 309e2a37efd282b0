//! Typed configuration.
//!
//! Connection details come from environment variables and are loaded once
//! at startup, failing fast if required vars are missing. Tunables for the
//! event bus and the agents come from an optional TOML file; every field
//! has a default so an empty file is a valid configuration.

pub mod secrets;
pub mod settings;

pub use settings::{AgentConfig, BackendKind, EventBusConfig, Settings, WorkloadConfig};

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path of the TOML settings file, from `IDDS_CONFIG`.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings_path: std::env::var("IDDS_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// Load the settings file named by `IDDS_CONFIG`, or defaults.
    pub fn settings(&self) -> Result<Settings> {
        load_settings(self.settings_path.as_deref())
    }
}

/// Settings from `path`, or defaults when there is none. For processes
/// that need no database, such as the coordinator.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None => Ok(Settings::default()),
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
