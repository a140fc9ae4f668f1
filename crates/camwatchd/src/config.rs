//! Worker configuration: defaults, TOML file, environment overlay.
//!
//! Load order (later wins):
//! 1. Built-in defaults
//! 2. `--config PATH`, else `./camwatch.toml` if it exists
//! 3. Environment: `BACKEND_URL`, `MEDIAMTX_URL`, `WORKER_PORT`, `MAX_STREAMS`,
//!    `STORAGE_PATH`, `DETECTOR_URL`, `FFMPEG_PATH`
//!
//! Durations are whole seconds in the file (`*_secs`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::publisher::{PublisherConfig, DEFAULT_PUBLISH_PORT};
use crate::registry::{RegistryConfig, DEFAULT_OPEN_ATTEMPTS, DEFAULT_OPEN_BACKOFF};

/// Config file looked up in the working directory when no path is given.
pub const LOCAL_CONFIG_FILE: &str = "camwatch.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the effective values came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    pub env_overrides: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend receiving alerts (`{backend_url}/api/alerts`)
    pub backend_url: String,
    /// Media server; its host receives the republished streams
    pub media_server_url: String,
    pub bind_address: String,
    pub port: u16,
    pub max_streams: usize,
    /// Snapshot directory, also served under `/snapshots`
    pub storage_path: PathBuf,
    pub detector_url: String,
    pub ffmpeg_path: PathBuf,

    pub frame_width: u32,
    pub frame_height: u32,

    pub publish_enabled: bool,
    pub publish_fps: u32,
    pub publish_port: u16,
    pub publisher_stop_grace_secs: u64,

    pub alert_timeout_secs: u64,
    pub alert_throttle_secs: u64,
    pub detector_timeout_secs: u64,
    pub capture_read_timeout_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:3000".to_string(),
            media_server_url: "http://localhost:8888".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_streams: 4,
            storage_path: PathBuf::from("./snapshots"),
            detector_url: "http://localhost:9000/detect".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            frame_width: 640,
            frame_height: 480,
            publish_enabled: true,
            publish_fps: 25,
            publish_port: DEFAULT_PUBLISH_PORT,
            publisher_stop_grace_secs: 5,
            alert_timeout_secs: 30,
            alert_throttle_secs: 5,
            detector_timeout_secs: 5,
            capture_read_timeout_secs: 10,
            snapshot_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Loads defaults, the config file and the process environment, then
    /// validates the result.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` if `path` is given but cannot be read
    /// - `ConfigError::Parse` if the file is not valid TOML for `Config`
    /// - `ConfigError::InvalidEnv` if a numeric variable does not parse
    /// - `ConfigError::Invalid` if validation fails
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();

        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(LOCAL_CONFIG_FILE)).filter(|p| p.exists()),
        };

        let mut config = match &file {
            Some(file) => Self::from_file(file)?,
            None => Self::default(),
        };
        sources.file = file;

        config.apply_env(|var| std::env::var(var).ok(), &mut sources)?;
        config.validate()?;

        Ok((config, sources))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F, sources: &mut ConfigSources) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKEND_URL") {
            self.backend_url = v;
            sources.env_overrides.push("BACKEND_URL".to_string());
        }
        if let Some(v) = lookup("MEDIAMTX_URL") {
            self.media_server_url = v;
            sources.env_overrides.push("MEDIAMTX_URL".to_string());
        }
        if let Some(v) = lookup("WORKER_PORT") {
            self.port = parse_env("WORKER_PORT", &v)?;
            sources.env_overrides.push("WORKER_PORT".to_string());
        }
        if let Some(v) = lookup("MAX_STREAMS") {
            self.max_streams = parse_env("MAX_STREAMS", &v)?;
            sources.env_overrides.push("MAX_STREAMS".to_string());
        }
        if let Some(v) = lookup("STORAGE_PATH") {
            self.storage_path = PathBuf::from(v);
            sources.env_overrides.push("STORAGE_PATH".to_string());
        }
        if let Some(v) = lookup("DETECTOR_URL") {
            self.detector_url = v;
            sources.env_overrides.push("DETECTOR_URL".to_string());
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.ffmpeg_path = PathBuf::from(v);
            sources.env_overrides.push("FFMPEG_PATH".to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_streams == 0 {
            return Err(ConfigError::Invalid("max_streams must be at least 1".to_string()));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size must be non-zero, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if self.publish_fps == 0 {
            return Err(ConfigError::Invalid("publish_fps must be at least 1".to_string()));
        }
        for (name, value) in [
            ("backend_url", &self.backend_url),
            ("media_server_url", &self.media_server_url),
            ("detector_url", &self.detector_url),
        ] {
            Url::parse(value)
                .map_err(|e| ConfigError::Invalid(format!("{name} {value:?}: {e}")))?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_streams: self.max_streams,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_backoff: DEFAULT_OPEN_BACKOFF,
            publisher: self.publish_enabled.then(|| self.publisher_config()),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            ffmpeg_path: self.ffmpeg_path.clone(),
            media_server_url: self.media_server_url.clone(),
            publish_port: self.publish_port,
            width: self.frame_width,
            height: self.frame_height,
            fps: self.publish_fps,
            stop_grace: Duration::from_secs(self.publisher_stop_grace_secs),
        }
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_timeout_secs)
    }

    pub fn alert_throttle(&self) -> Duration {
        Duration::from_secs(self.alert_throttle_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout_secs)
    }

    pub fn capture_read_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_read_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
