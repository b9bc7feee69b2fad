//! Application configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then CLI arguments and their environment fallbacks on top.

mod conf_serde;

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::{
    cli::Cli,
    conf::conf_serde::{duration, level},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file path does not point at a regular file.
    #[error("config file {path} does not exist or is not a regular file")]
    InvalidConfigPath { path: PathBuf },

    /// A duration setting that must be positive was configured as zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// Failed to extract the merged configuration.
    #[error("failed to load configuration: {0}")]
    Extraction(#[from] figment::Error),
}

/// Listener settings for the query and live-update interfaces.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConf {
    /// The network address the API server will listen on.
    pub listen_address: String,
    /// The port the API server will listen on.
    pub port: u16,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self {
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Path to the Unix stream socket the capture layer writes event
    /// records to. Connecting to it fails fatally at startup.
    pub capture_socket: PathBuf,

    /// Path of the loaded configuration file, kept for diagnostics.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// The logging level for the application.
    #[serde(with = "level")]
    pub log_level: Level,

    /// Configuration for the API server (pull queries and WebSocket).
    #[serde(default)]
    pub api: ApiConf,

    /// Capacity of the bounded queue between the capture stream reader and
    /// the aggregation worker. A full queue blocks the reader.
    #[serde(default = "defaults::event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Capacity of the bounded queue between the aggregation worker and the
    /// broadcast hub. A full queue blocks the aggregator.
    #[serde(default = "defaults::broadcast_channel_capacity")]
    pub broadcast_channel_capacity: usize,

    /// Width of the packet rate window; one timeseries update is emitted
    /// per window.
    #[serde(default = "defaults::rate_window", with = "duration")]
    pub rate_window: Duration,

    /// Deadline for a single subscriber write. Exceeding it removes the
    /// subscriber, exactly like a write failure.
    #[serde(default = "defaults::subscriber_write_timeout", with = "duration")]
    pub subscriber_write_timeout: Duration,

    /// Maximum time to wait for workers to drain on shutdown.
    #[serde(default = "defaults::shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,
}

mod defaults {
    use std::time::Duration;

    pub fn event_channel_capacity() -> usize {
        1024
    }

    pub fn broadcast_channel_capacity() -> usize {
        1024
    }

    pub fn rate_window() -> Duration {
        Duration::from_secs(1)
    }

    pub fn subscriber_write_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            capture_socket: PathBuf::from("/run/pktviz/capture.sock"),
            config_path: None,
            log_level: Level::INFO,
            api: ApiConf::default(),
            event_channel_capacity: defaults::event_channel_capacity(),
            broadcast_channel_capacity: defaults::broadcast_channel_capacity(),
            rate_window: defaults::rate_window(),
            subscriber_write_timeout: defaults::subscriber_write_timeout(),
            shutdown_timeout: defaults::shutdown_timeout(),
        }
    }
}

impl Conf {
    /// Builds the configuration by merging defaults, the optional YAML file
    /// named by the CLI, and the CLI arguments themselves.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = config_path_to_store;
        conf.validate()?;
        Ok((conf, cli))
    }

    /// The rate window drives a periodic timer and a rate division, and the
    /// write timeout bounds every subscriber write; neither works at zero.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_window.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "rate_window",
            });
        }
        if self.subscriber_write_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "subscriber_write_timeout",
            });
        }
        Ok(())
    }
}

fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::InvalidConfigPath {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
