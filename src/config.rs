//! Declarative engine configuration, loadable from a TOML file.
//!
//! Every field has a default matching the constant the engine uses when no
//! configuration is supplied, so a partial file (or none at all) is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::CHUNK;
use crate::error::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reactor: ReactorConfig,
    pub stream: StreamConfig,
    pub mesh: MeshConfig,
}

/// Reactor worker behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Run the worker in polling mode (non-blocking drain plus an `on_idle`
    /// tick) instead of blocking until work arrives.
    pub polling: bool,
}

/// Stream transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Initial receive buffer capacity; the buffer doubles whenever a read
    /// fills it.
    pub chunk: usize,
    /// Disable Nagle's algorithm on accepted and connected sockets.
    pub nodelay: bool,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            chunk: CHUNK,
            nodelay: true,
        }
    }
}

/// Message-passing socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Default survey deadline for surveyor sockets; responses arriving
    /// after it are dropped.
    #[serde(with = "humantime_serde")]
    pub survey_deadline: Duration,
}

impl Default for MeshConfig {
    fn default() -> MeshConfig {
        MeshConfig {
            survey_deadline: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig, Error> {
        let contents = std::fs::read_to_string(&path)?;
        toml::from_str(&contents)
            .map_err(|err| Error::Config(format!("{}: {}", path.as_ref().display(), err)))
    }
}
