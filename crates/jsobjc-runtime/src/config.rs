//! Runtime configuration
//!
//! Loaded from JSON. Every field has a default, so `{}` is a complete
//! configuration.
//!
//! ```json
//! {
//!   "bridge": { "strict_integers": true },
//!   "log": { "level": "debug", "ansi": false },
//!   "worker_stack_size": 4194304,
//!   "timer_resolution_ms": 1
//! }
//! ```

use std::path::Path;

use jsobjc_engine::BridgeOptions;
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Logging options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    /// Colored output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

/// Options for one isolate and the workers it spawns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Marshalling options of the isolate's bridge
    pub bridge: BridgeOptions,
    /// Logging options
    pub log: LogConfig,
    /// Stack size of worker threads in bytes
    pub worker_stack_size: usize,
    /// Smallest interval a repeating timer can have
    pub timer_resolution_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeOptions::default(),
            log: LogConfig::default(),
            worker_stack_size: 2 * 1024 * 1024,
            timer_resolution_ms: 1,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> RuntimeResult<()> {
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(RuntimeError::Config(format!(
                "unknown log level \"{}\"",
                self.log.level
            )));
        }
        if self.worker_stack_size < 64 * 1024 {
            return Err(RuntimeError::Config(format!(
                "worker_stack_size {} is below the 65536 byte minimum",
                self.worker_stack_size
            )));
        }
        if self.timer_resolution_ms == 0 {
            return Err(RuntimeError::Config("timer_resolution_ms must be at least 1".to_string()));
        }
        Ok(())
    }
}
