//! Centralized configuration for the LoM engine.
//!
//! Compile-time limits live in the unit structs below. Runtime settings
//! (per-action config and engine globals) are loaded from JSON files by
//! [`ConfigStore`], which can be reloaded while the engine runs.

use crate::collab::{ActionConfig, ActionConfigSource, GlobalConfigSource};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport and listener limits.
pub struct TransportConfig;

impl TransportConfig {
    /// Well-known port of the length-prefixed binding.
    pub const BINARY_PORT: u16 = 3669;
    /// Well-known port of the line-delimited JSON-RPC binding.
    pub const JSONRPC_PORT: u16 = 3670;
    pub const INBOUND_QUEUE_CAPACITY: usize = 256;
    pub const MAX_MESSAGE_SIZE: usize = 1_048_576; // 1MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Per-client mailbox limits.
pub struct MailboxConfig;

impl MailboxConfig {
    pub const PULL_QUEUE_CAPACITY: usize = 64;
    pub const PUSH_QUEUE_CAPACITY: usize = 16;
    /// Wake interval when no timed pull is pending.
    pub const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(3600);
    /// Longer pull timeouts are cut down to this.
    pub const MAX_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 3600);
}

/// Heartbeat aggregation settings.
pub struct HeartbeatConfig;

impl HeartbeatConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 3600);
    pub const QUEUE_CAPACITY: usize = 256;
}

/// Engine main-loop settings.
pub struct EngineConfig;

impl EngineConfig {
    pub const SEQUENCE_TIMEOUT_TICK: Duration = Duration::from_secs(1);
    pub const ACTIONS_CONFIG_FILE: &'static str = "actions.conf.json";
    pub const GLOBALS_CONFIG_FILE: &'static str = "globals.conf.json";
}

/// Engine-wide settings from `globals.conf.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    HeartbeatConfig::DEFAULT_INTERVAL.as_secs()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Default)]
struct Loaded {
    actions: HashMap<String, ActionConfig>,
    globals: GlobalSettings,
}

/// File-backed action and global configuration.
///
/// Reads are cheap clones under a read lock; [`ConfigStore::reload`] swaps
/// in freshly parsed files atomically.
#[derive(Debug)]
pub struct ConfigStore {
    config_dir: Option<PathBuf>,
    loaded: RwLock<Loaded>,
}

impl ConfigStore {
    /// Load configuration from a directory.
    ///
    /// `actions.conf.json` is required; `globals.conf.json` is optional.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            config_dir: Some(config_dir.as_ref().to_path_buf()),
            loaded: RwLock::new(Loaded::default()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Build an in-memory store, mostly for tests.
    pub fn from_parts(actions: HashMap<String, ActionConfig>, globals: GlobalSettings) -> Self {
        Self {
            config_dir: None,
            loaded: RwLock::new(Loaded { actions, globals }),
        }
    }

    /// Re-read both files from disk. Returns the number of configured actions.
    ///
    /// On error the previous configuration stays in effect.
    pub fn reload(&self) -> Result<usize> {
        let Some(dir) = &self.config_dir else {
            return Ok(self.read().actions.len());
        };

        let actions: HashMap<String, ActionConfig> =
            Self::read_json(&dir.join(EngineConfig::ACTIONS_CONFIG_FILE))?;

        let globals_path = dir.join(EngineConfig::GLOBALS_CONFIG_FILE);
        let globals = if globals_path.exists() {
            Self::read_json(&globals_path)?
        } else {
            debug!("No {} found, using defaults", globals_path.display());
            GlobalSettings::default()
        };

        for (name, cfg) in &actions {
            if cfg.disabled {
                debug!("Action {} is disabled in config", name);
            }
        }

        let count = actions.len();
        let mut loaded = self
            .loaded
            .write()
            .map_err(|e| EngineError::Internal {
                message: format!("Failed to acquire config lock: {}", e),
            })?;
        *loaded = Loaded { actions, globals };

        info!("Loaded config for {} actions from {}", count, dir.display());
        Ok(count)
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| EngineError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Loaded> {
        // A poisoned lock still holds the last good config.
        self.loaded.read().unwrap_or_else(|poisoned| {
            warn!("Config lock poisoned, using last loaded config");
            poisoned.into_inner()
        })
    }

    pub fn globals(&self) -> GlobalSettings {
        self.read().globals.clone()
    }
}

impl ActionConfigSource for ConfigStore {
    fn action_config(&self, action: &str) -> Option<ActionConfig> {
        self.read().actions.get(action).cloned()
    }
}

impl GlobalConfigSource for ConfigStore {
    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.read().globals.heartbeat_interval_secs)
    }
}
