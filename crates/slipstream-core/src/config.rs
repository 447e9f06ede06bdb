//! Configuration for the share and upload subsystems
//!
//! TOML configuration with sensible defaults; a missing or unreadable file
//! falls back to defaults with a warning. Loaded from:
//! - macOS: ~/Library/Application Support/slipstream/config.toml
//! - Linux: ~/.config/slipstream/config.toml
//! - Windows: %APPDATA%/slipstream/config.toml

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Share index and refresh settings
    pub share: ShareConfig,
    /// Hasher pool settings
    pub hashing: HashingConfig,
    /// Upload slot policy settings
    pub uploads: UploadConfig,
    /// Filesystem monitoring settings
    pub monitoring: MonitoringConfig,
}

/// Share index and refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Skip-list patterns tested against entry names during refresh
    pub skip_list: Vec<String>,
    /// Interpret skip-list entries as regular expressions (false = globs)
    pub skip_list_regex: bool,
    /// Share files and directories whose names start with a dot
    pub share_hidden: bool,
    /// Files larger than this many bytes are not shared (0 = unlimited)
    pub max_file_size_shared: u64,
    /// Leave directories with no shared content out of the index
    pub skip_empty_directories: bool,
    /// Directory for the share cache and hash databases (None = system dirs)
    pub config_dir: Option<PathBuf>,
    /// Minimum minutes between full file-list regenerations per profile
    pub file_list_refresh_minutes: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            skip_list: Vec::new(),
            skip_list_regex: true,
            share_hidden: false,
            max_file_size_shared: 0,
            skip_empty_directories: false,
            config_dir: None,
            file_list_refresh_minutes: 15,
        }
    }
}

/// Hasher pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Maximum concurrent hasher threads (0 = hardware concurrency)
    pub max_hashing_threads: usize,
    /// Maximum hashers touching one storage device (0 = unlimited)
    pub hashers_per_volume: usize,
    /// Hash throughput ceiling in MiB/s (0 = unthrottled)
    pub max_hash_speed: u64,
    /// Verify CRC32 against SFV sidecar files when present
    pub verify_sfv: bool,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            max_hashing_threads: 0,
            hashers_per_volume: 1,
            max_hash_speed: 0,
            verify_sfv: true,
        }
    }
}

/// Upload slot policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Configured standard upload slots
    pub slots: u32,
    /// Minimum slots granted per connected hub
    pub hub_slots: u32,
    /// Extra (mini) slots beyond the standard allocation
    pub extra_slots: u32,
    /// Extra slots reserved for partial-sharing peers
    pub extra_partial_slots: u32,
    /// Files at or below this many KiB qualify for a mini slot
    pub minislot_size_kb: u64,
    /// Maximum MCN uploads per user (0 = unlimited)
    pub slots_per_user: u32,
    /// Additional slots the auto-grant rule may open
    pub auto_slots: u32,
    /// Upload rate in KiB/s below which auto-grant fires (0 = disabled)
    pub auto_grant_speed_kbps: u64,
    /// Wildcard patterns granted a mini slot regardless of size
    pub free_slot_extensions: Vec<String>,
    /// Disconnect uploads to users that left all hubs
    pub auto_kick: bool,
    /// Exempt favorite users from auto-kick
    pub auto_kick_no_favs: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            hub_slots: 0,
            extra_slots: 3,
            extra_partial_slots: 1,
            minislot_size_kb: 512,
            slots_per_user: 2,
            auto_slots: 5,
            auto_grant_speed_kbps: 0,
            free_slot_extensions: Vec::new(),
            auto_kick: false,
            auto_kick_no_favs: true,
        }
    }
}

/// Filesystem monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Watch share roots for changes
    pub enabled: bool,
    /// Seconds of quiet before a changed directory is refreshed
    pub delay_secs: u64,
    /// Seconds between retries of failed watch registrations
    pub failed_retry_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 30,
            failed_retry_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "slipstream", "slipstream")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Effective configuration directory (override or system default)
    pub fn config_dir(&self) -> PathBuf {
        self.share
            .config_dir
            .clone()
            .or_else(|| {
                ProjectDirs::from("org", "slipstream", "slipstream")
                    .map(|dirs| dirs.config_dir().to_path_buf())
            })
            .unwrap_or_else(|| PathBuf::from("/tmp/slipstream"))
    }

    /// Mini-slot threshold in bytes
    pub fn minislot_size(&self) -> i64 {
        (self.uploads.minislot_size_kb * 1024) as i64
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}
