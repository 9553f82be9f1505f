//! Engine configuration and persisted settings.
//!
//! Runtime components take the typed [`StoreConfig`], [`SyncConfig`] and
//! [`BatchConfig`]. [`Settings`] is the user-editable JSON form that is kept at an
//! OS-appropriate location and converted into those configs at startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A SQLite file plus its `-wal` / `-shm` side files.
    File(PathBuf),
    /// A private in-memory database, discarded when the store is dropped.
    InMemory,
}

/// What to do when the store cannot be opened as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryPolicy {
    /// Delete the store files and start empty. Loses data.
    #[default]
    ResetOnCorruption,
    /// Fail startup and leave the files untouched.
    Fail,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: StoreLocation,
    pub recovery: RecoveryPolicy,
    /// Upper bound on concurrently open background connections.
    pub max_background_contexts: usize,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            ..Self::in_memory()
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::InMemory,
            recovery: RecoveryPolicy::default(),
            max_background_contexts: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the cloud account status is polled.
    pub probe_interval: Duration,
    /// How long a remote change stays in `Syncing` before reporting `Synced`.
    pub settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Records committed per transaction during import.
    pub chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { chunk_size: 50 }
    }
}

/// Persisted engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub store_path: PathBuf,
    pub recovery: RecoveryPolicy,
    pub max_background_contexts: usize,
    pub import_chunk_size: usize,
    pub sync_probe_interval_secs: u64,
    pub sync_settle_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            recovery: RecoveryPolicy::default(),
            max_background_contexts: 4,
            import_chunk_size: 50,
            sync_probe_interval_secs: 60,
            sync_settle_delay_ms: 2_000,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            location: StoreLocation::File(self.store_path.clone()),
            recovery: self.recovery,
            max_background_contexts: self.max_background_contexts.max(1),
            busy_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            probe_interval: Duration::from_secs(self.sync_probe_interval_secs.max(1)),
            settle_delay: Duration::from_millis(self.sync_settle_delay_ms),
        }
    }

    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            chunk_size: self.import_chunk_size.max(1),
        }
    }
}

/// Returns the path to the settings JSON file.
///
/// - macOS / Linux: `~/.config/corkboard/settings.json`
/// - Windows: `%APPDATA%/Corkboard/settings.json`
pub fn settings_file_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("Corkboard").join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config").join("corkboard").join("settings.json")
    }
}

/// Returns the default store file: `<data dir>/Corkboard/notes.sqlite`.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Corkboard")
        .join("notes.sqlite")
}

/// Loads settings from the default location.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_file_path())
}

/// Loads settings from `path`; returns defaults if the file is missing or corrupt.
pub fn load_settings_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("ignoring unreadable settings file {}: {e}", path.display());
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

/// Saves settings to the default location.
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_file_path(), settings)
}

/// Saves settings to `path`, creating parent directories as needed.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;
    Ok(())
}
