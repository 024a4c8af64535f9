//! The configuration file on disk and the checks run on what it describes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_config::AppConfig;
use crate::infrastructure::persistence::PersistenceSlot;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no per-user configuration directory on this platform, pass --config")]
    NoConfigDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("persistence slots {first} and {second} share storage at {}", .path.display())]
    SharedStorage {
        first: usize,
        second: usize,
        path: PathBuf,
    },
}

/// The configuration file viewcache reads at startup.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// The file at `path`, or the per-user default location when `None`.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoConfigDir`] if no path is given and the
    /// platform has no configuration directory.
    pub fn locate(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => AppConfig::default_config_path().ok_or(ConfigError::NoConfigDir)?,
        };
        Ok(Self { path })
    }

    /// The file at exactly `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the configuration. A missing file is created with the
    /// defaults; a malformed one is left alone and the defaults are used.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the defaults cannot be
    /// written.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = if self.path.exists() {
            let text = fs::read_to_string(&self.path)?;
            toml::from_str::<AppConfig>(&text).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Malformed config file, using defaults");
                AppConfig::default()
            })
        } else {
            info!(path = %self.path.display(), "No config file, writing defaults");
            let defaults = AppConfig::default();
            self.save(&defaults)?;
            defaults
        };

        if config.persistence.is_empty() {
            warn!(path = %self.path.display(), "Config declares no persistence slot");
        }
        config.config = Some(self.path.clone());
        debug!(
            path = %self.path.display(),
            slots = config.persistence.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Writes `config` through a temporary file renamed over the target.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(config)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(text.as_bytes())?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Rejects slot lists where two backends would step on each other's files:
/// equal or nested file directories, a database inside a file directory, or
/// the same table of the same database twice. Paths are compared after
/// anchoring at the data directory.
///
/// # Errors
/// Returns [`ConfigError::SharedStorage`] naming the first conflicting pair.
pub fn check_slots(config: &AppConfig) -> Result<(), ConfigError> {
    let slots: Vec<PersistenceSlot> = (0..config.persistence.len())
        .filter_map(|index| config.slot(index))
        .collect();

    for (first, a) in slots.iter().enumerate() {
        for (offset, b) in slots[first + 1..].iter().enumerate() {
            if let Some(path) = shared_storage(a, b) {
                return Err(ConfigError::SharedStorage {
                    first,
                    second: first + 1 + offset,
                    path,
                });
            }
        }
    }
    Ok(())
}

fn shared_storage(a: &PersistenceSlot, b: &PersistenceSlot) -> Option<PathBuf> {
    match (a, b) {
        (PersistenceSlot::File(a), PersistenceSlot::File(b)) => {
            if a.directory.starts_with(&b.directory) {
                Some(a.directory.clone())
            } else if b.directory.starts_with(&a.directory) {
                Some(b.directory.clone())
            } else {
                None
            }
        }
        (PersistenceSlot::Database(a), PersistenceSlot::Database(b)) => {
            (a.path == b.path && a.table.eq_ignore_ascii_case(&b.table)).then(|| a.path.clone())
        }
        (PersistenceSlot::File(dir), PersistenceSlot::Database(db))
        | (PersistenceSlot::Database(db), PersistenceSlot::File(dir)) => {
            db.path.starts_with(&dir.directory).then(|| db.path.clone())
        }
    }
}
