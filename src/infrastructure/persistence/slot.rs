//! Per-instance backend settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::cleanup::CleanupPolicy;
use super::db_persistence::DEFAULT_WRITER_THREADS;
use super::file_persistence::DEFAULT_MAX_FILE_COUNT;

/// Backend of one logical cache instance, selected by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceSlot {
    /// One file per key.
    File(FileSlot),
    /// One `SQLite` table.
    Database(DatabaseSlot),
}

/// Settings of a file backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSlot {
    /// Storage directory; relative paths live under the data directory.
    pub directory: PathBuf,
    /// Eviction starts once this many files are stored.
    #[serde(default = "default_max_file_count")]
    pub max_file_count: usize,
}

/// Settings of a blob-table backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSlot {
    /// Database file; relative paths live under the data directory.
    pub path: PathBuf,
    /// Table name.
    pub table: String,
    /// Writes without a returned copy complete in the background.
    #[serde(default)]
    pub async_writes: bool,
    /// Background writer count.
    #[serde(default = "default_writer_threads")]
    pub writer_threads: usize,
    /// Clean-up policy.
    #[serde(default)]
    pub cleanup: CleanupPolicy,
}

const fn default_max_file_count() -> usize {
    DEFAULT_MAX_FILE_COUNT
}

const fn default_writer_threads() -> usize {
    DEFAULT_WRITER_THREADS
}

impl PersistenceSlot {
    /// Returns the slot with relative storage paths anchored at `data_dir`.
    #[must_use]
    pub fn resolved(&self, data_dir: &Path) -> Self {
        let anchor = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                data_dir.join(path)
            }
        };
        match self {
            Self::File(slot) => Self::File(FileSlot {
                directory: anchor(&slot.directory),
                ..slot.clone()
            }),
            Self::Database(slot) => Self::Database(DatabaseSlot {
                path: anchor(&slot.path),
                ..slot.clone()
            }),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Database(_) => "database",
        }
    }
}

impl Default for PersistenceSlot {
    fn default() -> Self {
        Self::File(FileSlot {
            directory: PathBuf::from("objects"),
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Slots {
        persistence: Vec<PersistenceSlot>,
    }

    #[test]
    fn test_parse_slots() {
        let toml_str = r#"
            [[persistence]]
            kind = "file"
            directory = "feeds"

            [[persistence]]
            kind = "database"
            path = "/var/cache/app.db"
            table = "entries"
            async_writes = true
            cleanup = { policy = "older_than", retention_secs = 3600 }
        "#;

        let slots: Slots = toml::from_str(toml_str).unwrap();
        assert_eq!(
            slots.persistence[0],
            PersistenceSlot::File(FileSlot {
                directory: PathBuf::from("feeds"),
                max_file_count: DEFAULT_MAX_FILE_COUNT,
            })
        );
        assert_eq!(
            slots.persistence[1],
            PersistenceSlot::Database(DatabaseSlot {
                path: PathBuf::from("/var/cache/app.db"),
                table: "entries".to_string(),
                async_writes: true,
                writer_threads: DEFAULT_WRITER_THREADS,
                cleanup: CleanupPolicy::OlderThan {
                    retention_secs: 3600
                },
            })
        );
    }

    #[test]
    fn test_resolved_anchors_relative_paths_only() {
        let data_dir = Path::new("/data/viewcache");
        let relative = PersistenceSlot::default().resolved(data_dir);
        let PersistenceSlot::File(slot) = relative else {
            panic!("expected file slot");
        };
        assert_eq!(slot.directory, data_dir.join("objects"));

        let absolute = PersistenceSlot::Database(DatabaseSlot {
            path: PathBuf::from("/tmp/x.db"),
            table: "t".to_string(),
            async_writes: false,
            writer_threads: 1,
            cleanup: CleanupPolicy::None,
        })
        .resolved(data_dir);
        let PersistenceSlot::Database(slot) = absolute else {
            panic!("expected database slot");
        };
        assert_eq!(slot.path, PathBuf::from("/tmp/x.db"));
    }
}
