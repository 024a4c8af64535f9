//! Application configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::args::CliArgs;
use crate::infrastructure::image::DownloaderConfig;
use crate::infrastructure::persistence::{
    CleanupPolicy, DEFAULT_MAX_FILE_COUNT, DEFAULT_WRITER_THREADS, DatabaseSlot, FileSlot,
    PersistenceSlot,
};

const APP_NAME: &str = "viewcache";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "viewcache";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Base directory of relative persistence paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Image engine settings.
    #[serde(default)]
    pub downloader: DownloaderConfig,

    /// Persistence backends, one per cache instance index.
    #[serde(default = "default_slots")]
    pub persistence: Vec<PersistenceSlot>,
}

fn default_slots() -> Vec<PersistenceSlot> {
    vec![
        PersistenceSlot::File(FileSlot {
            directory: PathBuf::from("objects"),
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }),
        PersistenceSlot::Database(DatabaseSlot {
            path: PathBuf::from("cache.db"),
            table: "entries".to_string(),
            async_writes: false,
            writer_threads: DEFAULT_WRITER_THREADS,
            cleanup: CleanupPolicy::OlderThan {
                retention_secs: 7 * 24 * 3600,
            },
        }),
    ]
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(data_dir) = &args.data_dir {
            self.data_dir = Some(data_dir.clone());
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default data directory.
    #[must_use]
    pub fn default_data_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        Self::default_data_dir().map(|dir| dir.join("viewcache.log"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }

    /// Returns effective data directory, falling back to the working directory.
    #[must_use]
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(Self::default_data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Persistence slot `index` with its paths resolved.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<PersistenceSlot> {
        self.persistence
            .get(index)
            .map(|slot| slot.resolved(&self.effective_data_dir()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            data_dir: None,
            downloader: DownloaderConfig::default(),
            persistence: default_slots(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
            log_level = "debug"
            data_dir = "/srv/viewcache"

            [downloader]
            download_workers = 8
            cache_ceiling_bytes = 1048576

            [[persistence]]
            kind = "database"
            path = "feeds.db"
            table = "feeds"
            async_writes = true
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.downloader.download_workers, 8);
        assert_eq!(config.downloader.cache_ceiling_bytes, 1_048_576);
        assert_eq!(
            config.downloader.pre_workers,
            DownloaderConfig::default().pre_workers
        );
        assert_eq!(config.persistence.len(), 1);

        let Some(PersistenceSlot::Database(slot)) = config.slot(0) else {
            panic!("expected database slot");
        };
        assert_eq!(slot.path, PathBuf::from("/srv/viewcache/feeds.db"));
        assert_eq!(slot.writer_threads, DEFAULT_WRITER_THREADS);
        assert!(config.slot(1).is_none());
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.persistence.len(), 2);
        assert_eq!(config.persistence[0].kind(), "file");
        assert_eq!(config.persistence[1].kind(), "database");
    }

    #[test]
    fn test_default_config_survives_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_merge_with_args() {
        let args = CliArgs::parse_from([
            "viewcache",
            "--log-level",
            "trace",
            "--data-dir",
            "/tmp/vc",
            "keys",
        ]);
        let mut config = AppConfig::default();
        config.merge_with_args(&args);

        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.effective_data_dir(), PathBuf::from("/tmp/vc"));
    }
}
