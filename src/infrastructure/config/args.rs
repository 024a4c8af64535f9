use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "viewcache",
    version,
    about = "Image download cache and persisted business-object cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Base directory of relative persistence paths.
    #[arg(long, value_name = "PATH", env = "VIEWCACHE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Fetches a JSON document through the cache of a persistence slot.
    Fetch {
        /// Document URL.
        url: String,
        /// Persistence slot index.
        #[arg(long, default_value_t = 0)]
        slot: usize,
        /// Serve the persisted copy when younger than this many seconds.
        /// Without it the remote copy is preferred.
        #[arg(long, value_name = "SECS")]
        max_age: Option<u64>,
    },

    /// Downloads images through the engine and reports their dimensions.
    Image {
        /// Image URLs.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Downscale to at most this width.
        #[arg(long)]
        max_width: Option<u32>,
        /// Downscale to at most this height.
        #[arg(long)]
        max_height: Option<u32>,
    },

    /// Lists the keys stored in a persistence slot.
    Keys {
        /// Persistence slot index.
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },

    /// Runs the clean-up policy of a persistence slot.
    Cleanup {
        /// Persistence slot index.
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },

    /// Removes every entry of a persistence slot.
    Clear {
        /// Persistence slot index.
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = CliArgs::parse_from([
            "viewcache",
            "fetch",
            "https://example.com/feed.json",
            "--slot",
            "1",
            "--max-age",
            "60",
        ]);
        assert_eq!(
            args.command,
            Command::Fetch {
                url: "https://example.com/feed.json".to_string(),
                slot: 1,
                max_age: Some(60),
            }
        );
    }

    #[test]
    fn test_image_requires_url() {
        assert!(CliArgs::try_parse_from(["viewcache", "image"]).is_err());
    }
}
