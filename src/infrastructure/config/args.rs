use super::app_config::LogLevel;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "image-manager",
    version,
    about = "Inspect and maintain an image cache directory",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root cache directory.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Manager name (subdirectory of the cache directory).
    #[arg(long)]
    pub name: Option<String>,

    /// Disk capacity in bytes; `0` is unlimited.
    #[arg(long, value_name = "BYTES")]
    pub disk_capacity: Option<u64>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

/// Maintenance operations on a disk cache.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print entry count and bytes used.
    Usage,
    /// Purge expired entries.
    Sweep,
    /// Remove every entry.
    Clear,
    /// Remove entries written at or after a time.
    RemoveSince {
        /// RFC 3339 timestamp, e.g. `2024-05-01T00:00:00Z`.
        since: DateTime<Utc>,
    },
    /// Remove the entries of one item.
    Remove {
        /// Item identifier.
        #[arg(long)]
        item: String,
        /// Only this format; all formats when omitted.
        #[arg(long)]
        format: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remove_since() {
        let args = CliArgs::parse_from(["image-manager", "remove-since", "2024-05-01T00:00:00Z"]);
        let Command::RemoveSince { since } = args.command else {
            panic!("expected remove-since");
        };
        assert_eq!(since.to_rfc3339(), "2024-05-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_remove_with_format() {
        let args = CliArgs::parse_from([
            "image-manager",
            "remove",
            "--item",
            "a",
            "--format",
            "thumb",
        ]);
        assert!(matches!(
            args.command,
            Command::Remove { ref item, format: Some(ref format) } if item == "a" && format == "thumb"
        ));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["image-manager"]).is_err());
    }
}
