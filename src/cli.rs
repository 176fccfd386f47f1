use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Transcript backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
    Redis,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::File => write!(f, "file"),
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "vibe-relay")]
#[command(version)]
#[command(about = "Streaming chat relay with model fallback, admission queue and transcripts")]
pub struct Args {
    /// TOML config file; built-in defaults are used when omitted
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to bind (overrides [server].host)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Maximum concurrent upstream chats (overrides [queue].max_concurrent)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Transcript backend (overrides [storage].backend)
    #[arg(long, value_enum)]
    pub store: Option<StoreKind>,

    /// Directory for the file transcript backend (overrides [storage].directory)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["vibe-relay"]);
        assert!(args.config.is_none());
        assert!(args.host.is_none());
        assert!(args.port.is_none());
        assert!(args.max_concurrent.is_none());
        assert!(args.store.is_none());
        assert!(args.storage_dir.is_none());
        assert!(!args.print_config);
    }

    #[test]
    fn test_args_parse_all_flags() {
        let args = Args::parse_from([
            "vibe-relay",
            "--config",
            "relay.toml",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--max-concurrent",
            "16",
            "--store",
            "memory",
            "--storage-dir",
            "/tmp/chats",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("relay.toml")));
        assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.max_concurrent, Some(16));
        assert_eq!(args.store, Some(StoreKind::Memory));
        assert_eq!(args.storage_dir, Some(PathBuf::from("/tmp/chats")));
    }

    #[test]
    fn test_short_flags() {
        let args = Args::parse_from(["vibe-relay", "-c", "a.toml", "-p", "1234"]);
        assert_eq!(args.config, Some(PathBuf::from("a.toml")));
        assert_eq!(args.port, Some(1234));
    }

    #[test]
    fn test_unknown_store_rejected() {
        assert!(Args::try_parse_from(["vibe-relay", "--store", "sqlite"]).is_err());
    }

    #[test]
    fn test_store_kind_display() {
        assert_eq!(StoreKind::File.to_string(), "file");
        assert_eq!(StoreKind::Redis.to_string(), "redis");
    }
}
