//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory, or `--config`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{DEFAULT_ICE_SERVER, DEFAULT_SERVER_URL};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// blazeit - room chat and file drop over direct peer connections.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML). Defaults to ./config.toml when present.
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Relay WebSocket endpoint.
    #[clap(long)]
    pub server: Option<String>,

    /// Name announced to the relay and shown to peers.
    #[clap(short, long)]
    pub username: Option<String>,

    /// Room to join.
    #[clap(short, long)]
    pub room: Option<String>,

    /// Where received files are saved. Defaults to <conf>/downloads.
    #[clap(long)]
    pub downloads: Option<PathBuf>,

    /// ICE server URL (repeatable).
    #[clap(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Do not reconnect when the relay connection drops.
    #[clap(long)]
    pub no_reconnect: bool,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory for persistent data (remembered session, logs, downloads).
    /// Defaults to ~/.blazeit/
    #[clap(long)]
    pub conf: Option<PathBuf>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);
        cli_args.downloads = cli_args.downloads.map(Self::resolve_path);

        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        match Self::from_file(&path) {
            Some(file_args) => Self::merge(file_args, cli_args),
            None => cli_args,
        }
    }

    /// Relay URL, falling back to the default endpoint.
    pub fn server_url(&self) -> &str {
        self.server.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    /// Configured ICE servers, or the default STUN server.
    pub fn ice_servers(&self) -> Vec<String> {
        if self.ice_servers.is_empty() {
            vec![DEFAULT_ICE_SERVER.to_string()]
        } else {
            self.ice_servers.clone()
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match Self::parse_toml(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                warn!(event = "config_parse_failure", path = %path.display(), error = %e, "Ignoring invalid config file");
                None
            }
        }
    }

    fn parse_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Args>(content)
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.server.is_some() {
            file.server = cli.server;
        }
        if cli.username.is_some() {
            file.username = cli.username;
        }
        if cli.room.is_some() {
            file.room = cli.room;
        }
        if cli.downloads.is_some() {
            file.downloads = cli.downloads;
        }
        if !cli.ice_servers.is_empty() {
            file.ice_servers = cli.ice_servers;
        }
        if cli.no_reconnect {
            file.no_reconnect = true;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        file.config = cli.config;
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file() {
        let file = Args::parse_toml(
            r#"
            server = "wss://relay.example/ws"
            username = "alice"
            room = "R1"
            ice_servers = ["stun:a", "turn:b"]
            verbose = 1
            "#,
        )
        .unwrap();
        let cli = Args::parse_from(["blazeit", "--room", "R2", "--no-reconnect"]);

        let merged = Args::merge(file, cli);
        assert_eq!(merged.server_url(), "wss://relay.example/ws");
        assert_eq!(merged.username.as_deref(), Some("alice"));
        assert_eq!(merged.room.as_deref(), Some("R2"));
        assert_eq!(merged.ice_servers(), vec!["stun:a", "turn:b"]);
        assert!(merged.no_reconnect);
        assert_eq!(merged.verbose, 1);
    }

    #[test]
    fn defaults_apply_without_values() {
        let args = Args::parse_from(["blazeit"]);
        assert_eq!(args.server_url(), DEFAULT_SERVER_URL);
        assert_eq!(args.ice_servers(), vec![DEFAULT_ICE_SERVER.to_string()]);

        let repeated = Args::parse_from(["blazeit", "--ice-server", "stun:x", "--ice-server", "stun:y"]);
        assert_eq!(repeated.ice_servers, vec!["stun:x", "stun:y"]);
    }
}
