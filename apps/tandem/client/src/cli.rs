use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tandem_core::SyncRecord;

use crate::channel::ChannelSettings;

#[derive(Debug, Parser)]
#[command(
    name = "tandem",
    author,
    version,
    about = "Keep a room of machines on the same branch and build"
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Session config file (defaults to ~/.tandem/session.toml).
    #[arg(long, env = "TANDEM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Relay base URL; persisted when given.
    #[arg(long, env = "TANDEM_SERVER", global = true)]
    pub server: Option<String>,

    /// Room to join; persisted when given.
    #[arg(long, env = "TANDEM_ROOM", global = true)]
    pub room: Option<String>,

    /// Bearer token presented to the relay.
    #[arg(long, env = "TANDEM_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Command whose stdout is the bearer token, e.g. "gh auth token".
    #[arg(long, env = "TANDEM_TOKEN_COMMAND", global = true, conflicts_with = "token")]
    pub token_command: Option<String>,

    /// Seconds between keep-alive envelopes.
    #[arg(long, env = "TANDEM_HEARTBEAT_SECS", global = true, default_value_t = 10)]
    pub heartbeat_secs: u64,

    /// Seconds to wait before reconnecting after the relay drops us.
    #[arg(long, env = "TANDEM_RECONNECT_DELAY_SECS", global = true, default_value_t = 1)]
    pub reconnect_delay_secs: u64,
}

impl ConnectionArgs {
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Join the room and react to sync messages; reads commands from stdin.
    Listen(ListenArgs),
    /// Broadcast one sync record to the room and exit.
    Sync(SyncArgs),
    /// Show or change the configured room.
    Room(RoomArgs),
}

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Local repository as name=path. Repeatable.
    #[arg(long = "repo", value_name = "NAME=PATH")]
    pub repos: Vec<String>,

    /// Directory whose children are repositories named after their folder.
    /// Repeatable; defaults to the current directory.
    #[arg(long = "search-root", value_name = "DIR")]
    pub search_roots: Vec<PathBuf>,

    /// Shell command run in the repository after checkout.
    #[arg(long, env = "TANDEM_CONFIGURE")]
    pub configure: Option<String>,

    /// Shell command run after configure succeeds.
    #[arg(long, env = "TANDEM_BUILD")]
    pub build: Option<String>,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[arg(long)]
    pub repo: String,

    #[arg(long, default_value = "origin")]
    pub remote: String,

    #[arg(long)]
    pub branch: String,

    /// Extra field for the build tool as key=value. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub extensions: Vec<String>,

    /// Seconds to wait for the relay to acknowledge.
    #[arg(long, default_value_t = 5)]
    pub ack_timeout_secs: u64,
}

impl SyncArgs {
    pub fn record(&self) -> Result<SyncRecord, String> {
        with_extensions(
            SyncRecord::new(&self.repo, &self.remote, &self.branch),
            self.extensions.iter().map(String::as_str),
        )
    }
}

#[derive(Debug, Args)]
pub struct RoomArgs {
    /// New room id.
    #[arg(long = "set", value_name = "ROOM")]
    pub room: Option<String>,

    /// New relay base URL.
    #[arg(long = "server", value_name = "URL")]
    pub server: Option<String>,
}

/// A line typed into `tandem listen`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Sync(SyncRecord),
    Resync,
    Reconnect,
    Room(String),
    Help,
    Quit,
}

pub const CONSOLE_HELP: &str = "commands: sync <repo> <remote> <branch> [key=value...] | resync | reconnect | room <id> | quit";

/// Parses one console line. Blank lines yield `Ok(None)`.
pub fn parse_console(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let command = match (head, rest.as_slice()) {
        ("sync", [repo, remote, branch, extra @ ..]) => ConsoleCommand::Sync(with_extensions(
            SyncRecord::new(*repo, *remote, *branch),
            extra.iter().copied(),
        )?),
        ("sync", _) => return Err("usage: sync <repo> <remote> <branch> [key=value...]".into()),
        ("resync", []) => ConsoleCommand::Resync,
        ("reconnect", []) => ConsoleCommand::Reconnect,
        ("room", [room]) => ConsoleCommand::Room((*room).to_string()),
        ("room", _) => return Err("usage: room <id>".into()),
        ("help" | "?", _) => ConsoleCommand::Help,
        ("quit" | "exit", []) => ConsoleCommand::Quit,
        (other, _) => return Err(format!("unknown command '{other}'; {CONSOLE_HELP}")),
    };
    Ok(Some(command))
}

fn with_extensions<'a>(
    mut record: SyncRecord,
    pairs: impl Iterator<Item = &'a str>,
) -> Result<SyncRecord, String> {
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        if key.is_empty() {
            return Err(format!("expected key=value, got '{pair}'"));
        }
        record = record.with_extension(key, extension_value(value));
    }
    Ok(record)
}

/// JSON scalars keep their type; anything else is a string.
fn extension_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn console_sync_parses_extensions() {
        let command = parse_console("sync app origin feature-x preset=debug jobs=8 lto=true")
            .unwrap()
            .unwrap();
        let ConsoleCommand::Sync(record) = command else {
            panic!("expected sync");
        };
        assert_eq!(record.repo, "app");
        assert_eq!(record.branch, "feature-x");
        assert_eq!(record.extensions["preset"], json!("debug"));
        assert_eq!(record.extensions["jobs"], json!(8));
        assert_eq!(record.extensions["lto"], json!(true));
    }

    #[test]
    fn console_rejects_bad_lines() {
        assert_eq!(parse_console("   ").unwrap(), None);
        assert!(parse_console("sync app origin").is_err());
        assert!(parse_console("sync app origin main novalue").is_err());
        assert!(parse_console("room").is_err());
        assert!(parse_console("launch").is_err());
        assert_eq!(
            parse_console("room team-b").unwrap(),
            Some(ConsoleCommand::Room("team-b".into()))
        );
        assert_eq!(parse_console("quit").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "tandem",
            "--room",
            "team-a",
            "sync",
            "--repo",
            "app",
            "--branch",
            "main",
            "--set",
            "preset=release",
        ]);
        assert_eq!(cli.connection.room.as_deref(), Some("team-a"));
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let record = args.record().unwrap();
        assert_eq!(record.remote, "origin");
        assert_eq!(record.extensions["preset"], json!("release"));
    }

    #[test]
    fn token_flags_conflict() {
        assert!(Cli::try_parse_from([
            "tandem",
            "--token",
            "a",
            "--token-command",
            "gh auth token",
            "room",
        ])
        .is_err());
    }
}
