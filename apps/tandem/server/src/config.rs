use std::{collections::HashSet, net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::registry::RoomConfig;

#[derive(Debug, Parser)]
#[command(
    name = "tandem-relay",
    author,
    version,
    about = "Room relay for tandem branch/build sync"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "TANDEM_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:9480")]
    pub listen_addr: String,

    /// Bearer tokens accepted on `/room/:room_id`. Leave empty to disable auth
    /// (development only).
    #[arg(long = "token", env = "TANDEM_RELAY_TOKENS", value_delimiter = ',')]
    pub tokens: Vec<String>,

    /// Close members that have been silent for this long.
    #[arg(long, env = "TANDEM_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Do not deliver a member's own sync back to it.
    #[arg(long, env = "TANDEM_RELAY_NO_ECHO", default_value_t = false)]
    pub no_echo: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TANDEM_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub tokens: HashSet<String>,
    pub rooms: RoomConfig,
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Loopback listener on an ephemeral port with auth disabled.
    pub fn local() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tokens: HashSet::new(),
            rooms: RoomConfig::default(),
            shutdown_grace: Duration::ZERO,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.idle_timeout_secs == 0 {
            bail!("idle timeout must be greater than zero");
        }
        let tokens = cli
            .tokens
            .into_iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();
        let rooms = RoomConfig {
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            recycle_interval: Duration::from_secs(cli.idle_timeout_secs.div_ceil(4).max(1)),
            echo_to_sender: !cli.no_echo,
            ..RoomConfig::default()
        };
        Ok(RelayConfig {
            listen_addr,
            tokens,
            rooms,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
