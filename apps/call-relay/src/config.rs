use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

use crate::registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub registry: RegistryConfig,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "call-relay",
    author,
    version,
    about = "Signaling relay for telemedicine calls"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "CALL_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Outbound frames buffered per link before deliveries are dropped.
    #[arg(long, env = "CALL_RELAY_LINK_BUFFER", default_value_t = 64)]
    pub link_buffer: usize,

    /// Links silent for longer than this are closed.
    #[arg(long, env = "CALL_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// How often the idle recycler runs.
    #[arg(long, env = "CALL_RELAY_RECYCLE_INTERVAL_SECS", default_value_t = 60)]
    pub recycle_interval_secs: u64,

    #[arg(long, env = "CALL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.link_buffer > 0, "link buffer must be at least 1");
        ensure!(
            cli.recycle_interval_secs > 0,
            "recycle interval must be at least one second"
        );
        Ok(RelayConfig {
            listen_addr,
            registry: RegistryConfig {
                per_link_buffer: cli.link_buffer,
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                recycle_interval: Duration::from_secs(cli.recycle_interval_secs),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
