//! CLI definition using clap derive.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use peerviz_server::ServerConfig;
use peerviz_server::config::{DEFAULT_PORT, DEFAULT_SNAPSHOT_INTERVAL_MS};

#[derive(Debug, Parser)]
#[command(
    name = "peerviz",
    about = "Aggregate peer experiment events and coordinate experiment shutdown"
)]
pub struct Cli {
    /// TCP port participants report to
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind the listening socket on
    #[arg(long, env = "PEERVIZ_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Milliseconds between snapshots handed to the renderer
    #[arg(
        long,
        env = "PEERVIZ_SNAPSHOT_INTERVAL_MS",
        default_value_t = DEFAULT_SNAPSHOT_INTERVAL_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_interval_ms: u64,

    /// Write every snapshot to stdout as a JSON line
    #[arg(long)]
    pub emit_json: bool,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
        }
    }
}
