use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use node_agent_common::NodeError;

/// Timing and sizing knobs for every supervised process on a host.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub idle_interval: Duration,
    pub flush_period: Duration,
    /// How long `destroy` waits after SIGTERM before sending SIGKILL.
    pub destroy_timeout: Duration,
    /// Share of a batch-and-discard cap dropped at once on overflow.
    pub discard_fraction: f64,
    pub read_chunk: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            idle_interval: Duration::from_secs(10),
            flush_period: Duration::from_secs(5),
            destroy_timeout: Duration::from_secs(5),
            discard_fraction: 0.25,
            read_chunk: 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), NodeError> {
        if !(self.discard_fraction > 0.0 && self.discard_fraction <= 1.0) {
            return Err(NodeError::InvalidArgument(format!(
                "Discard fraction must be in (0, 1], got {}",
                self.discard_fraction
            )));
        }
        if self.read_chunk == 0 {
            return Err(NodeError::InvalidArgument(
                "Read chunk must be non-zero".to_string(),
            ));
        }
        for (what, interval) in [
            ("heartbeat interval", self.heartbeat_interval),
            ("idle interval", self.idle_interval),
            ("flush period", self.flush_period),
        ] {
            if interval.is_zero() {
                return Err(NodeError::InvalidArgument(format!(
                    "The {} must be non-zero",
                    what
                )));
            }
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "node-agent-server",
    about = "Launches and supervises processes on behalf of remote clients",
    version
)]
pub struct ServerConfig {
    /// Port the RPC service listens on.
    #[arg(short, long, env = "NODE_AGENT_PORT", default_value_t = 8484)]
    pub port: u16,

    #[arg(long, env = "NODE_AGENT_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    pub verbose: bool,

    /// Default launch property, overridden by a process description.
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    #[arg(long, value_name = "SECS", default_value_t = 20)]
    pub heartbeat_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub flush_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub destroy_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn default_properties(&self) -> BTreeMap<String, String> {
        self.properties.iter().cloned().collect()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            flush_period: Duration::from_secs(self.flush_secs),
            destroy_timeout: Duration::from_secs(self.destroy_timeout_secs),
            ..SupervisorConfig::default()
        }
    }
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        Some(_) => Err(format!("missing key in {:?}", raw)),
        None => Ok((raw.trim().to_string(), String::new())),
    }
}
