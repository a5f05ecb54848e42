//! Proxy configuration.
//!
//! Every flag can also be set through the environment variable of the same
//! name in upper snake case.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tether_networking::TopologyRouter;
use tether_pool::{uniform_jitter, PoolOptions, Strategy};

/// Pooled TCP proxy with optional Redis read/write splitting.
#[derive(Debug, Clone, Parser)]
#[command(name = "tether-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to accept client connections on.
    #[arg(long, env = "LOCAL_ADDRESS", default_value = "127.0.0.1:16379")]
    pub local_address: String,

    /// Backend (primary) address.
    #[arg(long, env = "REMOTE_ADDRESS", default_value = "127.0.0.1:6379")]
    pub remote_address: String,

    /// Address for the metrics and health HTTP server.
    #[arg(long, env = "MONITOR_ADDRESS", default_value = "127.0.0.1:8080")]
    pub monitor_address: String,

    /// Parse client traffic and send read-only commands to a replica.
    #[arg(long, env = "READER_ROUTING")]
    pub reader_routing: bool,

    /// Replica address for read-only commands. Defaults to the remote address.
    #[arg(long, env = "READER_REMOTE_ADDRESS")]
    pub reader_remote_address: Option<String>,

    /// Timeout for establishing a backend connection.
    #[arg(long, env = "CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Concurrent relays, and live backend connections per pool. Zero means
    /// unbounded.
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = i32::MAX as usize)]
    pub max_connections: usize,

    /// Idle backend connections kept for reuse.
    #[arg(long, env = "MAX_IDLE_CONNECTIONS", default_value_t = 0)]
    pub max_idle_connections: usize,

    /// Idle backend connections kept warm in the background.
    #[arg(long, env = "MIN_IDLE_CONNECTIONS", default_value_t = 0)]
    pub min_idle_connections: usize,

    /// Discard idle connections older than this. Zero disables.
    #[arg(long, env = "MAX_IDLE_TIME", default_value = "0", value_parser = parse_duration)]
    pub max_idle_time: Duration,

    /// Discard connections older than this. Zero disables.
    #[arg(long, env = "MAX_LIFETIME", default_value = "0", value_parser = parse_duration)]
    pub max_lifetime: Duration,

    /// Random spread applied to idle time and lifetime, as a fraction.
    #[arg(long, env = "JITTER_PERCENTAGE", default_value_t = 0.1)]
    pub jitter_percentage: f64,

    /// Prefer backend connections in the proxy's own topology.
    #[arg(long, env = "TOPOLOGY_AWARE_ROUTING")]
    pub topology_aware_routing: bool,

    /// Topologies as `name=CIDR,name=CIDR`.
    #[arg(long, env = "TOPOLOGIES", default_value = "")]
    pub topologies: String,

    /// This process's own IP, used to find its topology.
    #[arg(long, env = "OWN_IP")]
    pub own_ip: Option<IpAddr>,

    /// Upper bound on monitor server shutdown.
    #[arg(long, env = "TERMINATION_GRACE_PERIOD", default_value = "10s", value_parser = parse_duration)]
    pub termination_grace_period: Duration,

    /// Keep accepting for this long after a termination signal.
    #[arg(long, env = "LAMEDUCK", default_value = "1s", value_parser = parse_duration)]
    pub lameduck: Duration,

    /// HTTP keep-alive on the monitor server.
    #[arg(long, env = "HTTP_KEEPALIVE", default_value_t = true, action = ArgAction::Set)]
    pub http_keepalive: bool,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "TETHER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Reject combinations that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.jitter_percentage) {
            bail!(
                "jitter percentage must be in [0, 1), got {}",
                self.jitter_percentage
            );
        }

        if self.min_idle_connections > self.max_idle_connections {
            bail!(
                "min idle connections ({}) exceeds max idle connections ({})",
                self.min_idle_connections,
                self.max_idle_connections
            );
        }

        self.topology_router()?;
        Ok(())
    }

    /// Replica address, falling back to the primary.
    pub fn reader_address(&self) -> &str {
        self.reader_remote_address
            .as_deref()
            .unwrap_or(&self.remote_address)
    }

    /// Topologies in effect. Disabled unless topology-aware routing is on.
    pub fn topology_router(&self) -> Result<TopologyRouter> {
        if !self.topology_aware_routing {
            return Ok(TopologyRouter::disabled());
        }

        TopologyRouter::parse(&self.topologies)
            .with_context(|| format!("invalid topologies: {:?}", self.topologies))
    }

    /// Options shared by the writer and reader pools.
    pub fn pool_options(&self, topologies: TopologyRouter) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            max_idle_connections: self.max_idle_connections,
            min_idle_connections: self.min_idle_connections,
            max_idle_time: self.max_idle_time,
            max_lifetime: self.max_lifetime,
            jitter: uniform_jitter(self.jitter_percentage),
            strategy: Strategy::Fifo,
            topologies,
            ..Default::default()
        }
    }
}

/// Parse `250ms`, `10s`, `1m30s`, `2h` or plain seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| format!("{input:?}: {e}"));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("{input:?}: missing unit"))?;
        if number_len == 0 {
            return Err(format!("{input:?}: expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_nanos: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            other => return Err(format!("{input:?}: unknown unit {other:?}")),
        };

        let part = match number.parse::<u64>() {
            Ok(whole) => whole
                .checked_mul(unit_nanos)
                .map(Duration::from_nanos)
                .ok_or_else(|| format!("{input:?}: out of range"))?,
            Err(_) => {
                let value: f64 = number
                    .parse()
                    .map_err(|_| format!("{input:?}: invalid number {number:?}"))?;
                Duration::try_from_secs_f64(value * unit_nanos as f64 / 1e9)
                    .map_err(|e| format!("{input:?}: {e}"))?
            }
        };

        total = total
            .checked_add(part)
            .ok_or_else(|| format!("{input:?}: out of range"))?;
        rest = tail;
    }

    Ok(total)
}
