//! Prometheus metrics for the proxy.

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tether_pool::ConnectionPool;

/// Metric families owned by one proxy instance.
pub struct Metrics {
    registry: Registry,
    connections: IntGaugeVec,
    idle_connections: IntGaugeVec,
    commands: IntCounterVec,
    pools: Mutex<Vec<(String, ConnectionPool)>>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections = IntGaugeVec::new(
            Opts::new("tcp_connections", "relayed connections in flight per upstream"),
            &["upstream"],
        )?;
        let idle_connections = IntGaugeVec::new(
            Opts::new("tcp_idle_connections", "idle pooled connections per upstream"),
            &["upstream"],
        )?;
        let commands = IntCounterVec::new(
            Opts::new("redis_commands_total", "client commands seen by the splitter"),
            &["cmd"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(idle_connections.clone()))?;
        registry.register(Box::new(commands.clone()))?;

        Ok(Self {
            registry,
            connections,
            idle_connections,
            commands,
            pools: Mutex::new(Vec::new()),
        })
    }

    /// Report `pool`'s idle count under `upstream` at every scrape.
    pub fn observe_pool(&self, upstream: impl Into<String>, pool: ConnectionPool) {
        self.pools.lock().push((upstream.into(), pool));
    }

    /// Count a relay holding a connection to `upstream` until the guard drops.
    pub fn track_connection(&self, upstream: &str) -> ConnectionGuard {
        let gauge = self.connections.with_label_values(&[upstream]);
        gauge.inc();
        ConnectionGuard { gauge }
    }

    pub fn record_command(&self, cmd: &str) {
        self.commands.with_label_values(&[cmd]).inc();
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        for (upstream, pool) in self.pools.lock().iter() {
            self.idle_connections
                .with_label_values(&[upstream.as_str()])
                .set(pool.idle_connections() as i64);
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Decrements the connection gauge on drop.
pub struct ConnectionGuard {
    gauge: prometheus::IntGauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
