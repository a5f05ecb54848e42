//! tether proxy
//!
//! Accepts client connections, relays them over pooled backend connections
//! and serves `/metrics` and `/healthz` on a separate address.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tether_proxy::monitor::{self, MonitorState};
use tether_proxy::shutdown::join_within;
use tether_proxy::{Config, Listener, Metrics, ProxyState, Shutdown, Upstream, Upstreams};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Prefer RUST_LOG, fall back to TETHER_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    config.validate()?;

    info!(
        local_address = %config.local_address,
        remote_address = %config.remote_address,
        reader_routing = config.reader_routing,
        topology_aware_routing = config.topology_aware_routing,
        "starting tether proxy"
    );

    let topologies = config.topology_router()?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let writer = Upstream::connect(
        &config.remote_address,
        config.connect_timeout,
        config.pool_options(topologies.clone()),
    );
    let reader = config.reader_routing.then(|| {
        Upstream::connect(
            config.reader_address(),
            config.connect_timeout,
            config.pool_options(topologies.clone()),
        )
    });
    let upstreams = Upstreams::new(writer, reader).with_self_topology(&topologies, config.own_ip);
    for upstream in upstreams.iter() {
        metrics.observe_pool(upstream.addr.clone(), upstream.pool.clone());
    }

    let shutdown = Shutdown::new();

    let monitor_listener = TcpListener::bind(&config.monitor_address)
        .await
        .with_context(|| format!("failed to bind monitor address {}", config.monitor_address))?;
    let monitor_state = MonitorState {
        metrics: Arc::clone(&metrics),
        draining: shutdown.draining(),
    };
    let monitor_handle = tokio::spawn(monitor::serve(
        monitor_listener,
        monitor_state,
        config.http_keepalive,
        shutdown.stopping(),
    ));

    let state = Arc::new(ProxyState { upstreams, metrics });
    let listener = Listener::bind(&config.local_address, config.max_connections, state)
        .await
        .with_context(|| format!("failed to bind local address {}", config.local_address))?;
    let listener_handle = tokio::spawn(listener.run(shutdown.stopping()));

    wait_for_signal().await?;
    info!("received shutdown signal");

    shutdown.run(config.lameduck).await;

    join_within(config.termination_grace_period, listener_handle, monitor_handle).await;

    info!("tether proxy shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => result?,
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
