//! # tether-proxy
//!
//! Pooled TCP proxy in front of a Redis primary, with optional read/write
//! splitting to a replica.
//!
//! ## Shutdown
//!
//! On SIGTERM or Ctrl-C the proxy drains: `/healthz` reports 503 while the
//! listener keeps accepting for the lameduck interval. It then closes the
//! listener, lets every relay flush pending backend replies, and half-closes
//! each client.

pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod proxy;
pub mod shutdown;

pub use config::Config;
pub use error::RelayError;
pub use metrics::Metrics;
pub use proxy::{Listener, ProxyState, Upstream, Upstreams};
pub use shutdown::Shutdown;
