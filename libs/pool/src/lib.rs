//! Backend connection pooling for tether.
//!
//! A [`ConnectionPool`] hands out [`Connection`]s to one backend, keeps
//! returned ones idle for reuse, and validates each idle candidate before
//! handing it out again:
//! - lifetime and idle-time expiry, both perturbed by a [`Jitter`]
//! - a non-blocking liveness probe on the raw socket
//!
//! When topologies are configured, idle connections are bucketed by the
//! topology their backend address falls in, and callers ask for a bucket by
//! name.

mod clock;
mod connection;
mod dialer;
mod error;
mod jitter;
mod pool;
mod probe;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{CancellableRead, Connection};
pub use dialer::{Dialer, RoundRobinDialer, TcpDialer};
pub use error::PoolError;
pub use jitter::{no_jitter, uniform_jitter, Jitter};
pub use pool::{ConnectionPool, PoolOptions, Strategy};
