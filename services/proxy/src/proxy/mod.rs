//! Client-facing proxy.
//!
//! - [`Listener`] accepts clients and owns the relay tasks
//! - [`relay`] copies bytes, or parses and splits them in reader mode
//! - [`router`] picks the upstream for each command

mod listener;
pub mod relay;
pub mod router;

pub use listener::{Listener, ProxyState};
pub use relay::{Outcome, Side};
pub use router::{route, Route, Upstream, Upstreams};
