//! Threshold perturbation for idle and lifetime expiry.
//!
//! Connections created together would otherwise all expire together.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Perturbs a threshold. Called afresh on every comparison.
pub type Jitter = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// No perturbation.
pub fn no_jitter() -> Jitter {
    Arc::new(|d| d)
}

/// Uniform perturbation within `±percentage` of the threshold.
///
/// `percentage` is a fraction (0.1 means ±10%) and is clamped to `[0, 1]`.
pub fn uniform_jitter(percentage: f64) -> Jitter {
    let percentage = percentage.clamp(0.0, 1.0);
    if percentage == 0.0 {
        return no_jitter();
    }

    Arc::new(move |d| {
        let factor = rand::rng().random_range(-percentage..=percentage);
        d.mul_f64(1.0 + factor)
    })
}
