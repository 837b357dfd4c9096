//! Jitter helpers for retry backoff
//!
//! Spreads out retry storms by randomizing computed delays. Delays are
//! jittered symmetrically (±fraction) and never go negative.

use rand::Rng;
use std::time::Duration;

/// Apply ±`fraction` jitter to a delay. `fraction` is clamped to [0, 1].
pub fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis() as f64;
    let spread = millis * fraction;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_millis((millis + offset).max(0.0) as u64)
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration, jitter_fraction: f64) -> Duration {
    let exp = attempt.min(16); // avoid shift overflow for runaway attempt counts
    let raw = base.saturating_mul(1u32 << exp);
    apply_jitter(raw.min(max), jitter_fraction)
}
