//! Exponential backoff with jitter.

use std::time::Duration;

use nimbus_core::config::NetworkConfig;
use rand::Rng;

/// Computes the delay before retry `attempt` (0-based).
///
/// `base * 2^attempt`, capped, with ±25% uniform jitter so a fleet of
/// workers retrying after the same outage does not stampede the server.
pub fn backoff_delay(config: &NetworkConfig, attempt: u32) -> Duration {
    let exp = config
        .backoff_base_ms
        .saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(config.backoff_cap_ms);
    let jitter_span = capped / 4;
    let jittered = if jitter_span > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_span * 2);
        capped - jitter_span + offset
    } else {
        capped
    };
    Duration::from_millis(jittered)
}
