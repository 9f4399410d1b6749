//! Exponential recovery backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Recovery timeout for the `attempt`-th consecutive opening of a circuit.
///
/// The first opening waits exactly `base`. Later openings double the wait, capped
/// at `max`, plus 0-10% jitter so breakers that tripped together do not re-probe together.
pub fn recovery_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return base.min(max);
    }

    let exponential_base = 2u32.saturating_pow(attempt - 1);
    let capped = base.saturating_mul(exponential_base).min(max);

    let jitter_range_ms = (capped.as_millis() / 10) as u64;
    let jitter_ms = if jitter_range_ms > 0 {
        rand::thread_rng().gen_range(0..jitter_range_ms)
    } else {
        0
    };

    capped + Duration::from_millis(jitter_ms)
}
