//! Retry and backoff helpers for worker loops.

use std::time::Duration;

use rand::Rng;

/// Binary-exponential backoff with jitter, capped. Attempts are zero-based.
pub fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exponential.min(cap);

    // Jitter in [50%, 100%] of the capped delay spreads synchronized
    // retries without ever collapsing to zero.
    let millis = capped.as_millis() as u64;
    if millis == 0 {
        return capped;
    }
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);

        for attempt in 0..10 {
            let delay = backoff_with_jitter(attempt, base, cap);
            assert!(delay <= cap);
            let uncapped = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
            assert!(delay >= uncapped.min(cap) / 2);
        }
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let delay = backoff_with_jitter(63, Duration::from_secs(1), Duration::from_secs(5));
        assert!(delay <= Duration::from_secs(5));
    }
}
