//! Bounded health polling.

use crate::error::{ShadowError, ShadowResult};
use std::time::{Duration, Instant};

/// Poll `probe` every `interval` until it returns true or `budget` is spent.
///
/// Returns the time waited. Never sleeps past the budget.
pub fn wait_until<F>(what: &str, budget: Duration, interval: Duration, mut probe: F) -> ShadowResult<Duration>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if probe() {
            let waited = started.elapsed();
            tracing::debug!(what, attempt, waited_ms = waited.as_millis() as u64, "ready");
            return Ok(waited);
        }

        let elapsed = started.elapsed();
        if elapsed >= budget {
            tracing::warn!(what, attempt, "health check budget exhausted");
            return Err(ShadowError::Timeout {
                what: what.to_string(),
                seconds: budget.as_secs_f64(),
            });
        }

        tracing::debug!(what, attempt, "not ready yet");
        std::thread::sleep(interval.min(budget - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_once_probe_succeeds() {
        let mut calls = 0;
        let waited = wait_until("thing", Duration::from_secs(5), Duration::from_millis(1), || {
            calls += 1;
            calls >= 3
        })
        .unwrap();

        assert_eq!(calls, 3);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn never_ready_times_out_within_budget() {
        let started = Instant::now();
        let err = wait_until(
            "sidecar",
            Duration::from_millis(100),
            Duration::from_millis(30),
            || false,
        )
        .unwrap_err();

        assert!(matches!(err, ShadowError::Timeout { ref what, .. } if what == "sidecar"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn zero_budget_probes_once() {
        let mut calls = 0;
        let result = wait_until("x", Duration::ZERO, Duration::from_secs(10), || {
            calls += 1;
            false
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
