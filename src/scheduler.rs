// =============================================================================
// Clock & Scheduler (C1) — paces cycles, backs off on failure and on quiet
// markets, owns cancellation
// =============================================================================
//
// `compute_sleep` is pure so the six backoff scenarios can be tested against
// literal `Duration` values without a real sleep. `cancellable_sleep` is the
// one place the loop actually suspends between cycles, raced against the
// cancellation signal the way the teacher races its reconnect sleeps against
// a detected failure, generalized to cooperative cancellation via `Notify`.
// =============================================================================

use std::time::Duration;

use tokio::sync::Notify;

/// Compute the inter-cycle sleep duration (§4.1).
///
/// `base` is the configured cycle interval, `elapsed` is how long the cycle
/// that just completed took to run. Failure backoff takes priority over
/// quiet-market backoff; they never compound.
pub fn compute_sleep(base: Duration, elapsed: Duration, consecutive_failures: u32, consecutive_holds: u32) -> Duration {
    let mut sleep = base.saturating_sub(elapsed);

    if consecutive_failures >= 1 {
        let factor = 1.5f64.powi(consecutive_failures as i32);
        let scaled = sleep.mul_f64(factor);
        sleep = scaled.min(base * 4);
    } else if consecutive_holds >= 3 {
        let factor = 1.0 + 0.25 * (consecutive_holds as f64 - 2.0);
        let scaled = sleep.mul_f64(factor);
        sleep = scaled.min(base * 2);
    }

    sleep
}

/// Consecutive-failure threshold at which the Engine trips its circuit
/// breaker and stops itself (§4.1, P7).
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 10;

/// Sleep for `duration`, or return early if `cancel` is notified first.
/// Used between cycles so a `stop()` call aborts an in-flight sleep
/// immediately rather than waiting out the backoff.
pub async fn cancellable_sleep(duration: Duration, cancel: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.notified() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backoff_when_healthy_and_active() {
        let sleep = compute_sleep(Duration::from_secs(60), Duration::from_secs(10), 0, 0);
        assert_eq!(sleep, Duration::from_secs(50));
    }

    #[test]
    fn elapsed_longer_than_base_yields_zero_sleep() {
        let sleep = compute_sleep(Duration::from_secs(60), Duration::from_secs(90), 0, 0);
        assert_eq!(sleep, Duration::ZERO);
    }

    #[test]
    fn single_failure_applies_exponential_backoff() {
        let base = Duration::from_secs(60);
        let sleep = compute_sleep(base, Duration::from_secs(0), 1, 0);
        assert_eq!(sleep, Duration::from_millis((60_000.0 * 1.5) as u64));
    }

    #[test]
    fn failure_backoff_is_capped_at_four_times_base() {
        let base = Duration::from_secs(60);
        let sleep = compute_sleep(base, Duration::from_secs(0), 20, 0);
        assert_eq!(sleep, base * 4);
    }

    #[test]
    fn quiet_market_backoff_only_kicks_in_at_three_holds() {
        let base = Duration::from_secs(60);
        let at_two = compute_sleep(base, Duration::from_secs(0), 0, 2);
        let at_three = compute_sleep(base, Duration::from_secs(0), 0, 3);
        assert_eq!(at_two, base);
        assert!(at_three > base);
    }

    #[test]
    fn quiet_market_backoff_is_capped_at_twice_base() {
        let base = Duration::from_secs(60);
        let sleep = compute_sleep(base, Duration::from_secs(0), 0, 50);
        assert_eq!(sleep, base * 2);
    }

    #[test]
    fn failure_backoff_takes_priority_over_hold_backoff() {
        let base = Duration::from_secs(60);
        let both = compute_sleep(base, Duration::from_secs(0), 1, 10);
        let failure_only = compute_sleep(base, Duration::from_secs(0), 1, 0);
        assert_eq!(both, failure_only);
    }

    #[tokio::test]
    async fn cancellation_aborts_sleep_immediately() {
        let cancel = Notify::new();
        cancel.notify_one();
        let completed = cancellable_sleep(Duration::from_secs(3600), &cancel).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_completes_normally_without_cancellation() {
        let cancel = Notify::new();
        let completed = cancellable_sleep(Duration::from_millis(1), &cancel).await;
        assert!(completed);
    }
}
