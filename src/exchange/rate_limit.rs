// =============================================================================
// Exchange Rate Budget — local pre-flight guard against Binance futures 429s
// =============================================================================
//
// Every cycle's full pipeline (C2) fans out a ticker + funding-rate call per
// universe symbol, plus one account and one positions call. None of that
// goes through a queue — the scheduler (C1) is the only cycle initiator, so
// the only backpressure available is refusing a call before it's sent and
// letting the caller's own retry-next-cycle path (and C1's exponential
// backoff) absorb the wait. This tracker is that pre-flight guard: it mirrors
// the three counters Binance itself reports back in response headers, and
// answers "would this call blow a limit" before the request goes out, rather
// than discovering it from a 429.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold — crossing it doesn't block calls, but signals the
/// caller should widen its own backoff before the hard limit bites.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 300;
/// Maximum orders per day.
const ORDER_1D_LIMIT: u32 = 1_200_000;

/// Counts orders placed within a rolling 10-second window and a calendar day.
/// Split out from the weight counter because the two families reset on
/// different clocks and are checked independently by `can_place_order`.
#[derive(Debug, Default)]
struct OrderCounters {
    per_10s: AtomicU32,
    per_day: AtomicU32,
}

impl OrderCounters {
    fn record_sent(&self) {
        self.per_10s.fetch_add(1, Ordering::Relaxed);
        self.per_day.fetch_add(1, Ordering::Relaxed);
    }

    fn allows_one_more(&self) -> bool {
        let count_10s = self.per_10s.load(Ordering::Relaxed);
        let count_1d = self.per_day.load(Ordering::Relaxed);

        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }
}

/// Thread-safe rate-limit tracker. Lock-free: every accessor is an atomic
/// load/store so any cycle's concurrent fan-out (C2's per-symbol fetches, or
/// a fan-out of TP/SL placements) can check it without contending on a lock.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    orders: OrderCounters,
}

/// Immutable snapshot of the current rate-limit state, exposed for the
/// Engine's `status()` projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self { used_weight_1m: AtomicU32::new(0), orders: OrderCounters::default() }
    }

    /// Update internal counters from the HTTP response headers Binance
    /// returns on every futures request. `X-MBX-USED-WEIGHT-1M` is
    /// authoritative over our own running estimate, since Binance counts
    /// weight server-side across all of this key's connections, not just
    /// ours.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
            } else if w >= WEIGHT_WARN_THRESHOLD {
                warn!(used_weight = w, "rate-limit weight remains above warning threshold");
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.orders.per_10s.store(c, Ordering::Relaxed);
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1D") {
            self.orders.per_day.store(c, Ordering::Relaxed);
        }
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(current_weight = current, requested_weight = weight, hard_limit = WEIGHT_HARD_LIMIT, "request blocked — would exceed rate-limit");
        }
        allowed
    }

    /// Return `true` if we're past the soft warning threshold — a hint that
    /// the caller should lengthen its own backoff (mirroring the scheduler's
    /// consecutive-failure backoff) rather than wait for the hard limit to
    /// start rejecting calls outright.
    pub fn should_backoff(&self) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_WARN_THRESHOLD
    }

    /// Return `true` if we can place another order without violating the 10s
    /// or daily order limit.
    pub fn can_place_order(&self) -> bool {
        self.orders.allows_one_more()
    }

    /// Manually increment the order counters, used before the exchange
    /// responds with updated headers.
    pub fn record_order_sent(&self) {
        self.orders.record_sent();
    }

    /// Reset the 10-second order counter (call from a periodic timer).
    pub fn reset_10s_counter(&self) {
        self.orders.per_10s.store(0, Ordering::Relaxed);
    }

    /// Reset the 1-minute weight counter (call from a periodic timer).
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    /// Reset the daily order counter (call at midnight UTC).
    pub fn reset_daily_counter(&self) {
        self.orders.per_day.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.orders.per_10s.load(Ordering::Relaxed),
            order_count_1d: self.orders.per_day.load(Ordering::Relaxed),
        }
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker").field("snapshot", &self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_allows_requests_and_orders() {
        let t = RateLimitTracker::new();
        assert!(t.can_send_request(100));
        assert!(t.can_place_order());
        assert!(!t.should_backoff());
    }

    #[test]
    fn order_10s_limit_blocks_once_reached() {
        let t = RateLimitTracker::new();
        for _ in 0..ORDER_10S_LIMIT {
            t.record_order_sent();
        }
        assert!(!t.can_place_order());
    }

    #[test]
    fn weight_hard_limit_blocks_oversized_request() {
        let t = RateLimitTracker::new();
        assert!(!t.can_send_request(WEIGHT_HARD_LIMIT + 1));
    }

    #[test]
    fn snapshot_reflects_recorded_orders() {
        let t = RateLimitTracker::new();
        t.record_order_sent();
        t.record_order_sent();
        let snap = t.snapshot();
        assert_eq!(snap.order_count_10s, 2);
        assert_eq!(snap.order_count_1d, 2);
    }

    #[test]
    fn should_backoff_crosses_at_warn_threshold() {
        let t = RateLimitTracker::new();
        t.used_weight_1m.store(WEIGHT_WARN_THRESHOLD, Ordering::Relaxed);
        assert!(t.should_backoff());
    }
}
