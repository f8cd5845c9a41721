// =============================================================================
// Anti-Churn (C8) — suppresses rapid re-entry on the same (symbol, side)
// =============================================================================
//
// Single process-wide table of last-trade timestamps per (symbol, side).
// Single-writer (Executor, after order acceptance), single-reader (Judge
// path via the cycle), both on the cycle thread — no locking beyond the
// RwLock needed for the status snapshot path.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{Action, Side, Symbol};

/// `(symbol, side) -> last trade timestamp`.
#[derive(Default)]
pub struct AntiChurnRecord {
    last_trade: RwLock<HashMap<(Symbol, Side), DateTime<Utc>>>,
}

impl AntiChurnRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exits (CLOSE/REDUCE) are never suppressed.
    pub fn allow(&self, symbol: &Symbol, side: Side, action: Action, cooldown: chrono::Duration) -> (bool, String) {
        if action.is_exit() {
            return (true, "exits are never suppressed".to_string());
        }

        let last_trade = self.last_trade.read();
        match last_trade.get(&(symbol.clone(), side)) {
            Some(last) => {
                let elapsed = Utc::now() - *last;
                if elapsed < cooldown {
                    (false, format!("cooldown active, {} remaining", (cooldown - elapsed)))
                } else {
                    (true, "cooldown elapsed".to_string())
                }
            }
            None => (true, "no prior trade on this (symbol, side)".to_string()),
        }
    }

    /// Called only after the Executor confirms order acceptance.
    pub fn record(&self, symbol: &Symbol, side: Side) {
        self.last_trade.write().insert((symbol.clone(), side), Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_first_trade_on_a_fresh_pair() {
        let record = AntiChurnRecord::new();
        let (allowed, _) = record.allow(&"BTCUSDT".to_string(), Side::Long, Action::Buy, chrono::Duration::seconds(900));
        assert!(allowed);
    }

    #[test]
    fn suppresses_re_entry_within_cooldown() {
        let record = AntiChurnRecord::new();
        record.record(&"BTCUSDT".to_string(), Side::Long);
        let (allowed, _) = record.allow(&"BTCUSDT".to_string(), Side::Long, Action::Buy, chrono::Duration::seconds(900));
        assert!(!allowed);
    }

    #[test]
    fn exits_are_never_suppressed_even_within_cooldown() {
        let record = AntiChurnRecord::new();
        record.record(&"BTCUSDT".to_string(), Side::Long);
        let (allowed, _) = record.allow(&"BTCUSDT".to_string(), Side::Long, Action::Close, chrono::Duration::seconds(900));
        assert!(allowed);
    }

    #[test]
    fn different_side_is_independent() {
        let record = AntiChurnRecord::new();
        record.record(&"BTCUSDT".to_string(), Side::Long);
        let (allowed, _) = record.allow(&"BTCUSDT".to_string(), Side::Short, Action::Sell, chrono::Duration::seconds(900));
        assert!(allowed);
    }
}
