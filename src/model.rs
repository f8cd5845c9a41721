// =============================================================================
// Core domain entities (§3) shared across the cycle pipeline
// =============================================================================
//
// These are the semantic types the spec names, not raw exchange payloads —
// those live behind `ExchangeClient` in `exchange/mod.rs` and get translated
// into these types by the Market Data Fetcher and Portfolio View.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Action, AnalystId, Side, Symbol};

/// Per-symbol tick/step size and leverage bounds. Invariant: `min_leverage
/// <= max_leverage`; construction rejects a violation rather than storing it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContractSpec {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_leverage: u32,
    pub max_leverage: u32,
}

impl ContractSpec {
    pub fn new(tick_size: f64, step_size: f64, min_leverage: u32, max_leverage: u32) -> anyhow::Result<Self> {
        if min_leverage > max_leverage {
            anyhow::bail!("min_leverage ({min_leverage}) > max_leverage ({max_leverage})");
        }
        Ok(Self { tick_size, step_size, min_leverage, max_leverage })
    }
}

/// One symbol's market data as of a single fetch. All fields finite;
/// `funding_rate` is explicitly absent (`None`), never substituted with 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub current_price: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub funding_rate: Option<f64>,
    pub mark_price: f64,
    pub index_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub fetch_timestamp_ms: i64,
}

/// An open position as the engine sees it. At most one `Position` per
/// `(symbol, side)` — enforced by the Portfolio View, not by this type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub liquidation_price: Option<f64>,
}

/// Recent realized PnL as a percentage of balance, over two windows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecentPnl {
    pub day_pct: f64,
    pub week_pct: f64,
}

/// Aggregated account + position state for the cycle. `available_balance`
/// always comes from the exchange, never from local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioView {
    pub available_balance: f64,
    pub positions: HashMap<(Symbol, Side), Position>,
    pub recent_pnl: RecentPnl,
    pub daily_trade_count: u32,
    pub hold_times_hours: HashMap<(Symbol, Side), f64>,
}

/// One analyst's recommendation for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystOpinion {
    pub analyst_id: AnalystId,
    pub action: Action,
    pub symbol: Symbol,
    pub confidence: f64,
    pub rationale: String,
    pub thesis: String,
    pub recommended_leverage: u32,
    pub recommended_size_usd: f64,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub exit_plan: Option<String>,
}

/// The single decision the Judge collapses a panel of opinions into.
/// Invariant: `action == Hold` iff `winner == AnalystId::None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDecision {
    pub winner: AnalystId,
    pub action: Action,
    pub symbol: Symbol,
    pub confidence: f64,
    pub leverage: u32,
    pub allocation_usd: f64,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub rationale: String,
    pub exit_plan: Option<String>,
    pub warnings: Vec<String>,
}

impl FinalDecision {
    pub fn hold(rationale: impl Into<String>) -> Self {
        Self {
            winner: AnalystId::None,
            action: Action::Hold,
            symbol: String::new(),
            confidence: 0.0,
            leverage: 1,
            allocation_usd: 0.0,
            tp_price: None,
            sl_price: None,
            rationale: rationale.into(),
            exit_plan: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        (self.action == Action::Hold) == (self.winner == AnalystId::None)
    }
}

/// One cycle iteration's record. Frozen at `end_ms`; never mutated after.
///
/// `action` carries a named non-error outcome that isn't implied by
/// `trades_executed`/`errors` alone — currently only `"validation_rejected"`,
/// set when the Risk Governor rejects a decision. A governor rejection is not
/// a failure: the cycle still completes successfully, it just didn't trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_number: u64,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub symbols_analyzed: Vec<Symbol>,
    pub trades_executed: u32,
    pub analyses_run: u32,
    pub errors: Vec<String>,
    pub action: Option<String>,
}

impl Cycle {
    pub fn new(cycle_number: u64, start_ms: i64) -> Self {
        Self {
            cycle_number,
            start_ms,
            end_ms: None,
            symbols_analyzed: Vec::new(),
            trades_executed: 0,
            analyses_run: 0,
            errors: Vec::new(),
            action: None,
        }
    }
}

/// A trade tracked from entry-order acceptance until the Reconciler
/// observes the exchange report the position closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTrade {
    pub exchange_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub winner: AnalystId,
    pub opened_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_spec_rejects_inverted_leverage_bounds() {
        assert!(ContractSpec::new(0.1, 0.001, 20, 5).is_err());
        assert!(ContractSpec::new(0.1, 0.001, 5, 20).is_ok());
    }

    #[test]
    fn hold_decision_is_valid_by_construction() {
        let d = FinalDecision::hold("no analyst consensus");
        assert!(d.is_valid());
    }

    #[test]
    fn decision_with_winner_but_hold_action_is_invalid() {
        let mut d = FinalDecision::hold("x");
        d.winner = AnalystId::Named("a".to_string());
        assert!(!d.is_valid());
    }
}
