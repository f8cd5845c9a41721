// =============================================================================
// Rule-Based Manager (C12) — deterministic ladder on the most urgent
// position, no AI call
// =============================================================================
//
// Reorders the teacher's stop-loss/take-profit/trailing ladder into the
// spec's own ordering (target profit, stop loss, max hold, partial take);
// first matching rung wins, same early-continue shape as the exit ladder
// it's grounded on.
// =============================================================================

use crate::config::StrategyParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleAction {
    CloseFull,
    TakePartial { fraction: f64 },
    NoAction,
}

/// Fraction of the position closed on a partial take.
const PARTIAL_TAKE_FRACTION: f64 = 0.5;

/// Apply the ladder to one position's (pnlPct, holdHours). No AI call, no
/// TP/SL level adjustment — those require an AI-derived price.
pub fn evaluate(pnl_pct: f64, hold_hours: f64, params: &StrategyParams) -> RuleAction {
    if pnl_pct >= params.target_profit_pct {
        return RuleAction::CloseFull;
    }
    if pnl_pct <= -params.stop_loss_pct {
        return RuleAction::CloseFull;
    }
    if hold_hours >= params.max_hold_hours {
        return RuleAction::CloseFull;
    }
    if pnl_pct >= params.partial_tp_pct {
        return RuleAction::TakePartial { fraction: PARTIAL_TAKE_FRACTION };
    }
    RuleAction::NoAction
}
