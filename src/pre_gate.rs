// =============================================================================
// Pre-Gate (C5) — cheap checks that decide whether to run the full AI
// pipeline, manage positions directly, or skip the cycle
// =============================================================================
//
// Structurally the same shape as `risk.rs`'s ordered circuit breakers
// (daily loss / consecutive losses / drawdown / trade count): a sequence of
// cheap checks, the first violated one wins, no AI or exchange I/O involved.
// =============================================================================

use crate::model::{PortfolioView, Position};
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RunFull,
    DirectManage,
    RuleManage,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    VeryUrgent,
    Moderate,
    Low,
}

/// Classify one position's exit urgency from its PnL% and hold time.
/// Deterministic, no AI involved.
pub fn classify_urgency(pnl_pct: f64, hold_hours: f64) -> Urgency {
    if pnl_pct >= 5.0 || pnl_pct <= -5.0 || hold_hours >= 12.0 {
        Urgency::VeryUrgent
    } else if pnl_pct >= 2.0 || pnl_pct <= -2.5 || hold_hours >= 9.0 {
        Urgency::Moderate
    } else {
        Urgency::Low
    }
}

pub struct PreGateLimits {
    pub min_balance: f64,
    pub max_weekly_drawdown_pct: f64,
    pub max_daily_trades: u32,
    pub max_concurrent_positions: u32,
    pub max_same_direction_positions: u32,
}

/// The outcome of one gate evaluation, including the reporting field
/// `tokens_saved` and, for DIRECT_MANAGE, the most urgent position.
pub struct GateResult {
    pub verdict: Verdict,
    pub reason: String,
    pub most_urgent: Option<(Symbol, Side)>,
    pub tokens_saved: u32,
}

/// Cost weights for the reporting field, matching the panel's relative
/// share of total cycle cost (§2): a full AI pass is the expensive path,
/// direct/rule management and skip are progressively cheaper.
const FULL_COST: u32 = 100;
const DIRECT_MANAGE_COST: u32 = 20;
const RULE_MANAGE_COST: u32 = 10;
const SKIP_COST: u32 = 0;

fn finish(verdict: Verdict, reason: impl Into<String>, most_urgent: Option<(Symbol, Side)>) -> GateResult {
    let cost = match verdict {
        Verdict::RunFull => FULL_COST,
        Verdict::DirectManage => DIRECT_MANAGE_COST,
        Verdict::RuleManage => RULE_MANAGE_COST,
        Verdict::Skip => SKIP_COST,
    };
    GateResult { verdict, reason: reason.into(), most_urgent, tokens_saved: FULL_COST - cost }
}

/// Run the four ordered checks and produce exactly one verdict.
pub fn evaluate(portfolio: &PortfolioView, limits: &PreGateLimits) -> GateResult {
    if portfolio.available_balance < limits.min_balance {
        return finish(Verdict::Skip, "balance below minimum", None);
    }

    if portfolio.recent_pnl.week_pct < -limits.max_weekly_drawdown_pct {
        return finish(Verdict::Skip, "weekly drawdown limit breached", None);
    }

    if portfolio.daily_trade_count >= limits.max_daily_trades {
        return finish(Verdict::Skip, "daily trade count limit reached", None);
    }

    if !positions_at_limit(portfolio, limits) {
        return finish(Verdict::RunFull, "capacity available", None);
    }

    let urgencies: Vec<((Symbol, Side), Urgency)> = portfolio
        .positions
        .iter()
        .map(|(key, pos)| {
            let pnl_pct = if pos.entry_price > 0.0 && pos.size > 0.0 {
                (pos.unrealized_pnl / (pos.entry_price * pos.size)) * 100.0
            } else {
                0.0
            };
            let hold_hours = portfolio.hold_times_hours.get(key).copied().unwrap_or(0.0);
            (key.clone(), classify_urgency(pnl_pct, hold_hours))
        })
        .collect();

    if let Some((key, _)) = urgencies.iter().find(|(_, u)| *u == Urgency::VeryUrgent) {
        return finish(Verdict::DirectManage, "position requires urgent attention", Some(key.clone()));
    }

    if urgencies.iter().any(|(_, u)| *u == Urgency::Moderate) {
        return finish(Verdict::RuleManage, "position warrants rule-based management", None);
    }

    finish(Verdict::Skip, "positions at limit, none urgent", None)
}

fn positions_at_limit(portfolio: &PortfolioView, limits: &PreGateLimits) -> bool {
    if portfolio.positions.len() as u32 >= limits.max_concurrent_positions {
        return true;
    }

    let mut long_count = 0u32;
    let mut short_count = 0u32;
    for (_, side) in portfolio.positions.keys() {
        match side {
            Side::Long => long_count += 1,
            Side::Short => short_count += 1,
        }
    }
    long_count >= limits.max_same_direction_positions && short_count >= limits.max_same_direction_positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecentPnl;
    use std::collections::HashMap;

    fn base_limits() -> PreGateLimits {
        PreGateLimits {
            min_balance: 50.0,
            max_weekly_drawdown_pct: 15.0,
            max_daily_trades: 20,
            max_concurrent_positions: 3,
            max_same_direction_positions: 2,
        }
    }

    fn base_portfolio() -> PortfolioView {
        PortfolioView {
            available_balance: 1000.0,
            positions: HashMap::new(),
            recent_pnl: RecentPnl { day_pct: 0.0, week_pct: 0.0 },
            daily_trade_count: 0,
            hold_times_hours: HashMap::new(),
        }
    }

    #[test]
    fn classify_urgency_boundaries() {
        assert_eq!(classify_urgency(5.0, 0.0), Urgency::VeryUrgent);
        assert_eq!(classify_urgency(-5.0, 0.0), Urgency::VeryUrgent);
        assert_eq!(classify_urgency(0.0, 12.0), Urgency::VeryUrgent);
        assert_eq!(classify_urgency(2.0, 0.0), Urgency::Moderate);
        assert_eq!(classify_urgency(0.0, 9.0), Urgency::Moderate);
        assert_eq!(classify_urgency(0.0, 0.0), Urgency::Low);
    }

    #[test]
    fn skips_below_minimum_balance() {
        let mut p = base_portfolio();
        p.available_balance = 10.0;
        let result = evaluate(&p, &base_limits());
        assert_eq!(result.verdict, Verdict::Skip);
    }

    #[test]
    fn skips_on_weekly_drawdown_breach() {
        let mut p = base_portfolio();
        p.recent_pnl.week_pct = -20.0;
        assert_eq!(evaluate(&p, &base_limits()).verdict, Verdict::Skip);
    }

    #[test]
    fn skips_on_daily_trade_count_limit() {
        let mut p = base_portfolio();
        p.daily_trade_count = 20;
        assert_eq!(evaluate(&p, &base_limits()).verdict, Verdict::Skip);
    }

    #[test]
    fn runs_full_when_capacity_available() {
        let p = base_portfolio();
        let result = evaluate(&p, &base_limits());
        assert_eq!(result.verdict, Verdict::RunFull);
        assert_eq!(result.tokens_saved, 0);
    }

    #[test]
    fn direct_manages_most_urgent_position_at_capacity() {
        let mut p = base_portfolio();
        p.positions.insert(
            ("BTCUSDT".to_string(), Side::Long),
            Position { side: Side::Long, size: 1.0, entry_price: 100.0, leverage: 5, unrealized_pnl: 6.0, liquidation_price: None },
        );
        p.positions.insert(
            ("ETHUSDT".to_string(), Side::Long),
            Position { side: Side::Long, size: 1.0, entry_price: 100.0, leverage: 5, unrealized_pnl: 6.0, liquidation_price: None },
        );
        p.positions.insert(
            ("SOLUSDT".to_string(), Side::Short),
            Position { side: Side::Short, size: 1.0, entry_price: 100.0, leverage: 5, unrealized_pnl: 6.0, liquidation_price: None },
        );
        let result = evaluate(&p, &base_limits());
        assert_eq!(result.verdict, Verdict::DirectManage);
        assert!(result.most_urgent.is_some());
    }
}
