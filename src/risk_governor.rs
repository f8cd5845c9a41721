// =============================================================================
// Risk Governor (C9) — applies global risk limits to a FinalDecision
// =============================================================================
//
// An ordered pipeline, each step either adjusts or rejects. Generalizes the
// ATR-floor-clamping idiom (clamp a distance up to a configured minimum
// floor, never let the market's own indicator under-cut a safety bound)
// from single-asset SL/TP sizing to leverage, exposure, and liquidation
// distance. Pure over its inputs; the only "I/O" is the caller having
// already fetched the exposure figure.
// =============================================================================

use crate::config::StrategyParams;
use crate::contract_spec::{round_to_step, round_to_tick};
use crate::model::{ContractSpec, FinalDecision};
use crate::types::{Action, Side};

#[derive(Debug, Clone, PartialEq)]
pub enum GovernedDecision {
    Approved(FinalDecision),
    Rejected { reason: String },
}

pub struct GovernorInputs<'a> {
    pub decision: &'a FinalDecision,
    pub current_price: f64,
    pub side: Side,
    pub notional_exposure_pct: f64,
    pub equity: f64,
    pub contract_spec: ContractSpec,
    pub min_confidence: f64,
    pub params: &'a StrategyParams,
}

const HARD_LEVERAGE_CAP: u32 = 20;

pub fn govern(inputs: &GovernorInputs) -> GovernedDecision {
    let mut decision = inputs.decision.clone();

    // 1. Validate action.
    if decision.action.is_entry() && decision.confidence < inputs.min_confidence {
        return GovernedDecision::Rejected { reason: "confidence below floor for an entry action".to_string() };
    }
    if !decision.action.is_entry() && !decision.action.is_exit() && decision.action != Action::Hold {
        return GovernedDecision::Rejected { reason: "unrecognised action".to_string() };
    }
    if !decision.action.is_entry() {
        // HOLD/CLOSE/REDUCE bypass all downstream sizing steps.
        return GovernedDecision::Approved(decision);
    }

    // 2. Leverage auto-approval.
    if decision.leverage as f64 > inputs.params.auto_approve_leverage_threshold && decision.confidence < 70.0 {
        decision.leverage = inputs.params.auto_approve_leverage_threshold as u32;
        decision.warnings.push("leverage clamped to auto-approval threshold (confidence below 70%)".to_string());
    }

    // 3. Exposure-conditioned cap.
    let exposure_cap = inputs.params.max_leverage_for_exposure(inputs.notional_exposure_pct);
    if decision.leverage > exposure_cap {
        decision.leverage = exposure_cap;
        decision.warnings.push(format!("leverage clamped to {exposure_cap}x by exposure cap"));
    }

    // 4. Exchange + safety clamp.
    let spec = inputs.contract_spec;
    if spec.min_leverage > spec.max_leverage || spec.min_leverage > HARD_LEVERAGE_CAP {
        return GovernedDecision::Rejected { reason: "corrupted contract spec leverage bounds".to_string() };
    }
    let ceiling = spec.max_leverage.min(HARD_LEVERAGE_CAP);
    decision.leverage = decision.leverage.clamp(spec.min_leverage, ceiling);

    // 5. TP/SL direction.
    decision.tp_price = decision.tp_price.filter(|tp| match inputs.side {
        Side::Long => *tp > inputs.current_price,
        Side::Short => *tp < inputs.current_price,
    });
    decision.sl_price = decision.sl_price.filter(|sl| match inputs.side {
        Side::Long => *sl < inputs.current_price,
        Side::Short => *sl > inputs.current_price,
    });

    // 6. Stop-loss width vs. liquidation distance.
    if let Some(sl) = decision.sl_price {
        let liq_distance_pct = 100.0 / decision.leverage as f64;
        let max_sl_pct = inputs.params.required_max_sl_pct(decision.leverage).min(0.8 * liq_distance_pct);
        let sl_distance_pct = ((inputs.current_price - sl).abs() / inputs.current_price) * 100.0;

        if sl_distance_pct > max_sl_pct {
            let tightened_distance = inputs.current_price * (max_sl_pct / 100.0);
            let tightened = match inputs.side {
                Side::Long => inputs.current_price - tightened_distance,
                Side::Short => inputs.current_price + tightened_distance,
            };
            if tightened.is_finite() && tightened > 0.0 {
                decision.sl_price = Some(tightened);
                decision.warnings.push(format!("stop loss tightened to {max_sl_pct:.2}% of price"));
            } else {
                decision.warnings.push("recomputed stop loss was non-finite, keeping original".to_string());
            }
        }
    }

    // 7. Size.
    if inputs.current_price <= 0.0 {
        return GovernedDecision::Rejected { reason: "non-positive current price".to_string() };
    }
    let raw_size = decision.allocation_usd / inputs.current_price;
    match round_to_step(raw_size, spec.step_size) {
        Ok(size) => decision.allocation_usd = size * inputs.current_price,
        Err(e) => return GovernedDecision::Rejected { reason: format!("size rejected: {e}") },
    }

    if let Some(tp) = decision.tp_price {
        decision.tp_price = Some(round_to_tick(tp, spec.tick_size));
    }
    if let Some(sl) = decision.sl_price {
        decision.sl_price = Some(round_to_tick(sl, spec.tick_size));
    }

    // 8. Monte-Carlo advisory (non-blocking).
    if let (Some(tp), Some(sl)) = (decision.tp_price, decision.sl_price) {
        let tp_pct = ((tp - inputs.current_price).abs() / inputs.current_price) * 100.0;
        let sl_pct = ((inputs.current_price - sl).abs() / inputs.current_price) * 100.0;
        if let Some(advisory) = monte_carlo_advisory(tp_pct, sl_pct) {
            decision.warnings.push(advisory);
        }
    }

    GovernedDecision::Approved(decision)
}

/// Non-blocking advisory: a simple survival-odds estimate assuming default
/// hourly volatility, annotated as a warning rather than a rejection.
const DEFAULT_HOURLY_VOL_PCT: f64 = 0.8;

fn monte_carlo_advisory(tp_pct: f64, sl_pct: f64) -> Option<String> {
    if tp_pct <= 0.0 || sl_pct <= 0.0 {
        return None;
    }
    let reward_risk = tp_pct / sl_pct;
    let hours_to_sl = (sl_pct / DEFAULT_HOURLY_VOL_PCT).max(0.1);
    if reward_risk < 1.0 {
        Some(format!("unfavorable reward:risk ({reward_risk:.2}), est. {hours_to_sl:.1}h to stop distance at default volatility"))
    } else {
        None
    }
}
