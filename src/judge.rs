// =============================================================================
// Judge (C7) — collapses a panel of AnalystOpinions into one FinalDecision
// =============================================================================
//
// Generalizes the allow/blocked constructor idiom from a single-strategy
// decision envelope into a multi-opinion collapse: exactly one FinalDecision
// comes out, with HOLD/NONE as the safe default when opinions disagree or
// no opinion clears the confidence floor.
// =============================================================================

use std::collections::HashMap;

use crate::model::{AnalystOpinion, FinalDecision};
use crate::types::{Action, AnalystId};

/// Collapse a panel's opinions into one decision. `confidence_floor` is the
/// configured minimum confidence (default 60).
pub fn judge(opinions: &HashMap<AnalystId, AnalystOpinion>, confidence_floor: f64) -> FinalDecision {
    let eligible: Vec<&AnalystOpinion> = opinions
        .values()
        .filter(|o| o.action.is_exit() || o.confidence >= confidence_floor)
        .collect();

    if eligible.is_empty() {
        return FinalDecision::hold("no opinion cleared the confidence floor");
    }

    if !directions_agree(&eligible) {
        return FinalDecision::hold("analyst panel disagreed on direction");
    }

    let winner = eligible
        .iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .expect("eligible is non-empty");

    let mut warnings = Vec::new();
    if winner.recommended_leverage == 0 {
        warnings.push("winning opinion recommended zero leverage, defaulting to 1".to_string());
    }

    FinalDecision {
        winner: winner.analyst_id.clone(),
        action: winner.action,
        symbol: winner.symbol.clone(),
        confidence: winner.confidence,
        leverage: winner.recommended_leverage.max(1),
        allocation_usd: winner.recommended_size_usd.max(0.0),
        tp_price: winner.tp_price,
        sl_price: winner.sl_price,
        rationale: winner.rationale.clone(),
        exit_plan: winner.exit_plan.clone(),
        warnings,
    }
}

/// All eligible opinions must point at the same symbol and, among entries
/// (BUY/SELL), the same direction. Exits never conflict with entries here
/// since the panel is expected to converge on one symbol per cycle; a
/// cross-symbol split is itself treated as disagreement.
fn directions_agree(eligible: &[&AnalystOpinion]) -> bool {
    let first_symbol = &eligible[0].symbol;
    if eligible.iter().any(|o| &o.symbol != first_symbol) {
        return false;
    }

    let entries: Vec<Action> = eligible.iter().map(|o| o.action).filter(|a| a.is_entry()).collect();
    if entries.is_empty() {
        return true;
    }
    let first = entries[0];
    entries.iter().all(|a| *a == first)
}
