// =============================================================================
// Analyst Panel (C6) — fan-out N analyst calls in parallel under one deadline
// =============================================================================
//
// Individual analyst failures are isolated: the panel returns the subset
// that succeeded plus a list of failures, and never cancels peers. Fewer
// than two survivors is surfaced as a cycle error so the Judge is never
// invoked on an under-strength panel.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::ai::AiClient;
use crate::model::{AnalystOpinion, MarketSnapshot, PortfolioView};
use crate::types::{Action, AnalystId, Symbol};

/// One configured analyst identity plus the client it calls through.
pub struct Analyst {
    pub id: AnalystId,
    pub client: Arc<dyn AiClient>,
    pub schema: Value,
}

pub struct PanelResult {
    pub opinions: HashMap<AnalystId, AnalystOpinion>,
    pub failures: Vec<(AnalystId, String)>,
}

/// Minimum surviving analysts required to proceed to the Judge.
const MIN_SURVIVORS: usize = 2;

/// Fan out one concurrent call per analyst under a shared deadline.
pub async fn consult(
    analysts: &[Analyst],
    prompt: &str,
    _snapshot: &HashMap<Symbol, MarketSnapshot>,
    _portfolio: &PortfolioView,
    deadline: Duration,
) -> Result<PanelResult> {
    let mut handles = Vec::with_capacity(analysts.len());

    for analyst in analysts {
        let id = analyst.id.clone();
        let client = Arc::clone(&analyst.client);
        let schema = analyst.schema.clone();
        let prompt = prompt.to_string();

        handles.push(tokio::spawn(async move {
            let result = tokio::time::timeout(deadline, client.generate(&prompt, &schema, deadline)).await;
            (id, result)
        }));
    }

    let mut opinions = HashMap::new();
    let mut failures = Vec::new();

    for handle in handles {
        match handle.await {
            Ok((id, Ok(Ok(json)))) => match parse_opinion(&id, &json) {
                Ok(opinion) => {
                    opinions.insert(id, opinion);
                }
                Err(e) => {
                    warn!(analyst = %id, error = %e, "analyst response failed schema parsing");
                    failures.push((id, e.to_string()));
                }
            },
            Ok((id, Ok(Err(e)))) => {
                warn!(analyst = %id, error = %e, "analyst call failed");
                failures.push((id, e.to_string()));
            }
            Ok((id, Err(_elapsed))) => {
                warn!(analyst = %id, "analyst call timed out");
                failures.push((id, "timed out".to_string()));
            }
            Err(join_err) => {
                warn!(error = %join_err, "analyst task panicked");
                failures.push((AnalystId::None, "task panicked".to_string()));
            }
        }
    }

    if opinions.len() < MIN_SURVIVORS {
        anyhow::bail!(
            "only {} of {} analysts succeeded, need at least {MIN_SURVIVORS}",
            opinions.len(),
            analysts.len()
        );
    }

    Ok(PanelResult { opinions, failures })
}

fn parse_opinion(id: &AnalystId, json: &Value) -> Result<AnalystOpinion> {
    let action = match json["action"].as_str().unwrap_or("") {
        "BUY" => Action::Buy,
        "SELL" => Action::Sell,
        "HOLD" => Action::Hold,
        "CLOSE" => Action::Close,
        "REDUCE" => Action::Reduce,
        other => anyhow::bail!("unknown action {other:?}"),
    };
    let symbol = json["symbol"].as_str().unwrap_or_default().to_string();
    let confidence = json["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 100.0);

    Ok(AnalystOpinion {
        analyst_id: id.clone(),
        action,
        symbol,
        confidence,
        rationale: json["rationale"].as_str().unwrap_or_default().to_string(),
        thesis: json["thesis"].as_str().unwrap_or_default().to_string(),
        recommended_leverage: json["recommendedLeverage"].as_u64().unwrap_or(1) as u32,
        recommended_size_usd: json["recommendedSizeUsd"].as_f64().unwrap_or(0.0),
        tp_price: json["tpPrice"].as_f64(),
        sl_price: json["slPrice"].as_f64(),
        exit_plan: json["exitPlan"].as_str().map(|s| s.to_string()),
    })
}

/// Pure detector: flags echo-chamber consensus when prior turns show >=75%
/// directional agreement. Re-runnable without side effects.
pub fn detect_echo_chamber(prior_directions: &[Action]) -> Option<String> {
    if prior_directions.len() < 4 {
        return None;
    }
    let buys = prior_directions.iter().filter(|a| **a == Action::Buy).count();
    let sells = prior_directions.iter().filter(|a| **a == Action::Sell).count();
    let total = prior_directions.len();
    let dominant = buys.max(sells);

    if dominant as f64 / total as f64 >= 0.75 {
        Some(format!("echo chamber: {dominant}/{total} prior turns shared one direction"))
    } else {
        None
    }
}

/// Pure detector: flags stop-loss clustering when prior stop prices fall
/// within 5% of each other.
pub fn detect_sl_clustering(prior_sl_prices: &[f64]) -> Option<String> {
    if prior_sl_prices.len() < 2 {
        return None;
    }
    let min = prior_sl_prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = prior_sl_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if min <= 0.0 {
        return None;
    }
    let spread_pct = (max - min) / min * 100.0;
    if spread_pct <= 5.0 {
        Some(format!("stop-loss clustering: {spread_pct:.1}% spread across prior turns"))
    } else {
        None
    }
}

/// How many judged turns to keep per symbol for the echo-chamber / stop-loss
/// detectors. Old enough turns age out rather than accumulating forever.
const HISTORY_DEPTH: usize = 8;

#[derive(Default)]
struct SymbolHistory {
    directions: VecDeque<Action>,
    sl_prices: VecDeque<f64>,
}

/// Rolling per-symbol record of judged turns, feeding `detect_echo_chamber`
/// and `detect_sl_clustering` so the panel can warn itself about its own
/// recent pattern before the next turn is decided. Updated once per cycle
/// after the Judge picks a non-hold action; consulted when the next cycle's
/// prompt is built.
#[derive(Default)]
pub struct AnalystHistory {
    per_symbol: Mutex<HashMap<Symbol, SymbolHistory>>,
}

impl AnalystHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one judged turn for `symbol`.
    pub fn record(&self, symbol: &Symbol, action: Action, sl_price: Option<f64>) {
        let mut table = self.per_symbol.lock();
        let history = table.entry(symbol.clone()).or_default();

        history.directions.push_back(action);
        if history.directions.len() > HISTORY_DEPTH {
            history.directions.pop_front();
        }

        if let Some(sl) = sl_price {
            history.sl_prices.push_back(sl);
            if history.sl_prices.len() > HISTORY_DEPTH {
                history.sl_prices.pop_front();
            }
        }
    }

    /// Warnings to surface in the prompt for `symbol`, derived from its
    /// recorded prior turns.
    pub fn warnings_for(&self, symbol: &Symbol) -> Vec<String> {
        let table = self.per_symbol.lock();
        let Some(history) = table.get(symbol) else {
            return Vec::new();
        };
        let directions: Vec<Action> = history.directions.iter().copied().collect();
        let sl_prices: Vec<f64> = history.sl_prices.iter().copied().collect();

        [detect_echo_chamber(&directions), detect_sl_clustering(&sl_prices)].into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::FakeAiClient;
    use serde_json::json;

    fn analyst(name: &str, client: Arc<dyn AiClient>) -> Analyst {
        Analyst { id: AnalystId::Named(name.to_string()), client, schema: json!({}) }
    }

    #[tokio::test]
    async fn collects_opinions_from_all_successful_analysts() {
        let analysts = vec![
            analyst("a", Arc::new(FakeAiClient::succeeding(json!({"action": "BUY", "symbol": "BTCUSDT", "confidence": 70})))),
            analyst("b", Arc::new(FakeAiClient::succeeding(json!({"action": "HOLD", "symbol": "BTCUSDT", "confidence": 50})))),
        ];
        let snapshot = HashMap::new();
        let portfolio = PortfolioView {
            available_balance: 1000.0,
            positions: HashMap::new(),
            recent_pnl: Default::default(),
            daily_trade_count: 0,
            hold_times_hours: HashMap::new(),
        };

        let result = consult(&analysts, "prompt", &snapshot, &portfolio, Duration::from_millis(500)).await.unwrap();
        assert_eq!(result.opinions.len(), 2);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn isolates_individual_failures() {
        let analysts = vec![
            analyst("a", Arc::new(FakeAiClient::succeeding(json!({"action": "BUY", "symbol": "BTCUSDT", "confidence": 70})))),
            analyst("b", Arc::new(FakeAiClient::failing("rate limited"))),
            analyst("c", Arc::new(FakeAiClient::succeeding(json!({"action": "HOLD", "symbol": "BTCUSDT", "confidence": 50})))),
        ];
        let snapshot = HashMap::new();
        let portfolio = PortfolioView {
            available_balance: 1000.0,
            positions: HashMap::new(),
            recent_pnl: Default::default(),
            daily_trade_count: 0,
            hold_times_hours: HashMap::new(),
        };

        let result = consult(&analysts, "prompt", &snapshot, &portfolio, Duration::from_millis(500)).await.unwrap();
        assert_eq!(result.opinions.len(), 2);
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn errors_when_fewer_than_two_survive() {
        let analysts = vec![
            analyst("a", Arc::new(FakeAiClient::failing("down"))),
            analyst("b", Arc::new(FakeAiClient::succeeding(json!({"action": "HOLD", "symbol": "BTCUSDT", "confidence": 50})))),
        ];
        let snapshot = HashMap::new();
        let portfolio = PortfolioView {
            available_balance: 1000.0,
            positions: HashMap::new(),
            recent_pnl: Default::default(),
            daily_trade_count: 0,
            hold_times_hours: HashMap::new(),
        };

        let result = consult(&analysts, "prompt", &snapshot, &portfolio, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[test]
    fn echo_chamber_flags_dominant_direction() {
        let dirs = vec![Action::Buy, Action::Buy, Action::Buy, Action::Sell];
        assert!(detect_echo_chamber(&dirs).is_some());
    }

    #[test]
    fn echo_chamber_silent_on_mixed_directions() {
        let dirs = vec![Action::Buy, Action::Sell, Action::Buy, Action::Sell];
        assert!(detect_echo_chamber(&dirs).is_none());
    }

    #[test]
    fn sl_clustering_flags_tight_spread() {
        assert!(detect_sl_clustering(&[100.0, 102.0, 101.0]).is_some());
    }

    #[test]
    fn sl_clustering_silent_on_wide_spread() {
        assert!(detect_sl_clustering(&[100.0, 150.0]).is_none());
    }

    #[test]
    fn analyst_history_warns_once_a_symbol_develops_echo_chamber() {
        let history = AnalystHistory::new();
        let symbol = "BTCUSDT".to_string();
        for _ in 0..4 {
            history.record(&symbol, Action::Buy, Some(58_000.0));
        }
        let warnings = history.warnings_for(&symbol);
        assert!(warnings.iter().any(|w| w.contains("echo chamber")));
    }

    #[test]
    fn analyst_history_is_silent_for_an_untouched_symbol() {
        let history = AnalystHistory::new();
        assert!(history.warnings_for(&"ETHUSDT".to_string()).is_empty());
    }

    #[test]
    fn analyst_history_caps_depth_per_symbol() {
        let history = AnalystHistory::new();
        let symbol = "BTCUSDT".to_string();
        for i in 0..(HISTORY_DEPTH + 5) {
            let action = if i % 2 == 0 { Action::Buy } else { Action::Sell };
            history.record(&symbol, action, None);
        }
        let table = history.per_symbol.lock();
        assert_eq!(table.get(&symbol).unwrap().directions.len(), HISTORY_DEPTH);
    }
}
