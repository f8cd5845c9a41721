// =============================================================================
// Engine (C13) — wires every component, owns the cycle record and counters
// =============================================================================
//
// Generalizes the teacher's `AppState` composition-root idiom: one struct
// holding `Arc`s to every subsystem, plus the mutable counters that only the
// cycle thread ever mutates. Unlike `AppState` this isn't a dashboard
// snapshot source feeding a websocket push loop — `status()` is a read-only
// projection for an external caller to poll, nothing here serves HTTP.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::analyst_panel::{self, Analyst, AnalystHistory};
use crate::anti_churn::AntiChurnRecord;
use crate::config::EngineConfig;
use crate::contract_spec::ContractSpecCache;
use crate::events::{CycleSummary, EngineEvent, EventBus};
use crate::exchange::ExchangeClient;
use crate::executor::Executor;
use crate::judge;
use crate::market_data;
use crate::model::{Cycle, FinalDecision};
use crate::portfolio::{derived_current_price, PortfolioTracker};
use crate::pre_gate::{self, PreGateLimits, Verdict};
use crate::reconciler::{Reconciler, TrackedTradeRegistry};
use crate::risk_governor::{self, GovernedDecision, GovernorInputs};
use crate::rule_based_manager::{self, RuleAction};
use crate::scheduler;
use crate::storage::Storage;
use crate::types::{Action, AnalystId, MarginMode, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Default)]
struct Counters {
    cycle_count: u64,
    consecutive_failures: u32,
    consecutive_holds: u32,
    total_analyses_run: u64,
    total_tokens_saved: u64,
}

/// Read-only projection of engine state, analogous to the donor's
/// `AppState::build_snapshot` / `StateSnapshot` but scoped to what an
/// external caller needs to poll — no HTTP surface lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub cycle_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_holds: u32,
    pub total_analyses_run: u64,
    pub total_tokens_saved: u64,
    pub last_cycle: Option<Cycle>,
}

pub struct Engine {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    storage: Arc<dyn Storage>,
    contract_specs: Arc<ContractSpecCache>,
    portfolio: Arc<PortfolioTracker>,
    anti_churn: Arc<AntiChurnRecord>,
    tracked_trades: Arc<TrackedTradeRegistry>,
    executor: Executor,
    reconciler: Reconciler,
    analysts: Vec<Analyst>,
    analyst_history: AnalystHistory,
    events: EventBus,

    state: Mutex<EngineState>,
    counters: Mutex<Counters>,
    last_cycle: Mutex<Option<Cycle>>,
    cancel: Notify,
    cancelled: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, exchange: Arc<dyn ExchangeClient>, storage: Arc<dyn Storage>, analysts: Vec<Analyst>) -> Self {
        let contract_specs = Arc::new(ContractSpecCache::new(exchange.clone(), Duration::from_secs(config.contract_spec_refresh_secs)));
        let portfolio = Arc::new(PortfolioTracker::new(exchange.clone(), storage.clone()));
        let anti_churn = Arc::new(AntiChurnRecord::new());
        let tracked_trades = Arc::new(TrackedTradeRegistry::new());

        let executor = Executor::new(exchange.clone(), storage.clone(), portfolio.clone(), anti_churn.clone(), tracked_trades.clone(), config.dry_run);
        let reconciler = Reconciler::new(exchange.clone(), storage.clone(), portfolio.clone(), tracked_trades.clone());

        Self {
            config,
            exchange,
            storage,
            contract_specs,
            portfolio,
            anti_churn,
            tracked_trades,
            executor,
            reconciler,
            analysts,
            analyst_history: AnalystHistory::new(),
            events: EventBus::new(),
            state: Mutex::new(EngineState::Idle),
            counters: Mutex::new(Counters::default()),
            last_cycle: Mutex::new(None),
            cancel: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn status(&self) -> EngineStatus {
        let counters = self.counters.lock();
        EngineStatus {
            state: *self.state.lock(),
            cycle_count: counters.cycle_count,
            consecutive_failures: counters.consecutive_failures,
            consecutive_holds: counters.consecutive_holds,
            total_analyses_run: counters.total_analyses_run,
            total_tokens_saved: counters.total_tokens_saved,
            last_cycle: self.last_cycle.lock().clone(),
        }
    }

    /// Signal cancellation. Any in-flight sleep aborts immediately; the
    /// current cycle finishes its current step, then the loop exits.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run cycles sequentially until cancelled or the circuit breaker trips.
    /// Concurrent `start()` calls are serialized by `state`: a second call
    /// observing anything other than IDLE becomes a no-op.
    pub async fn run_forever(self: Arc<Self>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Idle {
                return Ok(());
            }
            *state = EngineState::Starting;
        }

        if let Err(e) = self.startup_check().await {
            error!(error = %e, "fatal startup error, refusing to start");
            *self.state.lock() = EngineState::Idle;
            return Err(e);
        }

        self.log_config_summary();
        *self.state.lock() = EngineState::Running;
        self.cancelled.store(false, Ordering::SeqCst);
        self.events.publish(EngineEvent::Started);
        info!("engine started");

        loop {
            if self.is_cancelled() {
                break;
            }

            let base = Duration::from_millis(self.config.cycle_interval_ms);
            let cycle_start = Instant::now();

            let cycle = self.run_cycle().await;

            let (failures, holds) = self.complete_cycle(cycle);
            if failures >= scheduler::CIRCUIT_BREAKER_THRESHOLD {
                warn!(failures, "circuit breaker tripped, stopping engine");
                *self.state.lock() = EngineState::Stopping;
                break;
            }

            if self.is_cancelled() {
                break;
            }

            let elapsed = cycle_start.elapsed();
            let sleep = scheduler::compute_sleep(base, elapsed, failures, holds);
            if !scheduler::cancellable_sleep(sleep, &self.cancel).await {
                break;
            }
        }

        *self.state.lock() = EngineState::Idle;
        self.events.publish(EngineEvent::Stopped);
        info!("engine stopped");
        Ok(())
    }

    /// One round-trip to the exchange plus a contract spec fetch before the
    /// first cycle. Refuses to start if either is unavailable after retry.
    async fn startup_check(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        self.exchange.get_account_assets().await.context("startup connectivity check: account assets unreachable")?;

        if self.contract_specs.refresh_if_stale(&self.config.symbols).await.is_err() {
            // Retry once before declaring a fatal startup error.
            self.contract_specs
                .refresh_if_stale(&self.config.symbols)
                .await
                .context("startup connectivity check: contract specs unavailable after retry")?;
        }

        Ok(())
    }

    fn log_config_summary(&self) {
        info!(
            symbols = ?self.config.symbols,
            cycle_interval_ms = self.config.cycle_interval_ms,
            min_confidence = self.config.min_confidence,
            max_daily_trades = self.config.max_daily_trades,
            max_concurrent_positions = self.config.max_concurrent_positions,
            dry_run = self.config.dry_run,
            "engine configuration resolved"
        );
    }

    /// Freeze the cycle, fold its outcome into the owned counters, publish
    /// a completion event, and return the post-update (failures, holds)
    /// pair for the scheduler to compute backoff from.
    fn complete_cycle(&self, mut cycle: Cycle) -> (u32, u32) {
        cycle.end_ms = Some(Utc::now().timestamp_millis());
        let succeeded = cycle.errors.is_empty();

        let mut counters = self.counters.lock();
        counters.cycle_count += 1;
        counters.total_analyses_run += cycle.analyses_run as u64;

        if succeeded {
            counters.consecutive_failures = 0;
        } else {
            counters.consecutive_failures += 1;
        }

        if cycle.trades_executed == 0 && succeeded {
            counters.consecutive_holds += 1;
        } else {
            counters.consecutive_holds = 0;
        }

        let failures = counters.consecutive_failures;
        let holds = counters.consecutive_holds;
        drop(counters);

        let summary = CycleSummary {
            cycle: cycle.cycle_number,
            action: cycle.action.clone().unwrap_or_else(|| {
                if cycle.trades_executed > 0 { "executed".to_string() } else { "no-op".to_string() }
            }),
            symbol: cycle.symbols_analyzed.first().cloned(),
            error_count: cycle.errors.len() as u32,
        };
        self.events.publish(EngineEvent::CycleComplete { cycle: summary });

        *self.last_cycle.lock() = Some(cycle);
        (failures, holds)
    }

    async fn run_cycle(&self) -> Cycle {
        let cycle_number = self.counters.lock().cycle_count + 1;
        let start_ms = Utc::now().timestamp_millis();
        let mut cycle = Cycle::new(cycle_number, start_ms);
        self.events.publish(EngineEvent::CycleStart { n: cycle_number });

        if let Err(e) = self.contract_specs.refresh_if_stale(&self.config.symbols).await {
            warn!(error = %e, "contract spec refresh failed, serving stale data");
            cycle.errors.push(format!("contract spec refresh: {e}"));
        }

        let daily_trade_count = self.tracked_trades.all().iter().filter(|t| t.opened_at.date_naive() == Utc::now().date_naive()).count() as u32;

        let portfolio = match self.portfolio.snapshot(daily_trade_count).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "portfolio snapshot failed, ending cycle early");
                cycle.errors.push(format!("portfolio snapshot: {e}"));
                return cycle;
            }
        };

        let limits = PreGateLimits {
            min_balance: self.config.min_balance,
            max_weekly_drawdown_pct: self.config.max_weekly_drawdown_pct,
            max_daily_trades: self.config.max_daily_trades,
            max_concurrent_positions: self.config.max_concurrent_positions,
            max_same_direction_positions: self.config.max_same_direction_positions,
        };
        let gate = pre_gate::evaluate(&portfolio, &limits);
        {
            let mut counters = self.counters.lock();
            counters.total_tokens_saved += gate.tokens_saved as u64;
        }

        match gate.verdict {
            Verdict::Skip => {
                info!(reason = %gate.reason, "pre-gate skipped this cycle");
            }
            Verdict::DirectManage => {
                if let Some((symbol, side)) = gate.most_urgent {
                    self.manage_position(&mut cycle, &portfolio, &symbol, side).await;
                }
            }
            Verdict::RuleManage => {
                if let Some((symbol, side)) = most_urgent_position(&portfolio) {
                    self.manage_position(&mut cycle, &portfolio, &symbol, side).await;
                }
            }
            Verdict::RunFull => {
                self.run_full_pipeline(&mut cycle, &portfolio).await;
            }
        }

        if let Err(e) = self.reconciler.reconcile().await {
            warn!(error = %e, "reconciliation pass failed");
            cycle.errors.push(format!("reconciliation: {e}"));
        }

        cycle
    }

    /// RUN_FULL: fetch market data, consult the analyst panel, judge, govern,
    /// execute.
    async fn run_full_pipeline(&self, cycle: &mut Cycle, portfolio: &crate::model::PortfolioView) {
        let timeout = Duration::from_millis(self.config.analyst_timeout_ms);
        let snapshot = market_data::fetch(&self.exchange, &self.config.symbols, timeout).await;
        cycle.symbols_analyzed = snapshot.keys().cloned().collect();

        if snapshot.is_empty() {
            cycle.errors.push("market data fetch returned no symbols".to_string());
            return;
        }

        let history_warnings: std::collections::HashMap<String, Vec<String>> =
            snapshot.keys().map(|symbol| (symbol.clone(), self.analyst_history.warnings_for(symbol))).collect();
        let prompt = build_prompt(&snapshot, portfolio, &history_warnings);

        let panel = match analyst_panel::consult(&self.analysts, &prompt, &snapshot, portfolio, timeout).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "analyst panel under-strength, skipping judge");
                cycle.errors.push(format!("analyst panel: {e}"));
                return;
            }
        };
        cycle.analyses_run = panel.opinions.len() as u32;

        let decision = judge::judge(&panel.opinions, self.config.min_confidence);
        if decision.action == Action::Hold {
            info!(reason = %decision.rationale, "judge returned hold");
            return;
        }
        self.analyst_history.record(&decision.symbol, decision.action, decision.sl_price);

        let current_price = match snapshot.get(&decision.symbol) {
            Some(s) => s.current_price,
            None => {
                cycle.errors.push(format!("judge picked symbol {} outside this cycle's snapshot", decision.symbol));
                return;
            }
        };
        let side = if decision.action == Action::Buy { Side::Long } else { Side::Short };

        self.govern_and_execute(cycle, portfolio, decision, side, current_price).await;
    }

    /// DIRECT_MANAGE / RULE_MANAGE: apply the deterministic ladder to one
    /// position, no AI call.
    async fn manage_position(&self, cycle: &mut Cycle, portfolio: &crate::model::PortfolioView, symbol: &str, side: Side) {
        let position = match portfolio.positions.get(&(symbol.to_string(), side)) {
            Some(p) => *p,
            None => return,
        };

        let current_price = derived_current_price(&position, None);
        let pnl_pct = if position.entry_price > 0.0 && position.size > 0.0 {
            (position.unrealized_pnl / (position.entry_price * position.size)) * 100.0
        } else {
            0.0
        };
        let hold_hours = portfolio.hold_times_hours.get(&(symbol.to_string(), side)).copied().unwrap_or(0.0);

        let action = rule_based_manager::evaluate(pnl_pct, hold_hours, &self.config.strategy_params);
        let notional = position.entry_price * position.size;

        let decision = match action {
            RuleAction::NoAction => return,
            RuleAction::CloseFull => FinalDecision {
                winner: AnalystId::None,
                action: Action::Close,
                symbol: symbol.to_string(),
                confidence: 0.0,
                leverage: position.leverage,
                allocation_usd: notional,
                tp_price: None,
                sl_price: None,
                rationale: "rule-based manager: close".to_string(),
                exit_plan: None,
                warnings: Vec::new(),
            },
            RuleAction::TakePartial { fraction } => FinalDecision {
                winner: AnalystId::None,
                action: Action::Reduce,
                symbol: symbol.to_string(),
                confidence: 0.0,
                leverage: position.leverage,
                allocation_usd: notional * fraction,
                tp_price: None,
                sl_price: None,
                rationale: "rule-based manager: partial take".to_string(),
                exit_plan: None,
                warnings: Vec::new(),
            },
        };

        self.govern_and_execute(cycle, portfolio, decision, side, current_price).await;
    }

    async fn govern_and_execute(&self, cycle: &mut Cycle, portfolio: &crate::model::PortfolioView, decision: FinalDecision, side: Side, current_price: f64) {
        let spec = match self.contract_specs.get(&decision.symbol) {
            Some(s) => s,
            None => {
                cycle.errors.push(format!("no contract spec cached for {}", decision.symbol));
                return;
            }
        };

        let open_notional: f64 = portfolio.positions.values().map(|p| p.entry_price * p.size).sum();
        let equity = portfolio.available_balance + open_notional;
        let notional_exposure_pct = if equity > 0.0 { (open_notional / equity) * 100.0 } else { 0.0 };

        let inputs = GovernorInputs {
            decision: &decision,
            current_price,
            side,
            notional_exposure_pct,
            equity,
            contract_spec: spec,
            min_confidence: self.config.min_confidence,
            params: &self.config.strategy_params,
        };

        match risk_governor::govern(&inputs) {
            GovernedDecision::Rejected { reason } => {
                // A governor rejection is a validated "no" — the cycle still
                // completes successfully, it must not count as a failure.
                info!(symbol = %decision.symbol, %reason, "governor rejected decision");
                cycle.action = Some("validation_rejected".to_string());
            }
            GovernedDecision::Approved(approved) => {
                if approved.action == Action::Hold {
                    return;
                }

                let (allowed, reason) = self.anti_churn.allow(&approved.symbol, side, approved.action, chrono::Duration::seconds(self.config.anti_churn_cooldown_secs as i64));
                if !allowed {
                    info!(symbol = %approved.symbol, %reason, "anti-churn suppressed trade");
                    return;
                }

                match self.executor.execute(&approved, side, current_price, MarginMode::Cross).await {
                    Ok(outcome) => {
                        info!(symbol = %approved.symbol, ?outcome, "execution outcome");
                        if !matches!(outcome, crate::executor::ExecutionOutcome::NoAction) {
                            cycle.trades_executed += 1;
                        }
                    }
                    Err(e) => {
                        error!(symbol = %approved.symbol, error = %e, "execution failed");
                        cycle.errors.push(format!("execution: {e}"));
                    }
                }
            }
        }
    }
}

fn most_urgent_position(portfolio: &crate::model::PortfolioView) -> Option<(String, Side)> {
    portfolio
        .positions
        .iter()
        .map(|(key, pos)| {
            let pnl_pct = if pos.entry_price > 0.0 && pos.size > 0.0 {
                (pos.unrealized_pnl / (pos.entry_price * pos.size)) * 100.0
            } else {
                0.0
            };
            let hold_hours = portfolio.hold_times_hours.get(key).copied().unwrap_or(0.0);
            (key.clone(), pre_gate::classify_urgency(pnl_pct, hold_hours))
        })
        .max_by_key(|(_, urgency)| match urgency {
            pre_gate::Urgency::VeryUrgent => 2,
            pre_gate::Urgency::Moderate => 1,
            pre_gate::Urgency::Low => 0,
        })
        .map(|(key, _)| key)
}

fn build_prompt(
    snapshot: &std::collections::HashMap<String, crate::model::MarketSnapshot>,
    portfolio: &crate::model::PortfolioView,
    history_warnings: &std::collections::HashMap<String, Vec<String>>,
) -> String {
    let mut prompt = format!(
        "Universe snapshot for {} symbols. Available balance: {:.2}. Open positions: {}.",
        snapshot.len(),
        portfolio.available_balance,
        portfolio.positions.len()
    );

    let warnings: Vec<&String> = history_warnings.values().flatten().collect();
    if !warnings.is_empty() {
        prompt.push_str(" Prior-turn warnings: ");
        prompt.push_str(&warnings.iter().map(|w| w.as_str()).collect::<Vec<_>>().join("; "));
        prompt.push('.');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::FakeAiClient;
    use crate::exchange::{
        AccountAssets, HistoryOrder, PlaceOrderRequest, PlaceOrderResponse, PlaceTpSlRequest, RawContractSpec, RawPosition, Ticker,
    };
    use crate::storage::InMemoryStorage;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeExchange {
        price: f64,
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn get_account_assets(&self) -> Result<AccountAssets> {
            Ok(AccountAssets { available: 1000.0, equity: 1000.0 })
        }
        async fn get_ticker(&self, _symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                current_price: self.price,
                high_24h: self.price,
                low_24h: self.price,
                volume_24h: 0.0,
                change_24h: 0.0,
                mark_price: self.price,
                index_price: self.price,
                best_bid: self.price,
                best_ask: self.price,
            })
        }
        async fn get_funding_rate(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn get_contracts(&self) -> Result<HashMap<String, RawContractSpec>> {
            let mut m = HashMap::new();
            m.insert("BTCUSDT".to_string(), RawContractSpec { tick_size: 0.1, step_size: 0.001, min_leverage: 1, max_leverage: 20 });
            Ok(m)
        }
        async fn get_positions(&self) -> Result<HashMap<(String, Side), RawPosition>> {
            Ok(HashMap::new())
        }
        async fn get_history_orders(&self, _symbol: &str, _limit: u32) -> Result<Vec<HistoryOrder>> {
            Ok(Vec::new())
        }
        async fn change_leverage(&self, _symbol: &str, _leverage: u32, _margin_mode: MarginMode) -> Result<()> {
            Ok(())
        }
        async fn place_order(&self, _req: PlaceOrderRequest) -> Result<PlaceOrderResponse> {
            Ok(PlaceOrderResponse { order_id: "order-1".to_string() })
        }
        async fn place_tp_sl_order(&self, _req: PlaceTpSlRequest) -> Result<()> {
            Ok(())
        }
        async fn close_all_positions(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }
        async fn close_partial_position(&self, _symbol: &str, _side: Side, _size: f64, _margin_mode: MarginMode) -> Result<()> {
            Ok(())
        }
    }

    fn engine_with(analysts: Vec<Analyst>) -> Engine {
        let mut config = EngineConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.dry_run = true;
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange { price: 60_000.0 });
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        Engine::new(config, exchange, storage, analysts)
    }

    #[tokio::test]
    async fn fresh_engine_starts_idle_with_zeroed_counters() {
        let engine = engine_with(Vec::new());
        let status = engine.status();
        assert_eq!(status.state, EngineState::Idle);
        assert_eq!(status.cycle_count, 0);
    }

    #[tokio::test]
    async fn a_single_cycle_with_agreeing_analysts_executes_one_trade() {
        let analysts = vec![
            Analyst {
                id: AnalystId::Named("a".to_string()),
                client: Arc::new(FakeAiClient::succeeding(json!({
                    "action": "BUY", "symbol": "BTCUSDT", "confidence": 80,
                    "recommendedLeverage": 5, "recommendedSizeUsd": 100.0
                }))),
                schema: json!({}),
            },
            Analyst {
                id: AnalystId::Named("b".to_string()),
                client: Arc::new(FakeAiClient::succeeding(json!({
                    "action": "BUY", "symbol": "BTCUSDT", "confidence": 85,
                    "recommendedLeverage": 5, "recommendedSizeUsd": 100.0
                }))),
                schema: json!({}),
            },
        ];
        let engine = engine_with(analysts);
        engine.contract_specs.refresh_if_stale(&["BTCUSDT".to_string()]).await.unwrap();

        let cycle = engine.run_cycle().await;
        assert!(cycle.analyses_run >= 2);
        assert_eq!(cycle.trades_executed, 1);
        assert!(cycle.errors.is_empty());
    }

    #[tokio::test]
    async fn governor_rejection_ends_the_cycle_successfully_without_counting_as_a_failure() {
        let analysts = vec![
            Analyst {
                id: AnalystId::Named("a".to_string()),
                client: Arc::new(FakeAiClient::succeeding(json!({
                    "action": "BUY", "symbol": "BTCUSDT", "confidence": 80,
                    "recommendedLeverage": 5, "recommendedSizeUsd": 1.0
                }))),
                schema: json!({}),
            },
            Analyst {
                id: AnalystId::Named("b".to_string()),
                client: Arc::new(FakeAiClient::succeeding(json!({
                    "action": "BUY", "symbol": "BTCUSDT", "confidence": 85,
                    "recommendedLeverage": 5, "recommendedSizeUsd": 1.0
                }))),
                schema: json!({}),
            },
        ];
        let engine = engine_with(analysts);
        engine.contract_specs.refresh_if_stale(&["BTCUSDT".to_string()]).await.unwrap();

        let cycle = engine.run_cycle().await;
        assert_eq!(cycle.action.as_deref(), Some("validation_rejected"));
        assert_eq!(cycle.trades_executed, 0);
        assert!(cycle.errors.is_empty(), "a governor rejection must not be recorded as a cycle error");

        let (failures, _) = engine.complete_cycle(cycle);
        assert_eq!(failures, 0, "a governor rejection must not increment consecutive_failures");
    }

    #[tokio::test]
    async fn cycle_with_no_analysts_surfaces_a_panel_error() {
        let engine = engine_with(Vec::new());
        engine.contract_specs.refresh_if_stale(&["BTCUSDT".to_string()]).await.unwrap();
        let cycle = engine.run_cycle().await;
        assert!(!cycle.errors.is_empty());
        assert_eq!(cycle.trades_executed, 0);
    }

    #[test]
    fn most_urgent_position_prefers_very_urgent_over_moderate() {
        let mut positions = HashMap::new();
        positions.insert(
            ("BTCUSDT".to_string(), Side::Long),
            crate::model::Position { side: Side::Long, size: 1.0, entry_price: 100.0, leverage: 5, unrealized_pnl: 2.0, liquidation_price: None },
        );
        positions.insert(
            ("ETHUSDT".to_string(), Side::Long),
            crate::model::Position { side: Side::Long, size: 1.0, entry_price: 100.0, leverage: 5, unrealized_pnl: 6.0, liquidation_price: None },
        );
        let portfolio = crate::model::PortfolioView {
            available_balance: 1000.0,
            positions,
            recent_pnl: Default::default(),
            daily_trade_count: 0,
            hold_times_hours: HashMap::new(),
        };
        let (symbol, _) = most_urgent_position(&portfolio).unwrap();
        assert_eq!(symbol, "ETHUSDT");
    }
}
