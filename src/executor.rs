// =============================================================================
// Executor (C10) — places orders for a governed FinalDecision
// =============================================================================
//
// Extends the teacher's ExecutionResult/risk-precheck shape with leverage
// setting, TP/SL plan placement, and CLOSE/REDUCE order types the donor's
// spot-only executor never needed. Dry-run short-circuits before any side
// effect, including persistence, so anti-churn and PnL attribution stay
// consistent with "nothing happened".
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::anti_churn::AntiChurnRecord;
use crate::exchange::{
    ExchangeClient, OrderType, PlaceOrderRequest, PlaceTpSlRequest, TpSlPlanType,
};
use crate::model::{FinalDecision, TrackedTrade};
use crate::portfolio::PortfolioTracker;
use crate::reconciler::TrackedTradeRegistry;
use crate::storage::{Storage, TradeRecord};
use crate::types::{Action, MarginMode, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Placed { order_id: String },
    Simulated { would_be_order_id: String },
    NoAction,
    Error(String),
}

pub struct Executor {
    exchange: Arc<dyn ExchangeClient>,
    storage: Arc<dyn Storage>,
    portfolio: Arc<PortfolioTracker>,
    anti_churn: Arc<AntiChurnRecord>,
    tracked_trades: Arc<TrackedTradeRegistry>,
    dry_run: bool,
}

impl Executor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        storage: Arc<dyn Storage>,
        portfolio: Arc<PortfolioTracker>,
        anti_churn: Arc<AntiChurnRecord>,
        tracked_trades: Arc<TrackedTradeRegistry>,
        dry_run: bool,
    ) -> Self {
        Self { exchange, storage, portfolio, anti_churn, tracked_trades, dry_run }
    }

    /// Execute a governed decision. `side` and `current_price` come from the
    /// caller's already-derived context (the Governor's inputs).
    pub async fn execute(&self, decision: &FinalDecision, side: Side, current_price: f64, margin_mode: MarginMode) -> Result<ExecutionOutcome> {
        match decision.action {
            Action::Hold => Ok(ExecutionOutcome::NoAction),
            Action::Buy | Action::Sell => self.execute_entry(decision, side, current_price, margin_mode).await,
            Action::Close => self.execute_close(decision, side, margin_mode).await,
            Action::Reduce => self.execute_reduce(decision, side, current_price, margin_mode).await,
        }
    }

    async fn execute_entry(&self, decision: &FinalDecision, side: Side, current_price: f64, margin_mode: MarginMode) -> Result<ExecutionOutcome> {
        if current_price <= 0.0 {
            anyhow::bail!("non-positive current price for entry");
        }
        let size = decision.allocation_usd / current_price;

        if self.dry_run {
            let sim_id = format!("dry-run-{}", Uuid::new_v4());
            info!(symbol = %decision.symbol, %side, size, leverage = decision.leverage, "dry-run entry (no exchange call)");
            return Ok(ExecutionOutcome::Simulated { would_be_order_id: sim_id });
        }

        // 1. Set leverage, swallowing "already set" — the exchange client
        // tolerates that error code internally.
        if let Err(e) = self.exchange.change_leverage(&decision.symbol, decision.leverage, margin_mode).await {
            warn!(symbol = %decision.symbol, error = %e, "leverage change failed, proceeding with existing leverage");
        }

        // 2. Place the market order with a fresh, retry-safe client order id.
        let client_order_id = format!("entry-{}", Uuid::new_v4());
        let req = PlaceOrderRequest {
            symbol: decision.symbol.clone(),
            client_order_id,
            side,
            size,
            order_type: OrderType::Market,
            match_price: true,
            price: None,
            margin_mode,
        };
        let response = self.exchange.place_order(req).await.context("placing entry order")?;

        // 3/4. Attach TP/SL plans if present.
        if let Some(tp) = decision.tp_price {
            if let Err(e) = self
                .exchange
                .place_tp_sl_order(PlaceTpSlRequest {
                    symbol: decision.symbol.clone(),
                    plan_type: TpSlPlanType::ProfitPlan,
                    trigger_price: tp,
                    size,
                    position_side: side,
                })
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "take-profit plan placement failed");
            }
        }
        if let Some(sl) = decision.sl_price {
            if let Err(e) = self
                .exchange
                .place_tp_sl_order(PlaceTpSlRequest {
                    symbol: decision.symbol.clone(),
                    plan_type: TpSlPlanType::LossPlan,
                    trigger_price: sl,
                    size,
                    position_side: side,
                })
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "stop-loss plan placement failed");
            }
        }

        // 5. Persist the trade record and register the tracked trade.
        let trade = TradeRecord {
            exchange_order_id: response.order_id.clone(),
            symbol: decision.symbol.clone(),
            side,
            entry_price: current_price,
            size,
            leverage: decision.leverage,
            winner: decision.winner.clone(),
            confidence: decision.confidence,
            exit_plan: decision.exit_plan.clone(),
            rationale: decision.rationale.clone(),
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        self.storage.insert_trade(trade).await.context("persisting trade record")?;
        self.portfolio.record_entry(&decision.symbol, side);
        self.anti_churn.record(&decision.symbol, side);
        self.tracked_trades.register(TrackedTrade {
            exchange_order_id: response.order_id.clone(),
            symbol: decision.symbol.clone(),
            side,
            size,
            entry_price: current_price,
            winner: decision.winner.clone(),
            opened_at: Utc::now(),
        });

        info!(symbol = %decision.symbol, %side, order_id = %response.order_id, "entry order executed");
        Ok(ExecutionOutcome::Placed { order_id: response.order_id })
    }

    async fn execute_close(&self, decision: &FinalDecision, side: Side, _margin_mode: MarginMode) -> Result<ExecutionOutcome> {
        if self.dry_run {
            info!(symbol = %decision.symbol, %side, "dry-run close (no exchange call)");
            return Ok(ExecutionOutcome::Simulated { would_be_order_id: format!("dry-run-close-{}", Uuid::new_v4()) });
        }

        self.exchange.close_all_positions(&decision.symbol).await.context("closing all positions")?;
        self.portfolio.clear_entry(&decision.symbol, side);
        info!(symbol = %decision.symbol, %side, "position closed (full)");
        Ok(ExecutionOutcome::Placed { order_id: format!("close-{}", decision.symbol) })
    }

    async fn execute_reduce(&self, decision: &FinalDecision, side: Side, current_price: f64, margin_mode: MarginMode) -> Result<ExecutionOutcome> {
        if current_price <= 0.0 {
            anyhow::bail!("non-positive current price for reduce");
        }
        // `allocation_usd` is a notional in quote currency — the caller (the
        // rule-based manager's partial-take fraction, or the Governor's
        // sizing step) decides how much that is. `close_partial_position`
        // wants a base-asset quantity, same as `execute_entry`'s sizing.
        let size = decision.allocation_usd / current_price;

        if self.dry_run {
            info!(symbol = %decision.symbol, %side, size, "dry-run reduce (no exchange call)");
            return Ok(ExecutionOutcome::Simulated { would_be_order_id: format!("dry-run-reduce-{}", Uuid::new_v4()) });
        }

        self.exchange
            .close_partial_position(&decision.symbol, side, size, margin_mode)
            .await
            .context("reducing position")?;
        info!(symbol = %decision.symbol, %side, size, notional = decision.allocation_usd, "position reduced");
        Ok(ExecutionOutcome::Placed { order_id: format!("reduce-{}", decision.symbol) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountAssets, HistoryOrder, PlaceOrderResponse, RawContractSpec, RawPosition, Ticker};
    use crate::storage::InMemoryStorage;
    use crate::types::AnalystId;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeExchange {
        orders_placed: AtomicU32,
        last_reduce_size: parking_lot::Mutex<Option<f64>>,
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn get_account_assets(&self) -> Result<AccountAssets> {
            Ok(AccountAssets { available: 1000.0, equity: 1000.0 })
        }
        async fn get_ticker(&self, _symbol: &str) -> Result<Ticker> {
            unimplemented!()
        }
        async fn get_funding_rate(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn get_contracts(&self) -> Result<HashMap<String, RawContractSpec>> {
            Ok(HashMap::new())
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
            self.orders_placed.fetch_add(1, Ordering::SeqCst);
            Ok(PlaceOrderResponse { order_id: "live-order-1".to_string() })
        }
        async fn place_tp_sl_order(&self, _req: PlaceTpSlRequest) -> Result<()> {
            Ok(())
        }
        async fn close_all_positions(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }
        async fn close_partial_position(&self, _symbol: &str, _side: Side, size: f64, _margin_mode: MarginMode) -> Result<()> {
            *self.last_reduce_size.lock() = Some(size);
            Ok(())
        }
    }

    fn decision(action: Action) -> FinalDecision {
        FinalDecision {
            winner: AnalystId::Named("a".to_string()),
            action,
            symbol: "BTCUSDT".to_string(),
            confidence: 80.0,
            leverage: 5,
            allocation_usd: 100.0,
            tp_price: Some(65_000.0),
            sl_price: Some(58_000.0),
            rationale: "test".to_string(),
            exit_plan: None,
            warnings: Vec::new(),
        }
    }

    fn setup(dry_run: bool) -> (Executor, Arc<FakeExchange>, Arc<InMemoryStorage>) {
        let exchange = Arc::new(FakeExchange::default());
        let storage = Arc::new(InMemoryStorage::new());
        let portfolio = Arc::new(PortfolioTracker::new(exchange.clone(), storage.clone()));
        let anti_churn = Arc::new(AntiChurnRecord::new());
        let tracked_trades = Arc::new(TrackedTradeRegistry::new());
        let executor = Executor::new(exchange.clone(), storage.clone(), portfolio, anti_churn, tracked_trades, dry_run);
        (executor, exchange, storage)
    }

    #[tokio::test]
    async fn dry_run_never_calls_exchange_or_persists() {
        let (executor, exchange, storage) = setup(true);
        let outcome = executor.execute(&decision(Action::Buy), Side::Long, 60_000.0, MarginMode::Cross).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Simulated { .. }));
        assert_eq!(exchange.orders_placed.load(Ordering::SeqCst), 0);
        assert!(!storage.has_order_id("live-order-1").await.unwrap());
    }

    #[tokio::test]
    async fn live_entry_places_order_and_persists_trade() {
        let (executor, exchange, storage) = setup(false);
        let outcome = executor.execute(&decision(Action::Buy), Side::Long, 60_000.0, MarginMode::Cross).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { .. }));
        assert_eq!(exchange.orders_placed.load(Ordering::SeqCst), 1);
        assert!(storage.has_order_id("live-order-1").await.unwrap());
    }

    #[tokio::test]
    async fn hold_is_a_no_op() {
        let (executor, exchange, _storage) = setup(false);
        let outcome = executor.execute(&decision(Action::Hold), Side::Long, 60_000.0, MarginMode::Cross).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::NoAction));
        assert_eq!(exchange.orders_placed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reduce_converts_notional_to_base_quantity_before_closing() {
        let (executor, exchange, _storage) = setup(false);
        let mut reduce_decision = decision(Action::Reduce);
        reduce_decision.allocation_usd = 6_000.0;

        executor.execute(&reduce_decision, Side::Long, 60_000.0, MarginMode::Cross).await.unwrap();

        let size = exchange.last_reduce_size.lock().expect("close_partial_position was called");
        assert!((size - 0.1).abs() < 1e-9, "expected a 0.1 base-asset quantity, got {size}");
    }
}
