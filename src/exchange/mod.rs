// =============================================================================
// Exchange client contract (§6.1) — the external collaborator for all
// account, market-data, and order-placement calls.
// =============================================================================
//
// The core never talks to a concrete exchange SDK directly; every component
// that needs the exchange takes `Arc<dyn ExchangeClient>`. This keeps the
// Risk Governor and Reconciler testable against a fake without real I/O, and
// keeps the wire protocol (named "no wire protocol to freeze" in §6) out of
// the core's concern.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{MarginMode, Side, Symbol};

/// `getAccountAssets()` result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountAssets {
    pub available: f64,
    pub equity: f64,
}

/// `getTicker(symbol)` result; mirrors §3 MarketSnapshot minus the parts the
/// fetcher (C2) derives itself (fetch timestamp).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub current_price: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub mark_price: f64,
    pub index_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
}

/// `getContracts()` result — one entry per symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawContractSpec {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_leverage: u32,
    pub max_leverage: u32,
}

/// `getPositions()` result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawPosition {
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub liquidation_price: Option<f64>,
}

/// `getHistoryOrders(symbol, limit)` result — enough fields for the
/// Reconciler's closed-order back-fill matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryOrder {
    pub order_id: String,
    pub side: Side,
    pub size: f64,
    pub realized_pnl: f64,
    pub status: OrderStatus,
    pub closed_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    Canceled,
    Rejected,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// `placeOrder(...)` parameters.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: Symbol,
    pub client_order_id: String,
    pub side: Side,
    pub size: f64,
    pub order_type: OrderType,
    pub match_price: bool,
    pub price: Option<f64>,
    pub margin_mode: MarginMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpSlPlanType {
    ProfitPlan,
    LossPlan,
}

#[derive(Debug, Clone)]
pub struct PlaceTpSlRequest {
    pub symbol: Symbol,
    pub plan_type: TpSlPlanType,
    pub trigger_price: f64,
    pub size: f64,
    pub position_side: Side,
}

/// The five consumed exchange operations named in §6.1, collapsed to the
/// subset the core actually calls (account, ticker, funding, contracts,
/// positions, history, leverage, order placement, TP/SL placement, and
/// close/partial-close).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_account_assets(&self) -> Result<AccountAssets>;
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
    /// `None` means funding is explicitly absent for this symbol, not zero.
    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>>;
    async fn get_contracts(&self) -> Result<std::collections::HashMap<Symbol, RawContractSpec>>;
    async fn get_positions(&self) -> Result<std::collections::HashMap<(Symbol, Side), RawPosition>>;
    async fn get_history_orders(&self, symbol: &str, limit: u32) -> Result<Vec<HistoryOrder>>;
    /// Must tolerate an "already set" error from the exchange.
    async fn change_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> Result<()>;
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResponse>;
    async fn place_tp_sl_order(&self, req: PlaceTpSlRequest) -> Result<()>;
    async fn close_all_positions(&self, symbol: &str) -> Result<()>;
    async fn close_partial_position(&self, symbol: &str, side: Side, size: f64, margin_mode: MarginMode) -> Result<()>;
}
