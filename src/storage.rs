// =============================================================================
// Storage contract (§6.3) — CRUD on Portfolio, Trade, PerformanceSnapshot.
// =============================================================================
//
// Persistent storage is out of scope; this module fixes the seam the
// Executor and Reconciler call through, mirroring the `RwLock`-guarded
// ring-buffer idiom used elsewhere for in-process bookkeeping. Trade writes
// must be atomic per cycle and reject a duplicate `exchange_order_id`.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{AnalystId, Side, Symbol};

/// One opened-or-closed trade. `realized_pnl` is `Some` only once the
/// position has been closed and reconciled; it is never missing for a
/// closure, only absent for a still-open entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exchange_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub winner: AnalystId,
    pub confidence: f64,
    pub exit_plan: Option<String>,
    pub rationale: String,
    pub realized_pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Coarse portfolio state as last persisted by the Executor/Reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRecord {
    pub open_trade_count: u32,
    pub realized_pnl_7d: f64,
    pub updated_at: DateTime<Utc>,
}

/// One periodic performance rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub realized_pnl_total: f64,
    pub trade_count: u32,
    pub win_count: u32,
}

/// CRUD surface on Portfolio, Trade, and PerformanceSnapshot. Trade writes
/// must be atomic and must reject a duplicate `exchange_order_id`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_trade(&self, trade: TradeRecord) -> Result<()>;
    /// Record a position closure as a brand-new `TradeRecord`, one row per
    /// closure. `original_order_id` identifies the still-open entry to copy
    /// the trade's static fields (symbol, side, size, leverage, ...) from;
    /// the original row is never mutated. `closing_order_id` becomes the new
    /// row's `exchange_order_id` and must be unique.
    async fn insert_closure(
        &self,
        original_order_id: &str,
        closing_order_id: &str,
        realized_pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn list_open_trades(&self, symbol: &Symbol, side: Side) -> Result<Vec<TradeRecord>>;
    async fn has_order_id(&self, exchange_order_id: &str) -> Result<bool>;
    async fn save_portfolio(&self, portfolio: PortfolioRecord) -> Result<()>;
    async fn load_portfolio(&self) -> Result<Option<PortfolioRecord>>;
    async fn append_performance_snapshot(&self, snapshot: PerformanceSnapshot) -> Result<()>;
    /// Sum `realized_pnl` over closures recorded at or after `cutoff`. Backs
    /// the Portfolio View's day/week PnL rollup.
    async fn realized_pnl_since(&self, cutoff: DateTime<Utc>) -> Result<f64>;
}

/// In-memory test double. Guards its ledger with a single `RwLock`, matching
/// the ring-buffer / shared-state idiom used for in-process bookkeeping
/// elsewhere in the engine. Not for production use — nothing here survives
/// a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    trades: RwLock<Vec<TradeRecord>>,
    portfolio: RwLock<Option<PortfolioRecord>>,
    snapshots: RwLock<Vec<PerformanceSnapshot>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_trade(&self, trade: TradeRecord) -> Result<()> {
        let mut trades = self.trades.write();
        if trades.iter().any(|t| t.exchange_order_id == trade.exchange_order_id) {
            anyhow::bail!("duplicate exchange_order_id: {}", trade.exchange_order_id);
        }
        trades.push(trade);
        Ok(())
    }

    async fn insert_closure(
        &self,
        original_order_id: &str,
        closing_order_id: &str,
        realized_pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut trades = self.trades.write();
        if trades.iter().any(|t| t.exchange_order_id == closing_order_id) {
            anyhow::bail!("duplicate exchange_order_id: {closing_order_id}");
        }
        let original = trades
            .iter()
            .find(|t| t.exchange_order_id == original_order_id)
            .ok_or_else(|| anyhow::anyhow!("no trade with exchange_order_id: {original_order_id}"))?
            .clone();
        trades.push(TradeRecord {
            exchange_order_id: closing_order_id.to_string(),
            realized_pnl: Some(realized_pnl),
            closed_at: Some(closed_at),
            ..original
        });
        Ok(())
    }

    async fn list_open_trades(&self, symbol: &Symbol, side: Side) -> Result<Vec<TradeRecord>> {
        let trades = self.trades.read();
        Ok(trades
            .iter()
            .filter(|t| &t.symbol == symbol && t.side == side && t.closed_at.is_none())
            .cloned()
            .collect())
    }

    async fn has_order_id(&self, exchange_order_id: &str) -> Result<bool> {
        Ok(self.trades.read().iter().any(|t| t.exchange_order_id == exchange_order_id))
    }

    async fn save_portfolio(&self, portfolio: PortfolioRecord) -> Result<()> {
        *self.portfolio.write() = Some(portfolio);
        Ok(())
    }

    async fn load_portfolio(&self) -> Result<Option<PortfolioRecord>> {
        Ok(self.portfolio.read().clone())
    }

    async fn append_performance_snapshot(&self, snapshot: PerformanceSnapshot) -> Result<()> {
        self.snapshots.write().push(snapshot);
        Ok(())
    }

    async fn realized_pnl_since(&self, cutoff: DateTime<Utc>) -> Result<f64> {
        Ok(self
            .trades
            .read()
            .iter()
            .filter(|t| t.closed_at.map(|c| c >= cutoff).unwrap_or(false))
            .filter_map(|t| t.realized_pnl)
            .sum())
    }
}
