// =============================================================================
// Portfolio View (C4) — balance, open positions, hold-times, recent PnL
// =============================================================================
//
// Available balance always comes from the exchange, never from local
// storage. A weekly-PnL cache with a 60-second TTL wraps the aggregation
// query to protect storage from repeated reads inside a cycle, mirroring
// the RwLock-guarded cache idiom used for other per-cycle state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::exchange::ExchangeClient;
use crate::model::{Position, PortfolioView, RecentPnl};
use crate::storage::Storage;
use crate::types::{Side, Symbol};

const WEEKLY_PNL_CACHE_TTL: Duration = Duration::from_secs(60);

struct PnlCache {
    value: Option<RecentPnl>,
    cached_at: Option<Instant>,
}

/// Aggregates exchange-reported account state into a `PortfolioView`. Holds
/// its own hold-time ledger (most recent entry timestamp per (symbol, side))
/// and a short-TTL cache for the realized-PnL rollup.
pub struct PortfolioTracker {
    exchange: Arc<dyn ExchangeClient>,
    storage: Arc<dyn Storage>,
    entry_times: Mutex<HashMap<(Symbol, Side), chrono::DateTime<Utc>>>,
    pnl_cache: Mutex<PnlCache>,
}

impl PortfolioTracker {
    pub fn new(exchange: Arc<dyn ExchangeClient>, storage: Arc<dyn Storage>) -> Self {
        Self {
            exchange,
            storage,
            entry_times: Mutex::new(HashMap::new()),
            pnl_cache: Mutex::new(PnlCache { value: None, cached_at: None }),
        }
    }

    /// Record that a new entry trade opened on (symbol, side) now. Called by
    /// the Executor right after order acceptance.
    pub fn record_entry(&self, symbol: &Symbol, side: Side) {
        self.entry_times.lock().insert((symbol.clone(), side), Utc::now());
    }

    /// Drop the hold-time entry once the Reconciler retires the position.
    pub fn clear_entry(&self, symbol: &Symbol, side: Side) {
        self.entry_times.lock().remove(&(symbol.clone(), side));
    }

    pub async fn snapshot(&self, daily_trade_count: u32) -> Result<PortfolioView> {
        let assets = self.exchange.get_account_assets().await.context("fetching account assets")?;
        let raw_positions = self.exchange.get_positions().await.context("fetching positions")?;

        let mut positions = HashMap::new();
        let mut hold_times_hours = HashMap::new();
        {
            let entry_times = self.entry_times.lock();

            for ((symbol, side), raw) in raw_positions {
                positions.insert(
                    (symbol.clone(), side),
                    Position {
                        side: raw.side,
                        size: raw.size,
                        entry_price: raw.entry_price,
                        leverage: raw.leverage,
                        unrealized_pnl: raw.unrealized_pnl,
                        liquidation_price: raw.liquidation_price,
                    },
                );

                if let Some(opened_at) = entry_times.get(&(symbol.clone(), side)) {
                    let hours = (Utc::now() - *opened_at).num_minutes() as f64 / 60.0;
                    hold_times_hours.insert((symbol, side), hours.max(0.0));
                }
            }
        }

        let recent_pnl = self.weekly_pnl(assets.equity).await?;

        Ok(PortfolioView {
            available_balance: assets.available,
            positions,
            recent_pnl,
            daily_trade_count,
            hold_times_hours,
        })
    }

    async fn weekly_pnl(&self, equity: f64) -> Result<RecentPnl> {
        {
            let cache = self.pnl_cache.lock();
            if let (Some(value), Some(at)) = (cache.value, cache.cached_at) {
                if at.elapsed() < WEEKLY_PNL_CACHE_TTL {
                    return Ok(value);
                }
            }
        }

        let now = Utc::now();
        let day_pnl = self.storage.realized_pnl_since(now - chrono::Duration::days(1)).await.context("aggregating day pnl")?;
        let week_pnl = self.storage.realized_pnl_since(now - chrono::Duration::days(7)).await.context("aggregating week pnl")?;

        let value = if equity > 0.0 {
            RecentPnl { day_pct: (day_pnl / equity) * 100.0, week_pct: (week_pnl / equity) * 100.0 }
        } else {
            RecentPnl { day_pct: 0.0, week_pct: 0.0 }
        };

        let mut cache = self.pnl_cache.lock();
        cache.value = Some(value);
        cache.cached_at = Some(Instant::now());
        debug!("weekly pnl cache refreshed");
        Ok(value)
    }
}

/// Pure: the current price to use for a position when the live market price
/// is unavailable or non-finite.
///
/// Preference order: live market price if finite; else back-derive from
/// entry price and unrealized PnL; else entry price (stale but safe).
pub fn derived_current_price(position: &Position, market_price: Option<f64>) -> f64 {
    if let Some(price) = market_price {
        if price.is_finite() && price > 0.0 {
            return price;
        }
    }

    if position.size > 0.0 {
        let pnl_per_unit = position.unrealized_pnl / position.size;
        let derived = match position.side {
            Side::Long => position.entry_price + pnl_per_unit,
            Side::Short => position.entry_price - pnl_per_unit,
        };
        if derived.is_finite() && derived > 0.0 {
            return derived;
        }
    }

    position.entry_price
}
