// =============================================================================
// Market Data Fetcher (C2) — concurrent per-symbol ticker + funding snapshot
// =============================================================================
//
// Fans out one ticker call and one funding-rate call per symbol, each under
// its own timeout, mirroring the teacher's per-stream reconnect-loop shape
// but collapsed into a single bounded fan-out rather than long-lived
// streams. A symbol with a non-finite or non-positive price is dropped, not
// errored — one bad ticker must never abort the whole fetch.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::exchange::ExchangeClient;
use crate::model::MarketSnapshot;
use crate::types::Symbol;

/// Fetch a `MarketSnapshot` for every symbol in `universe` concurrently.
/// Returns whatever subset succeeded; callers treat an empty result as a
/// cycle-ending error.
pub async fn fetch(
    exchange: &Arc<dyn ExchangeClient>,
    universe: &[Symbol],
    per_request_timeout: Duration,
) -> HashMap<Symbol, MarketSnapshot> {
    let mut tasks = tokio::task::JoinSet::new();
    for symbol in universe {
        let exchange = exchange.clone();
        let symbol = symbol.clone();
        tasks.spawn(async move {
            let snapshot = fetch_one(&exchange, &symbol, per_request_timeout).await;
            (symbol, snapshot)
        });
    }

    let mut out = HashMap::with_capacity(universe.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((symbol, Some(snapshot))) => {
                out.insert(symbol, snapshot);
            }
            Ok((symbol, None)) => warn!(symbol = %symbol, "dropping symbol from market snapshot"),
            Err(e) => warn!(error = %e, "market data fetch task panicked"),
        }
    }
    out
}

async fn fetch_one(exchange: &Arc<dyn ExchangeClient>, symbol: &Symbol, timeout: Duration) -> Option<MarketSnapshot> {
    let ticker = match tokio::time::timeout(timeout, exchange.get_ticker(symbol)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            warn!(symbol = %symbol, error = %e, "ticker fetch failed");
            return None;
        }
        Err(_) => {
            warn!(symbol = %symbol, "ticker fetch timed out");
            return None;
        }
    };

    if !ticker.current_price.is_finite() || ticker.current_price <= 0.0 {
        warn!(symbol = %symbol, price = ticker.current_price, "malformed current price, dropping symbol");
        return None;
    }

    // A funding-rate failure or timeout is kept as absent, never substituted.
    let funding_rate = match tokio::time::timeout(timeout, exchange.get_funding_rate(symbol)).await {
        Ok(Ok(rate)) => rate,
        Ok(Err(e)) => {
            warn!(symbol = %symbol, error = %e, "funding rate fetch failed, leaving absent");
            None
        }
        Err(_) => {
            warn!(symbol = %symbol, "funding rate fetch timed out, leaving absent");
            None
        }
    };

    Some(MarketSnapshot {
        current_price: ticker.current_price,
        high_24h: ticker.high_24h,
        low_24h: ticker.low_24h,
        volume_24h: ticker.volume_24h,
        change_24h: ticker.change_24h,
        funding_rate,
        mark_price: ticker.mark_price,
        index_price: ticker.index_price,
        best_bid: ticker.best_bid,
        best_ask: ticker.best_ask,
        fetch_timestamp_ms: Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        AccountAssets, HistoryOrder, PlaceOrderRequest, PlaceOrderResponse, PlaceTpSlRequest, RawContractSpec, RawPosition, Ticker,
    };
    use crate::types::{MarginMode, Side};
    use anyhow::Result;
    use async_trait::async_trait;

    struct FakeExchange {
        price: f64,
        funding_ok: bool,
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
            if self.funding_ok {
                Ok(Some(0.0001))
            } else {
                anyhow::bail!("funding endpoint unavailable")
            }
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
            unimplemented!()
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

    #[tokio::test]
    async fn healthy_symbol_is_fetched_with_funding_rate() {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange { price: 60_000.0, funding_ok: true });
        let universe = vec!["BTCUSDT".to_string()];
        let result = fetch(&exchange, &universe, Duration::from_secs(1)).await;
        let snapshot = result.get("BTCUSDT").expect("symbol present");
        assert_eq!(snapshot.current_price, 60_000.0);
        assert_eq!(snapshot.funding_rate, Some(0.0001));
    }

    #[tokio::test]
    async fn funding_rate_failure_leaves_it_absent_not_substituted() {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange { price: 60_000.0, funding_ok: false });
        let universe = vec!["BTCUSDT".to_string()];
        let result = fetch(&exchange, &universe, Duration::from_secs(1)).await;
        let snapshot = result.get("BTCUSDT").expect("symbol still present");
        assert_eq!(snapshot.funding_rate, None);
    }

    #[tokio::test]
    async fn non_finite_price_drops_the_symbol() {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange { price: f64::NAN, funding_ok: true });
        let universe = vec!["BTCUSDT".to_string()];
        let result = fetch(&exchange, &universe, Duration::from_secs(1)).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn empty_universe_yields_empty_map() {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange { price: 60_000.0, funding_ok: true });
        let result = fetch(&exchange, &[], Duration::from_secs(1)).await;
        assert!(result.is_empty());
    }
}
