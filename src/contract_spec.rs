// =============================================================================
// Contract Spec Cache (C3) — tick/step size and leverage bounds per symbol
// =============================================================================
//
// Refresh is triggered if any approved symbol is missing from the cache or
// the cache is older than the configured TTL. A single-flight flag prevents
// overlapping refreshes; if a refresh fails, the cache keeps serving stale
// data and the next cycle retries.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeClient;
use crate::model::ContractSpec;
use crate::types::Symbol;

struct Cache {
    specs: HashMap<Symbol, ContractSpec>,
    refreshed_at: Option<Instant>,
}

/// Per-symbol tick/step size and leverage bounds, refreshed periodically
/// with single-flight protection against overlapping refreshes.
pub struct ContractSpecCache {
    exchange: Arc<dyn ExchangeClient>,
    ttl: Duration,
    cache: Mutex<Cache>,
    refreshing: Mutex<bool>,
    refresh_done: Notify,
}

impl ContractSpecCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            cache: Mutex::new(Cache { specs: HashMap::new(), refreshed_at: None }),
            refreshing: Mutex::new(false),
            refresh_done: Notify::new(),
        }
    }

    /// Refresh if any symbol in `universe` is missing from the cache or the
    /// cache has aged past the TTL. Concurrent callers collapse onto a
    /// single in-flight refresh.
    pub async fn refresh_if_stale(&self, universe: &[Symbol]) -> Result<()> {
        if !self.is_stale(universe) {
            return Ok(());
        }

        let already_refreshing = {
            let mut refreshing = self.refreshing.lock();
            if *refreshing {
                true
            } else {
                *refreshing = true;
                false
            }
        };
        if already_refreshing {
            self.refresh_done.notified().await;
            return Ok(());
        }

        let result = self.do_refresh().await;

        {
            let mut refreshing = self.refreshing.lock();
            *refreshing = false;
        }
        self.refresh_done.notify_waiters();

        result
    }

    fn is_stale(&self, universe: &[Symbol]) -> bool {
        let cache = self.cache.lock();
        let missing = universe.iter().any(|s| !cache.specs.contains_key(s));
        let expired = cache.refreshed_at.map(|t| t.elapsed() > self.ttl).unwrap_or(true);
        missing || expired
    }

    async fn do_refresh(&self) -> Result<()> {
        let raw = self.exchange.get_contracts().await.context("fetching contract specs")?;

        let mut accepted = HashMap::new();
        for (symbol, spec) in raw {
            match ContractSpec::new(spec.tick_size, spec.step_size, spec.min_leverage, spec.max_leverage) {
                Ok(spec) => {
                    accepted.insert(symbol, spec);
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "rejecting bad contract spec, keeping stale entry if any");
                }
            }
        }

        if accepted.is_empty() {
            anyhow::bail!("contract spec refresh returned no acceptable entries");
        }

        let mut cache = self.cache.lock();
        cache.specs.extend(accepted);
        cache.refreshed_at = Some(Instant::now());
        info!(count = cache.specs.len(), "contract spec cache refreshed");
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<ContractSpec> {
        self.cache.lock().specs.get(symbol).copied()
    }

    /// Snap `price` to the symbol's tick grid.
    pub fn round_to_tick(&self, price: f64, symbol: &str) -> Result<f64> {
        let spec = self.get(symbol).ok_or_else(|| anyhow::anyhow!("no contract spec for {symbol}"))?;
        Ok(round_to_tick(price, spec.tick_size))
    }

    /// Snap `size` to the symbol's step grid. Errors if the result falls
    /// below one step.
    pub fn round_to_step(&self, size: f64, symbol: &str) -> Result<f64> {
        let spec = self.get(symbol).ok_or_else(|| anyhow::anyhow!("no contract spec for {symbol}"))?;
        round_to_step(size, spec.step_size)
    }
}

/// Pure: snap `price` to the nearest multiple of `tick_size`.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Pure: snap `size` down to the nearest multiple of `step_size`. Errors if
/// the floored result is below one step.
pub fn round_to_step(size: f64, step_size: f64) -> Result<f64> {
    if step_size <= 0.0 {
        return Ok(size);
    }
    let snapped = (size / step_size).floor() * step_size;
    if snapped < step_size - f64::EPSILON {
        anyhow::bail!("size {size} rounds below one step ({step_size})");
    }
    debug!(size, snapped, step_size, "size rounded to step grid");
    Ok(snapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_tick_snaps_to_nearest_multiple() {
        assert_eq!(round_to_tick(100.03, 0.05), 100.05);
        assert_eq!(round_to_tick(100.01, 0.05), 100.0);
    }

    #[test]
    fn round_to_tick_passes_through_on_zero_tick() {
        assert_eq!(round_to_tick(123.456, 0.0), 123.456);
    }

    #[test]
    fn round_to_step_floors_to_grid() {
        assert_eq!(round_to_step(0.1234, 0.001).unwrap(), 0.123);
    }

    #[test]
    fn round_to_step_errors_below_minimum() {
        assert!(round_to_step(0.0004, 0.001).is_err());
    }
}
