// =============================================================================
// Perpetual Engine — Main Entry Point
// =============================================================================
//
// Boots every external collaborator (exchange, storage, analyst panel),
// assembles the Engine, and runs it until SIGINT. The engine's own safety
// gate is `dry_run`; `trading_mode`/`account_mode` are operator-facing
// config metadata carried for the startup banner, not consulted by the
// cycle itself.
// =============================================================================

mod ai;
mod analyst_panel;
mod anti_churn;
mod config;
mod contract_spec;
mod engine;
mod events;
mod exchange;
mod executor;
mod judge;
mod market_data;
mod model;
mod portfolio;
mod pre_gate;
mod reconciler;
mod risk_governor;
mod rule_based_manager;
mod scheduler;
mod storage;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::ai::HttpAiClient;
use crate::analyst_panel::Analyst;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::exchange::binance::BinanceClient;
use crate::exchange::ExchangeClient;
use crate::storage::{InMemoryStorage, Storage};
use crate::types::AnalystId;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Perpetual Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match EngineConfig::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, path = CONFIG_PATH, "no usable config on disk, starting from defaults");
            let cfg = EngineConfig::default();
            if let Err(e) = cfg.save(CONFIG_PATH) {
                warn!(error = %e, "failed to persist default config");
            }
            cfg
        }
    };
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        dry_run = config.dry_run,
        symbols = ?config.symbols,
        "resolved configuration"
    );

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set, exchange calls will be rejected upstream");
    }
    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::new(api_key, api_secret));

    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let analysts = build_analyst_panel(&config);
    if analysts.len() < config.min_analysts_required as usize {
        warn!(
            configured = analysts.len(),
            required = config.min_analysts_required,
            "fewer analysts wired than min_analysts_required; every cycle's panel will fail"
        );
    }

    let engine = Arc::new(Engine::new(config, exchange, storage, analysts));

    let run_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_forever().await })
    };

    tokio::select! {
        result = run_handle => {
            match result {
                Ok(Ok(())) => info!("engine stopped on its own (circuit breaker or startup failure)"),
                Ok(Err(e)) => error!(error = %e, "engine exited with a fatal error"),
                Err(e) => error!(error = %e, "engine task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping engine");
            engine.stop();
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wire one `HttpAiClient` per configured analyst identity. The model/base
/// URL/key are shared across analysts; each gets its own `AnalystId` so the
/// Judge and anti-churn bookkeeping can tell their opinions apart.
fn build_analyst_panel(config: &EngineConfig) -> Vec<Analyst> {
    let base_url = std::env::var("AI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let api_key = std::env::var("AI_API_KEY").unwrap_or_default();
    let model = std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

    if api_key.is_empty() {
        warn!("AI_API_KEY not set, analyst calls will be rejected upstream");
    }

    let schema = opinion_schema();
    let names = ["momentum", "mean-reversion", "macro"];

    names
        .iter()
        .take(config.min_analysts_required.max(2) as usize)
        .map(|name| Analyst {
            id: AnalystId::Named(name.to_string()),
            client: Arc::new(HttpAiClient::new(base_url.clone(), api_key.clone(), model.clone())),
            schema: schema.clone(),
        })
        .collect()
}

fn opinion_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["BUY", "SELL", "HOLD", "CLOSE", "REDUCE"] },
            "symbol": { "type": "string" },
            "confidence": { "type": "number" },
            "rationale": { "type": "string" },
            "thesis": { "type": "string" },
            "recommendedLeverage": { "type": "integer" },
            "recommendedSizeUsd": { "type": "number" },
            "tpPrice": { "type": "number" },
            "slPrice": { "type": "number" },
            "exitPlan": { "type": "string" }
        },
        "required": ["action", "symbol", "confidence", "rationale"]
    })
}
