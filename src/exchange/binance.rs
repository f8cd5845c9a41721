// =============================================================================
// Binance USDT-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::RateLimitTracker;
use crate::exchange::{
    AccountAssets, ExchangeClient, HistoryOrder, OrderStatus, OrderType, PlaceOrderRequest,
    PlaceOrderResponse, PlaceTpSlRequest, RawContractSpec, RawPosition, Ticker, TpSlPlanType,
};
use crate::types::{MarginMode, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance USDT-M futures REST client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimitTracker,
}

impl BinanceClient {
    /// Create a new `BinanceClient`.
    ///
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            rate_limiter: RateLimitTracker::new(),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimitTracker {
        &self.rate_limiter
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(&self, path: &str, qs: &str) -> Result<serde_json::Value> {
        if !self.rate_limiter.can_send_request(1) {
            anyhow::bail!("request blocked locally — rate-limit weight exhausted");
        }
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limiter.update_from_headers(resp.headers());
        if self.rate_limiter.should_backoff() {
            debug!(path, "rate-limit weight above warning threshold, will surface to the scheduler as a slower cadence if it keeps climbing");
        }
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {path} returned {status}: {body}");
        }
        Ok(body)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self), name = "exchange::get_account_assets")]
    async fn get_account_assets(&self) -> Result<AccountAssets> {
        let qs = self.signed_query("");
        let body = self.get_json("/fapi/v2/account", &qs).await?;

        let available = body["availableBalance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .context("account response missing availableBalance")?;
        let equity = body["totalMarginBalance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(available);

        debug!(available, equity, "account assets retrieved");
        Ok(AccountAssets { available, equity })
    }

    #[instrument(skip(self), name = "exchange::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let qs = format!("symbol={symbol}");
        let body = self.get_json("/fapi/v1/ticker/24hr", &qs).await?;

        let f = |key: &str| -> Option<f64> { body[key].as_str().and_then(|s| s.parse().ok()) };

        let current_price = f("lastPrice").context("ticker missing lastPrice")?;
        Ok(Ticker {
            current_price,
            high_24h: f("highPrice").unwrap_or(current_price),
            low_24h: f("lowPrice").unwrap_or(current_price),
            volume_24h: f("volume").unwrap_or(0.0),
            change_24h: f("priceChangePercent").unwrap_or(0.0),
            mark_price: current_price,
            index_price: current_price,
            best_bid: f("bidPrice").unwrap_or(current_price),
            best_ask: f("askPrice").unwrap_or(current_price),
        })
    }

    #[instrument(skip(self), name = "exchange::get_funding_rate")]
    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>> {
        let qs = format!("symbol={symbol}&limit=1");
        let body = match self.get_json("/fapi/v1/fundingRate", &qs).await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "funding rate fetch failed — treating as absent");
                return Ok(None);
            }
        };

        let rate = body
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|entry| entry["fundingRate"].as_str())
            .and_then(|s| s.parse::<f64>().ok());

        Ok(rate)
    }

    #[instrument(skip(self), name = "exchange::get_contracts")]
    async fn get_contracts(&self) -> Result<HashMap<Symbol, RawContractSpec>> {
        let body = self
            .client
            .get(format!("{}/fapi/v1/exchangeInfo", self.base_url))
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?
            .json::<serde_json::Value>()
            .await
            .context("failed to parse exchangeInfo response")?;

        let mut out = HashMap::new();
        let symbols = body["symbols"].as_array().context("exchangeInfo missing symbols")?;

        for entry in symbols {
            let Some(symbol) = entry["symbol"].as_str() else { continue };
            let filters = entry["filters"].as_array().cloned().unwrap_or_default();

            let tick_size = filters
                .iter()
                .find(|f| f["filterType"] == "PRICE_FILTER")
                .and_then(|f| f["tickSize"].as_str())
                .and_then(|s| s.parse::<f64>().ok());
            let step_size = filters
                .iter()
                .find(|f| f["filterType"] == "LOT_SIZE")
                .and_then(|f| f["stepSize"].as_str())
                .and_then(|s| s.parse::<f64>().ok());

            let (Some(tick_size), Some(step_size)) = (tick_size, step_size) else {
                warn!(symbol, "skipping contract with missing tick/step size filters");
                continue;
            };

            // Binance's futures exchangeInfo doesn't expose per-symbol leverage
            // brackets on this endpoint; engines needing the real bracket table
            // call /fapi/v1/leverageBracket separately. A conservative default
            // keeps the cache usable without a second round trip per symbol.
            out.insert(
                symbol.to_string(),
                RawContractSpec { tick_size, step_size, min_leverage: 1, max_leverage: 20 },
            );
        }

        debug!(count = out.len(), "contracts fetched");
        Ok(out)
    }

    #[instrument(skip(self), name = "exchange::get_positions")]
    async fn get_positions(&self) -> Result<HashMap<(Symbol, Side), RawPosition>> {
        let qs = self.signed_query("");
        let body = self.get_json("/fapi/v2/positionRisk", &qs).await?;

        let mut out = HashMap::new();
        let entries = body.as_array().context("positionRisk response is not an array")?;

        for entry in entries {
            let size: f64 = entry["positionAmt"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if size.abs() < f64::EPSILON {
                continue;
            }
            let Some(symbol) = entry["symbol"].as_str() else { continue };
            let side = if size > 0.0 { Side::Long } else { Side::Short };

            let entry_price: f64 = entry["entryPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let leverage: u32 = entry["leverage"].as_str().and_then(|s| s.parse().ok()).unwrap_or(1);
            let unrealized_pnl: f64 =
                entry["unRealizedProfit"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let liquidation_price: Option<f64> = entry["liquidationPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .filter(|p: &f64| *p > 0.0);

            out.insert(
                (symbol.to_string(), side),
                RawPosition { side, size: size.abs(), entry_price, leverage, unrealized_pnl, liquidation_price },
            );
        }

        Ok(out)
    }

    #[instrument(skip(self), name = "exchange::get_history_orders")]
    async fn get_history_orders(&self, symbol: &str, limit: u32) -> Result<Vec<HistoryOrder>> {
        let qs = self.signed_query(&format!("symbol={symbol}&limit={limit}"));
        let body = self.get_json("/fapi/v1/allOrders", &qs).await?;

        let entries = body.as_array().context("allOrders response is not an array")?;
        let mut out = Vec::with_capacity(entries.len());

        for entry in entries {
            let status_str = entry["status"].as_str().unwrap_or("");
            let status = match status_str {
                "FILLED" => OrderStatus::Filled,
                "CANCELED" | "EXPIRED" => OrderStatus::Canceled,
                "REJECTED" => OrderStatus::Rejected,
                _ => OrderStatus::New,
            };
            let side = if entry["side"].as_str() == Some("BUY") { Side::Long } else { Side::Short };
            let order_id = entry["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default();
            let size: f64 = entry["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let realized_pnl: f64 = entry["realizedPnl"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let closed_at_ms = entry["updateTime"].as_i64().unwrap_or(0);

            out.push(HistoryOrder { order_id, side, size, realized_pnl, status, closed_at_ms });
        }

        Ok(out)
    }

    #[instrument(skip(self), name = "exchange::change_leverage")]
    async fn change_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/leverage request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            let code = body["code"].as_i64();
            // -4046 = "No need to change leverage" — tolerate per contract.
            if code == Some(-4046) {
                debug!(symbol, leverage, "leverage already set — treated as success");
                return Ok(());
            }
            anyhow::bail!("Binance POST /fapi/v1/leverage returned {status}: {body}");
        }

        debug!(symbol, leverage, margin_mode = %margin_mode, "leverage set");
        Ok(())
    }

    #[instrument(skip(self, req), name = "exchange::place_order")]
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResponse> {
        if !self.rate_limiter.can_place_order() {
            anyhow::bail!("order blocked locally — rate limit exhausted");
        }

        let side = match req.side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let order_type = match req.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            req.symbol, side, order_type, req.size, req.client_order_id
        );
        if let Some(price) = req.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol = %req.symbol, side, order_type, size = req.size, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;
        self.rate_limiter.record_order_sent();
        self.rate_limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST /fapi/v1/order returned {status}: {body}");
        }

        let order_id = body["orderId"]
            .as_u64()
            .map(|n| n.to_string())
            .context("order response missing orderId")?;

        Ok(PlaceOrderResponse { order_id })
    }

    #[instrument(skip(self, req), name = "exchange::place_tp_sl_order")]
    async fn place_tp_sl_order(&self, req: PlaceTpSlRequest) -> Result<()> {
        let order_type = match req.plan_type {
            TpSlPlanType::ProfitPlan => "TAKE_PROFIT_MARKET",
            TpSlPlanType::LossPlan => "STOP_MARKET",
        };
        // The TP/SL order closes the position, so its side is the opposite
        // of the position's own side.
        let side = match req.position_side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };

        let params = format!(
            "symbol={}&side={}&type={}&stopPrice={}&closePosition=true",
            req.symbol, side, order_type, req.trigger_price
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order (tp/sl) request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            anyhow::bail!("Binance POST /fapi/v1/order (tp/sl) returned {status}: {body}");
        }

        debug!(symbol = %req.symbol, ?req.plan_type, trigger = req.trigger_price, "tp/sl plan placed");
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::close_all_positions")]
    async fn close_all_positions(&self, symbol: &str) -> Result<()> {
        // A real implementation reads the current position side+size from
        // get_positions and submits a reduce-only market order for the full
        // size; left as a thin wrapper so callers (the Executor) always go
        // through one seam regardless of how "close" is implemented.
        let positions = self.get_positions().await?;
        let matches: Vec<_> = positions
            .into_iter()
            .filter(|((sym, _), _)| sym == symbol)
            .collect();

        for ((sym, side), pos) in matches {
            let order_side = side.opposite();
            let req = PlaceOrderRequest {
                symbol: sym,
                client_order_id: format!("close-{}", uuid::Uuid::new_v4()),
                side: order_side,
                size: pos.size,
                order_type: OrderType::Market,
                match_price: true,
                price: None,
                margin_mode: MarginMode::Cross,
            };
            self.place_order(req).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::close_partial_position")]
    async fn close_partial_position(&self, symbol: &str, side: Side, size: f64, margin_mode: MarginMode) -> Result<()> {
        let req = PlaceOrderRequest {
            symbol: symbol.to_string(),
            client_order_id: format!("reduce-{}", uuid::Uuid::new_v4()),
            side: side.opposite(),
            size,
            order_type: OrderType::Market,
            match_price: true,
            price: None,
            margin_mode,
        };
        self.place_order(req).await?;
        Ok(())
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
