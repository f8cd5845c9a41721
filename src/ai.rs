// =============================================================================
// AI client contract (§6.2) — the external collaborator consulted once per
// analyst per cycle by the Analyst Panel (C6).
// =============================================================================
//
// The prompt text itself is out of scope; this module fixes the seam the
// Analyst Panel calls through, mirroring the `ExchangeClient` trait-object
// pattern in `exchange/mod.rs` so the panel is testable against canned
// responses without a real model call. `HttpAiClient` is a thin concrete
// wiring of that seam against any OpenAI-compatible endpoint.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

/// One model call: a rendered prompt plus the JSON schema the caller expects
/// the response to validate against. Schema enforcement itself is the
/// concrete client's job; this trait only carries the contract.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Issue one generation call. Implementations must respect `deadline`
    /// internally (e.g. by racing their own HTTP call against it) so a
    /// hung upstream cannot block the panel past its shared timeout.
    async fn generate(&self, prompt: &str, schema: &Value, deadline: std::time::Duration) -> Result<Value>;
}

/// OpenAI-compatible chat-completions client. Minimal wiring for the
/// analyst seam: the prompt text and any system-prompt framing are the
/// caller's concern, this just posts it and pulls the JSON payload back out
/// of the first choice's message content, racing the request against
/// `deadline` the way `exchange::binance` races its signed requests.
pub struct HttpAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn generate(&self, prompt: &str, schema: &Value, deadline: std::time::Duration) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": { "type": "json_schema", "json_schema": { "name": "analyst_opinion", "schema": schema } },
        });

        let send = self.http.post(&url).bearer_auth(&self.api_key).json(&body).send();
        let response = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| anyhow::anyhow!("analyst call timed out before a response arrived"))??
            .error_for_status()
            .context("analyst endpoint returned an error status")?;

        let payload: Value = response.json().await.context("analyst response was not valid JSON")?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("analyst response missing choices[0].message.content"))?;

        serde_json::from_str(content).context("analyst message content was not valid JSON")
    }
}

/// Deterministic test double: returns a fixed response for every call, or an
/// error if configured to fail. Used by `analyst_panel` unit tests to
/// exercise fan-out, timeout isolation, and the ≥2-survivors rule without a
/// real model.
pub struct FakeAiClient {
    response: Result<Value, String>,
    delay: std::time::Duration,
}

impl FakeAiClient {
    pub fn succeeding(response: Value) -> Self {
        Self { response: Ok(response), delay: std::time::Duration::ZERO }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self { response: Err(message.into()), delay: std::time::Duration::ZERO }
    }

    /// Delay the response past the caller's own deadline to exercise the
    /// panel's timeout-isolation path.
    pub fn slow(response: Value, delay: std::time::Duration) -> Self {
        Self { response: Ok(response), delay }
    }
}

#[async_trait]
impl AiClient for FakeAiClient {
    async fn generate(&self, _prompt: &str, _schema: &Value, deadline: std::time::Duration) -> Result<Value> {
        if self.delay > std::time::Duration::ZERO {
            tokio::time::sleep(self.delay.min(deadline * 10)).await;
        }
        match &self.response {
            Ok(v) => Ok(v.clone()),
            Err(msg) => anyhow::bail!("{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn succeeding_fake_returns_configured_value() {
        let client = FakeAiClient::succeeding(json!({"action": "BUY"}));
        let out = client.generate("prompt", &json!({}), std::time::Duration::from_millis(100)).await.unwrap();
        assert_eq!(out["action"], "BUY");
    }

    #[tokio::test]
    async fn failing_fake_returns_error() {
        let client = FakeAiClient::failing("upstream unavailable");
        let err = client.generate("prompt", &json!({}), std::time::Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn slow_fake_exceeds_caller_timeout() {
        let client = FakeAiClient::slow(json!({"action": "HOLD"}), std::time::Duration::from_millis(50));
        let deadline = std::time::Duration::from_millis(5);
        let result = tokio::time::timeout(deadline, client.generate("prompt", &json!({}), deadline)).await;
        assert!(result.is_err(), "expected the outer timeout to fire before the fake's delay elapsed");
    }
}
