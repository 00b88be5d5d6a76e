//! Decision oracle client: asks an OpenAI-compatible chat endpoint for
//! per-coin trade signals.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::models::{TradeSignal, TradingModel};

const DECISION_TIMEOUT: Duration = Duration::from_secs(90);

const SYSTEM_PROMPT: &str =
    "You are an expert crypto portfolio manager. Always respond with valid JSON only.";

/// Source of trade decisions for one model.
///
/// Returns the raw response text; parsing happens separately so the raw
/// payload can be persisted even when it is malformed.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, prompt: &str) -> Result<String, EngineError>;
}

/// Parsed decision: a rationale plus one signal per coin.
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub rationale: String,

    #[serde(default)]
    pub signals: HashMap<String, CoinDecision>,
}

/// One coin's signal with optional sizing. Opens without a quantity are
/// held; closes without a quantity close the whole position.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinDecision {
    pub signal: TradeSignal,

    #[serde(default)]
    pub quantity: Option<Decimal>,

    #[serde(default)]
    pub leverage: Option<u32>,
}

/// Extract and parse the decision JSON from a raw oracle response.
///
/// Models routinely wrap their JSON in code fences or prose; the outermost
/// `{ ... }` slice is what gets parsed. `None` means the response is
/// unusable and every coin degrades to hold.
pub fn parse_decision(raw: &str) -> Option<Decision> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }

    serde_json::from_str(&raw[start..=end]).ok()
}

/// Chat-completions client built from a model's stored credentials.
pub struct DecisionClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model_name: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl DecisionClient {
    pub fn for_model(model: &TradingModel) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: model.api_url.trim_end_matches('/').to_string(),
            api_key: model.api_key.clone(),
            model_name: model.model_name.clone(),
        }
    }
}

#[async_trait]
impl DecisionProvider for DecisionClient {
    async fn decide(&self, prompt: &str) -> Result<String, EngineError> {
        let body = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        debug!(model = %self.model_name, "Calling decision oracle");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(DECISION_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::Oracle(format!("decision request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Oracle(format!(
                "decision oracle returned {status}: {text}"
            )));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Oracle(format!("decision response parse error: {e}")))?;

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Oracle("decision oracle returned empty content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_plain_json() {
        let raw = r#"{"rationale": "BTC momentum looks strong", "signals": {"BTC": {"signal": "open_long", "quantity": 0.5, "leverage": 3}, "ETH": {"signal": "hold"}}}"#;

        let decision = parse_decision(raw).expect("parses");
        assert_eq!(decision.rationale, "BTC momentum looks strong");

        let btc = &decision.signals["BTC"];
        assert_eq!(btc.signal, TradeSignal::OpenLong);
        assert_eq!(btc.quantity, Some(dec!(0.5)));
        assert_eq!(btc.leverage, Some(3));

        assert_eq!(decision.signals["ETH"].signal, TradeSignal::Hold);
        assert_eq!(decision.signals["ETH"].quantity, None);
    }

    #[test]
    fn test_parse_tolerates_fences_and_prose() {
        let raw = "Here is my analysis:\n```json\n{\"rationale\": \"flat\", \"signals\": {\"SOL\": {\"signal\": \"close_long\"}}}\n```\nGood luck!";

        let decision = parse_decision(raw).expect("parses");
        assert_eq!(decision.signals["SOL"].signal, TradeSignal::CloseLong);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_decision("buy everything!!").is_none());
        assert!(parse_decision("{\"signals\": {\"BTC\": {\"signal\": \"moon\"}}}").is_none());
        assert!(parse_decision("").is_none());
    }
}
