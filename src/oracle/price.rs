//! Market data client for current coin prices.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::EngineError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// CoinGecko asset ids for the supported coin universe.
const COINGECKO_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("SOL", "solana"),
    ("BNB", "binancecoin"),
    ("XRP", "ripple"),
    ("DOGE", "dogecoin"),
];

/// Source of current market prices.
///
/// Coins missing from the result are valid omissions (unknown or
/// temporarily unavailable), not errors.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn current_prices(
        &self,
        coins: &[String],
    ) -> Result<HashMap<String, Decimal>, EngineError>;
}

/// Client for the CoinGecko simple price API, with a short in-process
/// cache so bursts of valuations share one upstream call.
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, HashMap<String, Decimal>)>>,
}

impl MarketDataClient {
    pub fn new(base_url: String, cache_ttl: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Oracle(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            cache_ttl,
            cache: Mutex::new(None),
        })
    }

    fn cached(&self) -> Option<HashMap<String, Decimal>> {
        let cache = self.cache.lock().ok()?;
        match cache.as_ref() {
            Some((at, prices)) if at.elapsed() < self.cache_ttl => Some(prices.clone()),
            _ => None,
        }
    }

    fn store(&self, prices: &HashMap<String, Decimal>) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), prices.clone()));
        }
    }

    async fn fetch_all(&self) -> Result<HashMap<String, Decimal>, EngineError> {
        let ids: Vec<&str> = COINGECKO_IDS.iter().map(|(_, id)| *id).collect();
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url,
            ids.join(",")
        );

        debug!(url = %url, "Fetching market prices");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Oracle(format!("price request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EngineError::Oracle(format!(
                "price request failed with status {status}"
            )));
        }

        let body: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .map_err(|e| EngineError::Oracle(format!("price response parse error: {e}")))?;

        let mut prices = HashMap::new();
        for (symbol, id) in COINGECKO_IDS {
            if let Some(usd) = body.get(*id).and_then(|quote| quote.get("usd")) {
                if let Ok(price) = Decimal::try_from(*usd) {
                    prices.insert(symbol.to_string(), price);
                }
            }
        }

        Ok(prices)
    }
}

#[async_trait]
impl PriceProvider for MarketDataClient {
    async fn current_prices(
        &self,
        coins: &[String],
    ) -> Result<HashMap<String, Decimal>, EngineError> {
        let all = match self.cached() {
            Some(prices) => prices,
            None => {
                let prices = self.fetch_all().await?;
                self.store(&prices);
                prices
            }
        };

        Ok(all
            .into_iter()
            .filter(|(symbol, _)| coins.iter().any(|c| c == symbol))
            .collect())
    }
}
