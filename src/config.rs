//! Runtime configuration loaded from environment variables.

use std::time::Duration;

/// The fixed coin universe every model trades.
pub const COIN_UNIVERSE: &[&str] = &["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE"];

/// Service configuration with deployment defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address for the management API
    pub host: String,

    /// HTTP port for the management API
    pub port: u16,

    /// Pause between full sweeps of all models
    pub cycle_interval: Duration,

    /// Re-check pause while no models are registered
    pub idle_interval: Duration,

    /// Pause after an unexpected loop-level failure
    pub error_backoff: Duration,

    /// Base URL of the market data API
    pub market_api_url: String,

    /// How long fetched prices stay fresh
    pub price_cache: Duration,

    /// Coins every model receives signals for
    pub coins: Vec<String>,

    /// How many past conversations feed the decision prompt
    pub history_limit: u32,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 5000),
            cycle_interval: Duration::from_secs(env_parse("TRADING_INTERVAL", 180)),
            idle_interval: Duration::from_secs(env_parse("IDLE_INTERVAL", 30)),
            error_backoff: Duration::from_secs(env_parse("ERROR_BACKOFF", 60)),
            market_api_url: env_or("MARKET_API_URL", "https://api.coingecko.com/api/v3"),
            price_cache: Duration::from_secs(env_parse("MARKET_API_CACHE", 5)),
            coins: std::env::var("COINS")
                .map(|v| {
                    v.split(',')
                        .map(|c| c.trim().to_uppercase())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| COIN_UNIVERSE.iter().map(|c| c.to_string()).collect()),
            history_limit: env_parse("CONVERSATION_HISTORY", 5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
