//! External oracle clients: market prices and AI trade decisions.

mod decision;
mod price;
mod prompt;

pub use decision::{parse_decision, CoinDecision, Decision, DecisionClient, DecisionProvider};
pub use price::{MarketDataClient, PriceProvider};
pub use prompt::build_prompt;
