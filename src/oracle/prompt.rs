//! Prompt construction for the decision oracle.
//!
//! The oracle must return JSON that parses straight into a
//! [`super::Decision`], so the contract is spelled out verbatim.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::db::ConversationRecord;
use crate::models::AccountSnapshot;

/// Build the decision prompt from the current valuation, market prices
/// and recent decision history.
pub fn build_prompt(
    account: &AccountSnapshot,
    prices: &HashMap<String, Decimal>,
    history: &[ConversationRecord],
    coins: &[String],
) -> String {
    let mut price_lines = String::new();
    for coin in coins {
        match prices.get(coin) {
            Some(price) => price_lines.push_str(&format!("- {coin}: ${price}\n")),
            None => price_lines.push_str(&format!("- {coin}: unavailable\n")),
        }
    }

    let positions = if account.positions.is_empty() {
        "(none)\n".to_string()
    } else {
        let mut lines = String::new();
        for p in &account.positions {
            let mark = p
                .current_price
                .map(|m| format!("{m}"))
                .unwrap_or_else(|| "n/a".to_string());
            lines.push_str(&format!(
                "- {} {} x{}: qty {} @ avg {} | mark {} | unrealized pnl {}\n",
                p.coin, p.side, p.leverage, p.quantity, p.avg_price, mark, p.unrealized_pnl
            ));
        }
        lines
    };

    // Newest first, rationale only; raw responses are too noisy to replay.
    let recent = history
        .iter()
        .filter_map(|c| c.cot_trace.as_deref())
        .filter(|t| !t.is_empty())
        .take(5)
        .enumerate()
        .map(|(i, t)| format!("{}. {t}\n", i + 1))
        .collect::<String>();
    let recent = if recent.is_empty() {
        "(none)\n".to_string()
    } else {
        recent
    };

    let coin_list = coins.join(", ");

    format!(
        r#"You manage a simulated leveraged crypto portfolio. Decide what to do for each coin.

## Account
- Cash available: ${cash}
- Margin in use: ${margin}
- Realized PnL: ${realized}
- Unrealized PnL: ${unrealized}
- Total account value: ${total}

## Open Positions
{positions}
## Current Prices (USD)
{price_lines}
## Your Recent Rationale (newest first)
{recent}
## Your Task
Return a decision for every coin in: {coin_list}.

**CRITICAL**: Respond with ONLY a valid JSON object. No explanations, no markdown, no code fences.

## Required JSON Format
{{
  "rationale": "<your overall reasoning, max 300 chars>",
  "signals": {{
    "BTC": {{"signal": "open_long", "quantity": 0.5, "leverage": 3}},
    "ETH": {{"signal": "hold"}}
  }}
}}

## Rules
1. "signal" must be one of: open_long, open_short, close_long, close_short, hold
2. Opens require a positive "quantity" (in coins) and an integer "leverage" >= 1
3. Closes may omit "quantity" to close the whole position
4. Margin used across all positions must stay within your available cash
5. If conditions are unclear for a coin, use "hold"

Respond with JSON only:"#,
        cash = account.cash,
        margin = account.margin_used,
        realized = account.realized_pnl,
        unrealized = account.unrealized_pnl,
        total = account.total_value,
    )
}
