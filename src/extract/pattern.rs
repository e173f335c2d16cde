//! Deterministic price extraction from currency markers.

use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::extract::{Offer, OfferExtractor};

/// Digits, optional comma groups of three, optional two-digit fraction.
const AMOUNT: &str = r"([0-9]+(?:,[0-9]{3})*(?:\.[0-9]{2})?)";

/// Currency patterns in precedence order. First match wins.
static PRICE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"\$\s*{AMOUNT}"),
        format!(r"{AMOUNT}\s*\$"),
        format!(r"(?i){AMOUNT}\s*usd"),
        format!(r"(?i){AMOUNT}\s*(?:дол|dol)"),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("price pattern is valid"))
    .collect()
});

/// Find the first currency-marked amount in `text`.
///
/// Patterns are tried in precedence order and the first one that matches
/// decides. Returns `None` when nothing matches or when that match does
/// not parse (e.g. more digits than a `Decimal` holds); lower-precedence
/// patterns are not consulted in that case.
pub fn extract_price_heuristic(text: &str) -> Option<Decimal> {
    let caps = PRICE_PATTERNS.iter().find_map(|pattern| pattern.captures(text))?;
    let raw = caps[1].replace(',', "");
    match Decimal::from_str(&raw) {
        Ok(price) => Some(price),
        Err(e) => {
            debug!(raw = %raw, error = %e, "Matched amount did not parse");
            None
        }
    }
}

/// Pattern strategy: a price marker alone makes the message qualifying.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

#[async_trait]
impl OfferExtractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn extract(&self, text: &str) -> Offer {
        match extract_price_heuristic(text) {
            Some(price) => Offer::priced(price),
            None => Offer::not_qualifying(),
        }
    }
}
