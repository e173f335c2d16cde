//! Offer extraction strategies.
//!
//! Two interchangeable variants behind one capability:
//! - [`PatternExtractor`]: deterministic currency-marker regexes, no I/O.
//! - [`SemanticExtractor`]: LLM classification + structured extraction.
//!
//! Callers hold an `Arc<dyn OfferExtractor>` and never branch on the variant.

pub mod pattern;
pub mod semantic;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use pattern::{PatternExtractor, extract_price_heuristic};
pub use semantic::SemanticExtractor;

/// Structured description of the item on offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl ItemMetadata {
    /// True when no field carries information.
    pub fn is_empty(&self) -> bool {
        self.brand.is_none() && self.model.is_none() && self.year.is_none() && self.condition.is_none()
    }
}

/// Result of running an extractor over one message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub is_qualifying: bool,
    pub price: Option<Decimal>,
    pub item: Option<ItemMetadata>,
}

impl Offer {
    /// The fail-closed result.
    pub fn not_qualifying() -> Self {
        Self {
            is_qualifying: false,
            price: None,
            item: None,
        }
    }

    /// A sale offer at `price`.
    pub fn priced(price: Decimal) -> Self {
        Self {
            is_qualifying: true,
            price: Some(price),
            item: None,
        }
    }

    pub fn with_item(mut self, item: ItemMetadata) -> Self {
        self.item = if item.is_empty() { None } else { Some(item) };
        self
    }
}

/// Maps raw message text to an [`Offer`].
///
/// Implementations must not fail: any internal error is logged and
/// reported as [`Offer::not_qualifying`].
#[async_trait]
pub trait OfferExtractor: Send + Sync {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    async fn extract(&self, text: &str) -> Offer;
}
