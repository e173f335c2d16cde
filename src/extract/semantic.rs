//! LLM-backed offer extraction.
//!
//! One completion per message with a fixed instruction. The model must
//! answer with a single JSON object; anything else fails closed.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::extract::{ItemMetadata, Offer, OfferExtractor};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Most deterministic sampling the backends offer.
const EXTRACTION_TEMPERATURE: f32 = 0.0;

/// The answer is a small JSON object.
const EXTRACTION_MAX_TOKENS: u32 = 300;

/// Message text sent to the model is capped to this many chars.
const MAX_INPUT_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You classify posts from public marketplace channels. \
     Decide whether the post offers an item for sale. If it does, extract the asking \
     price in US dollars and describe the item.\n\n\
     Respond with ONLY a JSON object, no commentary:\n\
     {\"is_sale\": true|false, \"price_usd\": number|null, \
     \"item\": {\"brand\": string|null, \"model\": string|null, \"year\": number|null, \"condition\": string|null}|null}\n\n\
     Rules:\n\
     - price_usd is null when the post names no price or a price in another currency you cannot convert\n\
     - Wanted/buying posts, ads for services and news are not sales\n\
     - Never invent fields that the post does not mention";

/// Semantic strategy backed by an [`LlmProvider`].
pub struct SemanticExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl SemanticExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Run the model and parse its answer, surfacing typed failures.
    pub async fn try_extract(&self, text: &str) -> Result<Offer, ExtractionError> {
        let input: String = text.chars().take(MAX_INPUT_CHARS).collect();
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Post:\n{input}")),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Extraction completion received"
        );
        parse_offer_response(&response.content)
    }
}

#[async_trait]
impl OfferExtractor for SemanticExtractor {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn extract(&self, text: &str) -> Offer {
        match self.try_extract(text).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(
                    model = self.llm.model_name(),
                    error = %e,
                    "Semantic extraction failed, treating message as non-qualifying"
                );
                Offer::not_qualifying()
            }
        }
    }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OfferResponse {
    is_sale: bool,
    #[serde(default)]
    price_usd: Option<serde_json::Value>,
    #[serde(default)]
    item: Option<ItemResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemResponse {
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    year: Option<serde_json::Value>,
    #[serde(default)]
    condition: Option<String>,
}

/// Parse the model's JSON answer into an [`Offer`].
fn parse_offer_response(raw: &str) -> Result<Offer, ExtractionError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ExtractionError::Malformed(format!("no JSON object in: {}", preview(raw))))?;
    let response: OfferResponse = serde_json::from_str(json)
        .map_err(|e| ExtractionError::Malformed(format!("JSON parse error: {e}")))?;

    if !response.is_sale {
        return Ok(Offer::not_qualifying());
    }

    let price = match response.price_usd {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(parse_price(&value)?),
    };

    let item = response.item.map(|item| ItemMetadata {
        brand: non_empty(item.brand),
        model: non_empty(item.model),
        year: item.year.as_ref().and_then(parse_year),
        condition: non_empty(item.condition),
    });

    Ok(Offer {
        is_qualifying: true,
        price,
        item: None,
    }
    .with_item(item.unwrap_or_default()))
}

/// Accept a JSON number or a numeric string. Anything else is malformed.
fn parse_price(value: &serde_json::Value) -> Result<Decimal, ExtractionError> {
    let raw = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().trim_start_matches('$').replace(',', ""),
        other => {
            return Err(ExtractionError::Malformed(format!(
                "price_usd is not numeric: {other}"
            )));
        }
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|e| ExtractionError::Malformed(format!("price_usd '{raw}': {e}")))
}

fn parse_year(value: &serde_json::Value) -> Option<i32> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Locate the single JSON object in model output. Tolerates a markdown
/// fence or prose around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&trimmed[start..=end]),
        _ => None,
    }
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Mock LLM that returns a fixed response and records the request.
    struct MockLlm {
        response: Result<String, String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl MockLlm {
        fn ok(content: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(content.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Err(reason.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock-extractor"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: reason.clone(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn full_offer_is_parsed() {
        let llm = MockLlm::ok(
            r#"{"is_sale": true, "price_usd": 4500, "item": {"brand": "Honda", "model": "Civic", "year": 2009, "condition": "good"}}"#,
        );
        let extractor = SemanticExtractor::new(llm);
        let offer = extractor.extract("Honda Civic 2009, 4500").await;

        assert!(offer.is_qualifying);
        assert_eq!(offer.price, Some(dec!(4500)));
        let item = offer.item.unwrap();
        assert_eq!(item.brand.as_deref(), Some("Honda"));
        assert_eq!(item.model.as_deref(), Some("Civic"));
        assert_eq!(item.year, Some(2009));
        assert_eq!(item.condition.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn request_is_deterministic() {
        let llm = MockLlm::ok(r#"{"is_sale": false}"#);
        let extractor = SemanticExtractor::new(llm.clone());
        extractor.extract("hello").await;

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].temperature, Some(0.0));
        assert!(seen[0].system_prompt().unwrap().contains("JSON"));
    }

    #[tokio::test]
    async fn not_a_sale() {
        let llm = MockLlm::ok(r#"{"is_sale": false, "price_usd": null, "item": null}"#);
        let offer = SemanticExtractor::new(llm).extract("Good morning!").await;
        assert_eq!(offer, Offer::not_qualifying());
    }

    #[tokio::test]
    async fn invalid_json_fails_closed() {
        let llm = MockLlm::ok("Sure! This looks like a car sale for about 4500 dollars.");
        let extractor = SemanticExtractor::new(llm);

        assert!(matches!(
            extractor.try_extract("x").await,
            Err(ExtractionError::Malformed(_))
        ));
        assert_eq!(extractor.extract("x").await, Offer::not_qualifying());
    }

    #[tokio::test]
    async fn truncated_json_fails_closed() {
        let llm = MockLlm::ok(r#"{"is_sale": true, "price_usd": 45"#);
        let offer = SemanticExtractor::new(llm).extract("x").await;
        assert_eq!(offer, Offer::not_qualifying());
    }

    #[tokio::test]
    async fn api_error_fails_closed() {
        let llm = MockLlm::failing("connection reset");
        let extractor = SemanticExtractor::new(llm);

        assert!(matches!(
            extractor.try_extract("x").await,
            Err(ExtractionError::Service(_))
        ));
        assert_eq!(extractor.extract("x").await, Offer::not_qualifying());
    }

    #[test]
    fn parse_fenced_response() {
        let raw = "```json\n{\"is_sale\": true, \"price_usd\": 9999.99}\n```";
        let offer = parse_offer_response(raw).unwrap();
        assert_eq!(offer.price, Some(dec!(9999.99)));
        assert!(offer.item.is_none());
    }

    #[test]
    fn parse_response_with_surrounding_text() {
        let raw = "Result: {\"is_sale\": true, \"price_usd\": \"$7,200\"} done";
        let offer = parse_offer_response(raw).unwrap();
        assert_eq!(offer.price, Some(dec!(7200)));
    }

    #[test]
    fn sale_without_price_keeps_qualifying_flag() {
        let offer = parse_offer_response(r#"{"is_sale": true, "price_usd": null}"#).unwrap();
        assert!(offer.is_qualifying);
        assert!(offer.price.is_none());
    }

    #[test]
    fn non_numeric_price_is_malformed() {
        let result = parse_offer_response(r#"{"is_sale": true, "price_usd": "negotiable"}"#);
        assert!(matches!(result, Err(ExtractionError::Malformed(_))));

        let result = parse_offer_response(r#"{"is_sale": true, "price_usd": [1]}"#);
        assert!(matches!(result, Err(ExtractionError::Malformed(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = parse_offer_response(r#"{"is_sale": true, "price": 100}"#);
        assert!(result.is_err());
    }

    #[test]
    fn year_as_string_and_blank_fields() {
        let raw = r#"{"is_sale": true, "price_usd": 3000, "item": {"brand": " ", "model": "Golf", "year": "2004", "condition": ""}}"#;
        let item = parse_offer_response(raw).unwrap().item.unwrap();
        assert!(item.brand.is_none());
        assert_eq!(item.model.as_deref(), Some("Golf"));
        assert_eq!(item.year, Some(2004));
        assert!(item.condition.is_none());
    }

    #[test]
    fn extract_json_rejects_plain_text() {
        assert!(extract_json_object("no object here").is_none());
        assert_eq!(extract_json_object(" {\"a\":1} "), Some("{\"a\":1}"));
    }
}
