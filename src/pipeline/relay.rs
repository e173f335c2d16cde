//! Relay/forwarder: formats a qualifying offer, sends it to the
//! destination chat, then writes the dedup record.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::channels::ChannelSender;
use crate::error::RelayError;
use crate::extract::{ItemMetadata, Offer};
use crate::pipeline::types::CandidateMessage;
use crate::store::{Database, InsertOutcome, RelayedPost, source_handle};

/// Relayed text is cut to this many characters.
const MAX_RELAYED_TEXT_CHARS: usize = 3000;

/// Result of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Sent and recorded.
    Recorded,
    /// Sent, but a record for this message already existed.
    AlreadyRecorded,
}

/// Sends qualifying offers to one destination chat.
pub struct Relay {
    sender: Arc<dyn ChannelSender>,
    store: Arc<dyn Database>,
    target_chat_id: String,
}

impl Relay {
    pub fn new(
        sender: Arc<dyn ChannelSender>,
        store: Arc<dyn Database>,
        target_chat_id: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            store,
            target_chat_id: target_chat_id.into(),
        }
    }

    /// Send `message` and record it.
    ///
    /// The record is only written after the send succeeded. A send error
    /// leaves the message eligible for a later attempt.
    pub async fn relay(
        &self,
        message: &CandidateMessage,
        offer: &Offer,
        price: Decimal,
    ) -> Result<RelayOutcome, RelayError> {
        let text = message.text.clone().unwrap_or_default();
        let notification = format_offer_message(message, price, offer.item.as_ref());

        self.sender
            .send(&self.target_chat_id, &notification)
            .await?;

        info!(
            source = %message.source,
            message_id = message.message_id,
            price = %price,
            "Offer relayed"
        );

        let record = RelayedPost {
            source: message.source.clone(),
            original_id: message.message_id,
            text,
            relayed_at: Utc::now(),
            price,
            item: offer.item.clone(),
            message_at: message.timestamp,
        };

        match self.store.record_relayed(&record).await {
            Ok(InsertOutcome::Inserted) => Ok(RelayOutcome::Recorded),
            Ok(InsertOutcome::AlreadyExists) => Ok(RelayOutcome::AlreadyRecorded),
            Err(e) => {
                error!(
                    source = %message.source,
                    message_id = message.message_id,
                    error = %e,
                    "Offer sent but dedup record failed; it may be relayed again"
                );
                Err(RelayError::Record(e))
            }
        }
    }
}

/// Public permalink of a message, if the source has a handle.
pub fn permalink(source: &str, message_id: i64) -> Option<String> {
    source_handle(source).map(|handle| format!("https://t.me/{handle}/{message_id}"))
}

/// Build the notification text.
///
/// ```text
/// 🚗 New offer: $4500
/// Item: Toyota Corolla
/// Year: 2012
/// Source: https://t.me/example/42
///
/// <original text>
/// ```
pub fn format_offer_message(
    message: &CandidateMessage,
    price: Decimal,
    item: Option<&ItemMetadata>,
) -> String {
    let mut out = format!("🚗 New offer: ${}\n", price.normalize());

    if let Some(item) = item {
        let name: Vec<&str> = [item.brand.as_deref(), item.model.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if !name.is_empty() {
            out.push_str(&format!("Item: {}\n", name.join(" ")));
        }
        if let Some(year) = item.year {
            out.push_str(&format!("Year: {year}\n"));
        }
        if let Some(condition) = &item.condition {
            out.push_str(&format!("Condition: {condition}\n"));
        }
    }

    match permalink(&message.source, message.message_id) {
        Some(link) => out.push_str(&format!("Source: {link}\n")),
        None => out.push_str(&format!("Source: {}\n", message.source)),
    }

    if let Some(text) = message.text() {
        out.push('\n');
        out.push_str(&truncate_chars(text.trim(), MAX_RELAYED_TEXT_CHARS));
    }

    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
