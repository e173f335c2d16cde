//! Shared types for the offer pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Candidate message ───────────────────────────────────────────────

/// A message from a monitored source, live or historical.
///
/// Reading connections convert their native format into this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    /// Source identifier as registered (`@handle` or numeric chat id).
    pub source: String,
    /// Message id, unique within the source.
    pub message_id: i64,
    /// `None` for media-only or service messages.
    pub text: Option<String>,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
}

impl CandidateMessage {
    pub fn new(
        source: impl Into<String>,
        message_id: i64,
        text: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            message_id,
            text,
            timestamp,
        }
    }

    /// Message text, if it has any non-blank text.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// What the pipeline decided for one candidate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Media-only or empty message.
    SkippedNoText,
    /// Not a sale offer, or no usable price.
    NotQualifying,
    /// Price above the configured ceiling.
    OverCeiling { price: Decimal },
    /// Already relayed earlier, or being relayed by the other feed right now.
    AlreadyRelayed,
    /// Sent to the destination and recorded.
    Relayed { price: Decimal },
    /// Send failed; no record written, still eligible next time.
    SendFailed,
}

impl ProcessOutcome {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SkippedNoText => "skipped_no_text",
            Self::NotQualifying => "not_qualifying",
            Self::OverCeiling { .. } => "over_ceiling",
            Self::AlreadyRelayed => "already_relayed",
            Self::Relayed { .. } => "relayed",
            Self::SendFailed => "send_failed",
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::Relayed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_counts_as_no_text() {
        let msg = CandidateMessage::new("@a", 1, Some("  \n ".into()), Utc::now());
        assert_eq!(msg.text(), None);

        let msg = CandidateMessage::new("@a", 1, None, Utc::now());
        assert_eq!(msg.text(), None);

        let msg = CandidateMessage::new("@a", 1, Some("hi".into()), Utc::now());
        assert_eq!(msg.text(), Some("hi"));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(ProcessOutcome::SkippedNoText.label(), "skipped_no_text");
        assert!(ProcessOutcome::Relayed { price: Decimal::ONE }.is_relayed());
        assert!(!ProcessOutcome::SendFailed.is_relayed());
    }
}
