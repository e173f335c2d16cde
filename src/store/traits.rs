//! Unified `Database` trait: single async interface for all persistence.
//!
//! Two collections: the source registry and the relayed-post dedup store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::DatabaseError;
use crate::extract::ItemMetadata;

/// A monitored channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// `@handle` or a numeric chat id.
    pub identifier: String,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
}

impl Source {
    /// Public handle without the `@`, if the source has one.
    pub fn handle(&self) -> Option<&str> {
        source_handle(&self.identifier)
    }

    /// Telegram handles are case-insensitive.
    pub fn matches(&self, identifier: &str) -> bool {
        self.identifier.eq_ignore_ascii_case(identifier)
    }
}

/// `@name` → `Some("name")`; numeric chat ids have no handle.
pub fn source_handle(identifier: &str) -> Option<&str> {
    identifier.strip_prefix('@').filter(|h| !h.is_empty())
}

/// Canonical form of a user-supplied source identifier.
///
/// Accepts `name`, `@name`, `t.me/name` or `https://t.me/name`. Numeric
/// chat ids (optionally negative) are returned unchanged.
pub fn normalize_source(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_link = ["https://t.me/", "http://t.me/", "t.me/"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let digits = without_link.strip_prefix('-').unwrap_or(without_link);
    let is_numeric = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());

    if is_numeric || without_link.starts_with('@') {
        without_link.to_string()
    } else {
        format!("@{without_link}")
    }
}

/// Proof that an original message has been relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedPost {
    pub source: String,
    pub original_id: i64,
    pub text: String,
    pub relayed_at: DateTime<Utc>,
    pub price: Decimal,
    pub item: Option<ItemMetadata>,
    /// When the original message was posted.
    pub message_at: DateTime<Utc>,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same (source, original_id) already exists.
    AlreadyExists,
}

/// Backend-agnostic database trait covering sources and relayed posts.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Sources ─────────────────────────────────────────────────────

    /// Register a source. Returns `false` if it was already registered.
    async fn add_source(&self, identifier: &str, added_by: &str) -> Result<bool, DatabaseError>;

    /// Unregister a source. Returns `false` if it was not registered.
    async fn remove_source(&self, identifier: &str) -> Result<bool, DatabaseError>;

    /// All registered sources, oldest first.
    async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError>;

    // ── Relayed posts ───────────────────────────────────────────────

    /// Whether `(source, original_id)` has already been relayed.
    async fn is_relayed(&self, source: &str, original_id: i64) -> Result<bool, DatabaseError>;

    /// Record a relayed post. Inserting the same `(source, original_id)`
    /// twice is a no-op that reports [`InsertOutcome::AlreadyExists`].
    async fn record_relayed(&self, post: &RelayedPost) -> Result<InsertOutcome, DatabaseError>;

    /// Look up one relayed post.
    async fn get_relayed(
        &self,
        source: &str,
        original_id: i64,
    ) -> Result<Option<RelayedPost>, DatabaseError>;

    /// Total number of relayed posts.
    async fn count_relayed(&self) -> Result<u64, DatabaseError>;

    /// Release the underlying connection. Further calls may fail.
    async fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
