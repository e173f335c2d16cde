//! Error types for Offer Relay.

use std::time::Duration;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Reading/writing connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to fetch history for {source_id} on channel {name}: {reason}")]
    HistoryFailed {
        name: String,
        source_id: String,
        reason: String,
    },

    #[error("Source {source_id} not found on channel {name}")]
    NotFound { name: String, source_id: String },

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Offer extraction errors. Never leave the extractor: they are logged
/// and the message is treated as non-qualifying.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction service call failed: {0}")]
    Service(#[from] LlmError),

    #[error("Malformed extraction response: {0}")]
    Malformed(String),
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The destination send failed. No dedup record was written.
    #[error("Relay send failed: {0}")]
    Send(#[from] ChannelError),

    /// The send succeeded but the dedup record could not be written.
    #[error("Relay record failed after send: {0}")]
    Record(#[from] DatabaseError),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source registry unavailable: {0}")]
    Registry(DatabaseError),

    #[error("Dedup lookup failed: {0}")]
    DedupLookup(DatabaseError),
}
