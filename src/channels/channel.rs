//! Reading and writing connection traits.
//!
//! The coordinator only sees these traits, so tests can swap in
//! in-memory fakes for the Telegram implementations.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::types::CandidateMessage;

/// Stream of live posts from all channels visible to the reader.
pub type PostStream = Pin<Box<dyn Stream<Item = CandidateMessage> + Send>>;

/// Reading connection: live subscription plus history lookup.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Start receiving live posts. Source identifiers on yielded messages
    /// are `@handle` when the channel has a public handle, else the
    /// numeric chat id. The stream ends when the reader shuts down.
    async fn subscribe(&self) -> Result<PostStream, ChannelError>;

    /// Messages posted to `source` at or after `since`, oldest first.
    async fn history(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateMessage>, ChannelError>;

    /// Confirm `source` exists and make its posts visible to this reader,
    /// joining the channel when needed. Returns the identifier the channel
    /// is known by (`@handle`, or the numeric id for private channels).
    async fn resolve_source(&self, source: &str) -> Result<String, ChannelError> {
        Ok(source.to_string())
    }

    /// Stop the live subscription and release resources.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Writing connection: delivers relay notifications.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn name(&self) -> &str;

    /// Send plain text to `chat_id`.
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Verify credentials and connectivity.
    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
