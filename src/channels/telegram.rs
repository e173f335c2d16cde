//! Telegram connections.
//!
//! - [`TelegramSender`]: Bot API `sendMessage` for relay notifications.
//! - [`TelegramReader`]: Bot API fallback reader. Live `channel_post`
//!   updates via long-polling, history via the public web preview.
//!
//! The primary reader is the user session in [`crate::channels::session`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::preview::{collect_window, parse_preview_page, preview_url};
use crate::channels::{ChannelReader, ChannelSender, PostStream};
use crate::error::ChannelError;
use crate::pipeline::types::CandidateMessage;
use crate::store::source_handle;

/// Maximum message length for Telegram's sendMessage API, in UTF-16 units.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const TELEGRAM_PREVIEW_BASE: &str = "https://t.me";

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Back-off after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on preview pages walked per history request.
const MAX_PREVIEW_PAGES: usize = 50;

fn api_url(bot_token: &SecretString, method: &str) -> String {
    format!(
        "{TELEGRAM_API_BASE}/bot{}/{method}",
        bot_token.expose_secret()
    )
}

/// Read `parameters.retry_after` from a Bot API error body.
fn retry_after(body: &serde_json::Value) -> Option<Duration> {
    body.get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_secs)
}

// ── Sender ──────────────────────────────────────────────────────────

/// Writing connection: posts plain-text messages through the Bot API.
pub struct TelegramSender {
    bot_token: SecretString,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl TelegramSender {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Send a text message, splitting at Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "sender is shut down".into(),
            });
        }
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Send a single chunk as plain text (no parse_mode: relayed text is
    /// arbitrary user content).
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let resp = self
            .client
            .post(api_url(&self.bot_token, "sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let err_body: serde_json::Value = resp.json().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
                retry_after: retry_after(&err_body),
            });
        }

        let description = err_body
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no description");
        Err(ChannelError::SendFailed {
            name: "telegram".into(),
            reason: format!("sendMessage returned {status}: {description}"),
        })
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_message(chat_id, text).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(api_url(&self.bot_token, "getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Telegram sender shutting down");
        }
        Ok(())
    }
}

// ── Reader ──────────────────────────────────────────────────────────

/// Bot API reading connection.
///
/// The reader bot must be an administrator of every monitored channel to
/// receive its `channel_post` updates. History only works for channels
/// with a public handle.
pub struct TelegramReader {
    bot_token: SecretString,
    client: reqwest::Client,
    stop: watch::Sender<bool>,
}

impl TelegramReader {
    pub fn new(bot_token: SecretString) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            bot_token,
            client: reqwest::Client::new(),
            stop,
        }
    }

    /// Fetch one preview page.
    async fn fetch_preview(&self, url: &str, source: &str) -> Result<String, ChannelError> {
        let history_failed = |reason: String| ChannelError::HistoryFailed {
            name: "telegram".into(),
            source_id: source.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| history_failed(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
                retry_after: None,
            });
        }
        if !status.is_success() {
            return Err(history_failed(format!("preview returned {status}")));
        }

        resp.text().await.map_err(|e| history_failed(e.to_string()))
    }
}

#[async_trait]
impl ChannelReader for TelegramReader {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn subscribe(&self) -> Result<PostStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = api_url(&self.bot_token, "getUpdates");
        let client = self.client.clone();
        let mut stop = self.stop.subscribe();

        if *stop.borrow() {
            return Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: "reader already shut down".into(),
            });
        }

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram reader listening for channel posts...");

            loop {
                if *stop.borrow() || tx.is_closed() {
                    break;
                }

                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["channel_post"]
                });

                let data = tokio::select! {
                    _ = stop.changed() => break,
                    result = poll_updates(&client, &url, &body) => result,
                };

                let data = match data {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e, "Telegram poll error");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if data.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
                    tracing::warn!(
                        description = data
                            .get("description")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("unknown"),
                        "Telegram getUpdates rejected"
                    );
                    let backoff = retry_after(&data).unwrap_or(POLL_ERROR_BACKOFF);
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                let Some(results) = data.get("result").and_then(serde_json::Value::as_array)
                else {
                    continue;
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = offset.max(uid + 1);
                    }

                    let Some(message) = parse_channel_post(update) else {
                        continue;
                    };

                    if tx.send(message).is_err() {
                        tracing::info!("Telegram reader stream dropped");
                        return;
                    }
                }
            }

            tracing::info!("Telegram reader stopped");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn history(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateMessage>, ChannelError> {
        let Some(handle) = source_handle(source) else {
            tracing::debug!(source, "No public preview for numeric source; skipping history");
            return Ok(Vec::new());
        };

        let collected = collect_window(since, MAX_PREVIEW_PAGES, |before| {
            let url = preview_url(TELEGRAM_PREVIEW_BASE, handle, before);
            async move {
                let html = self.fetch_preview(&url, source).await?;
                Ok::<_, ChannelError>(parse_preview_page(&html))
            }
        })
        .await?;

        tracing::debug!(source, count = collected.len(), "Fetched channel history");

        Ok(collected
            .into_iter()
            .map(|p| CandidateMessage::new(source, p.message_id, p.text, p.timestamp))
            .collect())
    }

    /// Look the chat up with `getChat`. The bot can only see channels it
    /// is a member of, and cannot join on its own.
    async fn resolve_source(&self, source: &str) -> Result<String, ChannelError> {
        let failed = |reason: String| ChannelError::StartupFailed {
            name: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .post(api_url(&self.bot_token, "getChat"))
            .json(&serde_json::json!({ "chat_id": source }))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| failed(e.to_string()))?;

        if body.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            tracing::debug!(
                source,
                description = body
                    .get("description")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown"),
                "getChat rejected"
            );
            return Err(ChannelError::NotFound {
                name: "telegram".into(),
                source_id: source.to_string(),
            });
        }

        body.get("result")
            .and_then(chat_identifier)
            .ok_or_else(|| failed("getChat result has no chat id".into()))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram reader shutting down");
        self.stop.send_replace(true);
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn poll_updates(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value, reqwest::Error> {
    client.post(url).json(body).send().await?.json().await
}

/// `@username` for public chats, else the numeric chat id.
fn chat_identifier(chat: &serde_json::Value) -> Option<String> {
    match chat.get("username").and_then(serde_json::Value::as_str) {
        Some(username) => Some(format!("@{username}")),
        None => chat
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .map(|id| id.to_string()),
    }
}

/// Convert a `channel_post` update into a candidate message.
///
/// Text comes from `text`, or `caption` for media posts.
fn parse_channel_post(update: &serde_json::Value) -> Option<CandidateMessage> {
    let post = update.get("channel_post")?;
    let source = chat_identifier(post.get("chat")?)?;
    let message_id = post.get("message_id").and_then(serde_json::Value::as_i64)?;
    let timestamp = post
        .get("date")
        .and_then(serde_json::Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    let text = post
        .get("text")
        .or_else(|| post.get("caption"))
        .and_then(serde_json::Value::as_str)
        .map(String::from);

    Some(CandidateMessage::new(source, message_id, text, timestamp))
}

/// Byte offset where `text` exceeds `max_units` UTF-16 code units, or
/// `None` when the whole text fits.
fn fit_boundary(text: &str, max_units: usize) -> Option<usize> {
    let mut units = 0;
    for (offset, c) in text.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            return Some(offset);
        }
    }
    None
}

/// Split a message into chunks that fit Telegram's length limit, which
/// counts UTF-16 code units rather than bytes.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let Some(limit) = fit_boundary(remaining, max_len) else {
            chunks.push(remaining.to_string());
            break;
        };

        // At least one character per chunk.
        let limit = if limit == 0 {
            remaining.chars().next().map_or(0, char::len_utf8)
        } else {
            limit
        };

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_includes_token() {
        let token = SecretString::from("123:ABC");
        assert_eq!(
            api_url(&token, "getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn names() {
        let sender = TelegramSender::new(SecretString::from("t"));
        let reader = TelegramReader::new(SecretString::from("t"));
        assert_eq!(sender.name(), "telegram");
        assert_eq!(reader.name(), "telegram");
    }

    // ── channel_post parsing ────────────────────────────────────────

    #[test]
    fn parses_public_channel_post() {
        let update = serde_json::json!({
            "update_id": 10,
            "channel_post": {
                "message_id": 77,
                "chat": {"id": -1001, "username": "example", "type": "channel"},
                "date": 1_767_225_600,
                "text": "Selling, $4500 OBO"
            }
        });
        let msg = parse_channel_post(&update).unwrap();
        assert_eq!(msg.source, "@example");
        assert_eq!(msg.message_id, 77);
        assert_eq!(msg.text.as_deref(), Some("Selling, $4500 OBO"));
        assert_eq!(msg.timestamp.timestamp(), 1_767_225_600);
    }

    #[test]
    fn private_channel_uses_chat_id() {
        let update = serde_json::json!({
            "update_id": 11,
            "channel_post": {
                "message_id": 3,
                "chat": {"id": -1002, "type": "channel"},
                "date": 1_767_225_600,
                "caption": "photo caption $900"
            }
        });
        let msg = parse_channel_post(&update).unwrap();
        assert_eq!(msg.source, "-1002");
        assert_eq!(msg.text.as_deref(), Some("photo caption $900"));
    }

    #[test]
    fn media_post_without_caption_has_no_text() {
        let update = serde_json::json!({
            "update_id": 12,
            "channel_post": {
                "message_id": 4,
                "chat": {"id": -1002, "username": "example"},
                "date": 1_767_225_600,
                "photo": []
            }
        });
        assert_eq!(parse_channel_post(&update).unwrap().text, None);
    }

    #[test]
    fn non_channel_updates_are_ignored() {
        let update = serde_json::json!({
            "update_id": 13,
            "message": {"message_id": 1, "chat": {"id": 5}, "text": "hi"}
        });
        assert!(parse_channel_post(&update).is_none());
    }

    #[test]
    fn chat_identifier_prefers_username() {
        assert_eq!(
            chat_identifier(&serde_json::json!({"id": -1001, "username": "example"})).as_deref(),
            Some("@example")
        );
        assert_eq!(
            chat_identifier(&serde_json::json!({"id": -1002, "type": "channel"})).as_deref(),
            Some("-1002")
        );
        assert_eq!(chat_identifier(&serde_json::json!({"type": "channel"})), None);
    }

    #[tokio::test]
    async fn send_after_shutdown_fails_without_a_request() {
        let sender = TelegramSender::new(SecretString::from("t"));
        sender.shutdown().await.unwrap();
        sender.shutdown().await.unwrap();
        let result = sender.send("42", "hello").await;
        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
    }

    #[test]
    fn retry_after_from_error_body() {
        let body = serde_json::json!({
            "ok": false,
            "error_code": 429,
            "parameters": {"retry_after": 7}
        });
        assert_eq!(retry_after(&body), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(&serde_json::json!({"ok": false})), None);
    }

    // ── History ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn numeric_source_has_empty_history() {
        let reader = TelegramReader::new(SecretString::from("t"));
        let history = reader.history("-1001234", Utc::now()).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let reader = TelegramReader::new(SecretString::from("t"));
        reader.shutdown().await.unwrap();
        assert!(reader.subscribe().await.is_err());
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_counts_characters_not_bytes() {
        // 3000 two-byte letters are 6000 bytes but fit in one message.
        let msg = "ц".repeat(3000);
        assert_eq!(split_message(&msg, 4096), vec![msg.clone()]);

        let msg = "ц".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks.concat(), msg);
    }

    #[test]
    fn split_message_counts_astral_chars_twice() {
        // Emoji outside the BMP take two UTF-16 units each.
        let msg = "😀".repeat(3000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2048);
        assert_eq!(chunks.concat(), msg);
    }

    #[test]
    fn cyrillic_relay_near_the_cap_is_one_message() {
        use crate::pipeline::format_offer_message;

        let text = "Продам велосипед у доброму стані, ціна 4500 грн, самовивіз. "
            .repeat(60);
        let message = CandidateMessage::new("@example", 41, Some(text), Utc::now());
        let relay = format_offer_message(&message, rust_decimal_macros::dec!(4500), None);

        // Body is cut at the relay text cap, still well over 4096 bytes.
        assert!(relay.chars().count() > 3000);
        assert!(relay.len() > TELEGRAM_MAX_MESSAGE_LENGTH);
        assert_eq!(split_message(&relay, TELEGRAM_MAX_MESSAGE_LENGTH).len(), 1);
    }
}
