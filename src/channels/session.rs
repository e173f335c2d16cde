//! User-session reader over MTProto.
//!
//! Signs in as a regular account, so it sees every channel the account
//! has joined, public or private, and reads history directly instead of
//! through the web preview. The session file is created by
//! `offer-relay session login` and saved again on shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grammers_client::types::{Chat, Message};
use grammers_client::{Client, Config, InitParams, InvocationError, SignInError, Update};
use grammers_session::{PackedChat, PackedType, Session};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::channels::{ChannelReader, PostStream};
use crate::config::SessionSettings;
use crate::error::ChannelError;
use crate::pipeline::types::CandidateMessage;
use crate::store::source_handle;

const NAME: &str = "session";

/// Back-off after a failed update fetch.
const UPDATE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Offset Telegram adds to channel and supergroup ids in their marked form.
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

fn startup_failed(reason: impl ToString) -> ChannelError {
    ChannelError::StartupFailed {
        name: NAME.into(),
        reason: reason.to_string(),
    }
}

/// Map a failed request about `source`, keeping flood waits distinct.
fn request_failed(source: &str, e: InvocationError) -> ChannelError {
    match &e {
        InvocationError::Rpc(rpc) if rpc.code == 420 => ChannelError::RateLimited {
            name: NAME.into(),
            retry_after: rpc.value.map(|secs| Duration::from_secs(u64::from(secs))),
        },
        _ => ChannelError::HistoryFailed {
            name: NAME.into(),
            source_id: source.to_string(),
            reason: e.to_string(),
        },
    }
}

async fn open_client(settings: &SessionSettings) -> Result<Client, ChannelError> {
    if let Some(dir) = settings
        .session_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        tokio::fs::create_dir_all(dir).await.map_err(startup_failed)?;
    }

    let session = Session::load_file_or_create(&settings.session_path).map_err(|e| {
        startup_failed(format!(
            "cannot open session file {}: {e}",
            settings.session_path.display()
        ))
    })?;

    Client::connect(Config {
        session,
        api_id: settings.api_id,
        api_hash: settings.api_hash.expose_secret().to_string(),
        params: InitParams {
            catch_up: false,
            ..Default::default()
        },
    })
    .await
    .map_err(startup_failed)
}

fn save_session(client: &Client, path: &Path) -> Result<(), ChannelError> {
    client
        .session()
        .save_to_file(path)
        .map_err(|e| startup_failed(format!("cannot save session to {}: {e}", path.display())))
}

/// Sign the account in and save the session file.
///
/// `prompt` shows its label and returns the line typed in reply; it is
/// asked for the login code, then for the cloud password when the account
/// has one.
pub async fn login<F>(settings: &SessionSettings, phone: &str, mut prompt: F) -> Result<(), ChannelError>
where
    F: FnMut(&str) -> std::io::Result<String>,
{
    let client = open_client(settings).await?;

    if client.is_authorized().await.map_err(startup_failed)? {
        info!("Session already signed in");
        return save_session(&client, &settings.session_path);
    }

    let token = client
        .request_login_code(phone)
        .await
        .map_err(startup_failed)?;
    let code = prompt("Login code: ").map_err(startup_failed)?;

    match client.sign_in(&token, code.trim()).await {
        Ok(_) => {}
        Err(SignInError::PasswordRequired(password_token)) => {
            let label = match password_token.hint() {
                Some(hint) => format!("Cloud password (hint: {hint}): "),
                None => "Cloud password: ".to_string(),
            };
            let password = prompt(&label).map_err(startup_failed)?;
            client
                .check_password(password_token, password.trim())
                .await
                .map_err(startup_failed)?;
        }
        Err(e) => return Err(startup_failed(e)),
    }

    save_session(&client, &settings.session_path)?;
    info!(session = %settings.session_path.display(), "Session signed in");
    Ok(())
}

/// Reading connection backed by a signed-in user session.
pub struct SessionReader {
    client: Client,
    session_path: PathBuf,
    /// Resolved chats keyed by lowercased source identifier.
    chats: Mutex<HashMap<String, PackedChat>>,
    stop: watch::Sender<bool>,
}

impl SessionReader {
    /// Connect with an existing session file. Fails when the session has
    /// not been signed in yet.
    pub async fn connect(settings: &SessionSettings) -> Result<Self, ChannelError> {
        let client = open_client(settings).await?;

        if !client.is_authorized().await.map_err(startup_failed)? {
            return Err(startup_failed(
                "session is not signed in; run `offer-relay session login` first",
            ));
        }

        info!(session = %settings.session_path.display(), "Reader session connected");

        let (stop, _) = watch::channel(false);
        Ok(Self {
            client,
            session_path: settings.session_path.clone(),
            chats: Mutex::new(HashMap::new()),
            stop,
        })
    }

    fn cached(&self, key: &str) -> Option<PackedChat> {
        self.chats.lock().ok()?.get(key).copied()
    }

    fn remember(&self, source: &str, chat: PackedChat) {
        if let Ok(mut chats) = self.chats.lock() {
            chats.insert(source.to_lowercase(), chat);
        }
    }

    /// Find the chat behind `source`: handles are resolved by name, numeric
    /// ids are looked up among the account's dialogs.
    async fn lookup(&self, source: &str) -> Result<Chat, ChannelError> {
        let not_found = || ChannelError::NotFound {
            name: NAME.into(),
            source_id: source.to_string(),
        };

        if let Some(handle) = source_handle(source) {
            return self
                .client
                .resolve_username(handle)
                .await
                .map_err(|e| request_failed(source, e))?
                .ok_or_else(not_found);
        }

        let wanted: i64 = source.parse().map_err(|_| not_found())?;
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| request_failed(source, e))?
        {
            let chat = dialog.chat();
            let packed = chat.pack();
            if marked_id(packed.ty, packed.id) == wanted {
                return Ok(chat.clone());
            }
        }
        Err(not_found())
    }

    async fn packed_chat(&self, source: &str) -> Result<PackedChat, ChannelError> {
        if let Some(chat) = self.cached(&source.to_lowercase()) {
            return Ok(chat);
        }
        let chat = self.lookup(source).await?.pack();
        self.remember(source, chat);
        Ok(chat)
    }
}

#[async_trait]
impl ChannelReader for SessionReader {
    fn name(&self) -> &str {
        NAME
    }

    async fn subscribe(&self) -> Result<PostStream, ChannelError> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Err(startup_failed("reader already shut down"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            info!("Session reader listening for new messages...");

            loop {
                let update = tokio::select! {
                    _ = stop.changed() => break,
                    update = client.next_update() => update,
                };

                match update {
                    Ok(Update::NewMessage(message)) if !message.outgoing() => {
                        if tx.send(live_candidate(&message)).is_err() {
                            info!("Session reader stream dropped");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Session update error");
                        tokio::time::sleep(UPDATE_ERROR_BACKOFF).await;
                    }
                }
            }

            info!("Session reader stopped");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn history(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateMessage>, ChannelError> {
        let chat = self.packed_chat(source).await?;

        // Newest first; stop at the first message older than the window.
        let mut messages = self.client.iter_messages(chat);
        let mut collected = Vec::new();
        while let Some(message) = messages
            .next()
            .await
            .map_err(|e| request_failed(source, e))?
        {
            if message.date() < since {
                break;
            }
            collected.push(candidate(source, &message));
        }
        collected.reverse();

        debug!(source, count = collected.len(), "Fetched channel history");
        Ok(collected)
    }

    async fn resolve_source(&self, source: &str) -> Result<String, ChannelError> {
        let chat = self.lookup(source).await?;
        let packed = chat.pack();

        if !matches!(chat, Chat::User(_)) {
            match self.client.join_chat(packed).await {
                Ok(_) => {}
                Err(InvocationError::Rpc(rpc)) if rpc.name == "USER_ALREADY_PARTICIPANT" => {}
                Err(e) => return Err(request_failed(source, e)),
            }
        }

        let identifier = chat_identifier(&chat);
        self.remember(source, packed);
        self.remember(&identifier, packed);

        info!(source, identifier = %identifier, "Source resolved and joined");
        Ok(identifier)
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        info!("Session reader shutting down");
        self.stop.send_replace(true);
        save_session(&self.client, &self.session_path)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Bot-API style id: users as-is, basic groups negated, channels and
/// supergroups prefixed with -100.
fn marked_id(ty: PackedType, id: i64) -> i64 {
    match ty {
        PackedType::User | PackedType::Bot => id,
        PackedType::Chat => -id,
        _ => -(CHANNEL_ID_OFFSET + id),
    }
}

/// `@username` when the chat has one, else its marked id.
fn source_identifier(username: Option<&str>, ty: PackedType, id: i64) -> String {
    match username.filter(|u| !u.is_empty()) {
        Some(username) => format!("@{username}"),
        None => marked_id(ty, id).to_string(),
    }
}

fn chat_identifier(chat: &Chat) -> String {
    let packed = chat.pack();
    source_identifier(chat.username(), packed.ty, packed.id)
}

fn candidate(source: impl Into<String>, message: &Message) -> CandidateMessage {
    CandidateMessage::new(
        source,
        i64::from(message.id()),
        Some(message.text().to_string()),
        message.date(),
    )
}

fn live_candidate(message: &Message) -> CandidateMessage {
    candidate(chat_identifier(&message.chat()), message)
}
