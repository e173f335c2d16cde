//! Configuration types.
//!
//! Everything is read from the environment (a `.env` file is loaded first
//! by the binary). The writer bot token, the destination chat and a
//! reading connection are mandatory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default price ceiling (inclusive) in USD.
pub const DEFAULT_PRICE_CEILING: i64 = 10_000;

/// Default time between the end of one backfill cycle and the start of the next.
pub const DEFAULT_BACKFILL_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Default trailing window walked by a periodic backfill cycle.
pub const DEFAULT_BACKFILL_WINDOW_HOURS: i64 = 6;

/// Trailing window walked by an on-demand catch-up.
pub const CATCH_UP_WINDOW_HOURS: i64 = 72;

/// Pause after every successful relay during backfill.
pub const DEFAULT_RELAY_PAUSE: Duration = Duration::from_secs(1);

const DEFAULT_DB_PATH: &str = "./data/offer-relay.db";
const DEFAULT_SESSION_PATH: &str = "./data/reader.session";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";

/// Credentials of the user session that reads channels.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Application id from my.telegram.org.
    pub api_id: i32,
    pub api_hash: SecretString,
    /// Where the signed-in session is persisted between runs.
    pub session_path: PathBuf,
}

/// How monitored channels are read.
#[derive(Debug, Clone)]
pub enum ReaderConfig {
    /// Signed-in user session; sees every channel the account has joined.
    Session(SessionSettings),
    /// Bot API fallback; only channels where the bot is an administrator
    /// stream live, and history needs a public handle.
    Bot { token: SecretString },
}

/// Runtime configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Token of the bot that writes to the destination chat.
    pub bot_token: SecretString,
    /// Reading connection for the monitored channels.
    pub reader: ReaderConfig,
    /// Destination chat id.
    pub target_chat_id: String,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Semantic extraction backend. `None` disables the live feed's
    /// semantic strategy and falls back to the pattern strategy.
    pub llm: Option<LlmConfig>,
    /// Inclusive price ceiling.
    pub price_ceiling: Decimal,
    pub backfill_interval: Duration,
    /// Optional random jitter added to each backfill sleep.
    pub backfill_jitter: Option<Duration>,
    pub backfill_window_hours: i64,
    pub relay_pause: Duration,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = required("BOT_TOKEN", "Create a bot with @BotFather and export its token")?;
        let reader = reader_from_env()?;
        let target_chat_id = required(
            "TARGET_CHAT_ID",
            "Set the chat id that receives relayed offers",
        )?;

        let db_path = db_path_from_env();

        let price_ceiling = match std::env::var("OFFER_RELAY_PRICE_CEILING") {
            Ok(raw) => Decimal::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                key: "OFFER_RELAY_PRICE_CEILING".into(),
                message: e.to_string(),
            })?,
            Err(_) => Decimal::from(DEFAULT_PRICE_CEILING),
        };
        if price_ceiling <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "OFFER_RELAY_PRICE_CEILING".into(),
                message: format!("must be positive, got {price_ceiling}"),
            });
        }

        let backfill_interval = parsed::<u64>("OFFER_RELAY_BACKFILL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BACKFILL_INTERVAL);
        let backfill_jitter =
            parsed::<u64>("OFFER_RELAY_BACKFILL_JITTER_SECS")?.map(Duration::from_secs);
        let backfill_window_hours = parsed::<i64>("OFFER_RELAY_BACKFILL_WINDOW_HOURS")?
            .unwrap_or(DEFAULT_BACKFILL_WINDOW_HOURS);
        let relay_pause = parsed::<u64>("OFFER_RELAY_RELAY_PAUSE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RELAY_PAUSE);

        if backfill_window_hours <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "OFFER_RELAY_BACKFILL_WINDOW_HOURS".into(),
                message: "must be positive".into(),
            });
        }

        let log_dir = log_dir_from_env();

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            reader,
            target_chat_id,
            db_path,
            llm: llm_from_env(),
            price_ceiling,
            backfill_interval,
            backfill_jitter,
            backfill_window_hours,
            relay_pause,
            log_dir,
        })
    }
}

/// Database path; usable without the bot settings.
pub fn db_path_from_env() -> PathBuf {
    std::env::var("OFFER_RELAY_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH))
}

/// Reading connection; usable without the writer settings.
pub fn reader_from_env() -> Result<ReaderConfig, ConfigError> {
    reader_config(|key| std::env::var(key).ok())
}

/// `TELEGRAM_API_ID` selects the user session. Without it the reader falls
/// back to `READER_BOT_TOKEN`, then `BOT_TOKEN`.
fn reader_config(var: impl Fn(&str) -> Option<String>) -> Result<ReaderConfig, ConfigError> {
    let var = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(raw_id) = var("TELEGRAM_API_ID") {
        let api_id = raw_id.parse::<i32>().map_err(|e| ConfigError::InvalidValue {
            key: "TELEGRAM_API_ID".into(),
            message: e.to_string(),
        })?;
        let api_hash = var("TELEGRAM_API_HASH").ok_or_else(|| ConfigError::MissingRequired {
            key: "TELEGRAM_API_HASH".into(),
            hint: "Copy the API hash shown next to the API id on my.telegram.org".into(),
        })?;
        let session_path = var("TELEGRAM_SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_PATH));

        return Ok(ReaderConfig::Session(SessionSettings {
            api_id,
            api_hash: SecretString::from(api_hash),
            session_path,
        }));
    }

    var("READER_BOT_TOKEN")
        .or_else(|| var("BOT_TOKEN"))
        .map(|token| ReaderConfig::Bot {
            token: SecretString::from(token),
        })
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "TELEGRAM_API_ID".into(),
            hint: "Register an application on my.telegram.org, or set READER_BOT_TOKEN".into(),
        })
}

/// Log directory, read before the rest of the config so that config
/// errors are logged too.
pub fn log_dir_from_env() -> Option<PathBuf> {
    std::env::var("OFFER_RELAY_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Pick the LLM backend from whichever API key is present. OpenAI wins
/// when both are set.
fn llm_from_env() -> Option<LlmConfig> {
    let model_override = std::env::var("OFFER_RELAY_LLM_MODEL").ok();

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        return Some(LlmConfig {
            backend: LlmBackend::OpenAi,
            api_key: SecretString::from(key),
            model: model_override.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        });
    }

    std::env::var("ANTHROPIC_API_KEY").ok().map(|key| LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: SecretString::from(key),
        model: model_override.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
    })
}

fn required(key: &str, hint: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        }),
    }
}

fn parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
