//! Channel abstraction for reading source posts and sending relays.

pub mod channel;
pub mod preview;
pub mod session;
pub mod telegram;

pub use channel::*;
pub use session::SessionReader;
pub use telegram::{TelegramReader, TelegramSender};
