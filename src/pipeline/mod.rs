//! Offer pipeline.
//!
//! Every candidate message, live or historical, flows through:
//! 1. Extraction: `OfferExtractor` chosen by the feed
//! 2. Price gate: positive and at or below the ceiling
//! 3. Dedup: in-flight guard, then the persisted store
//! 4. Relay: send to the destination, then record
//!
//! **A record is only written after a successful send.**

pub mod processor;
pub mod relay;
pub mod types;

pub use processor::OfferPipeline;
pub use relay::{Relay, RelayOutcome, format_offer_message, permalink};
pub use types::{CandidateMessage, ProcessOutcome};
