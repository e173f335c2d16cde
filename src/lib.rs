//! Offer Relay: watches public channels and relays affordable sale offers.

pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod store;
