//! Offer pipeline: decides, for one candidate message, whether it is
//! relayed.
//!
//! Flow:
//! 1. No text → skipped
//! 2. Extraction (strategy chosen by the caller)
//! 3. Price gate: positive price at or below the ceiling
//! 4. Dedup: in-flight guard, then the persisted store
//! 5. Relay: send, then record

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{PipelineError, RelayError};
use crate::extract::OfferExtractor;
use crate::pipeline::relay::Relay;
use crate::pipeline::types::{CandidateMessage, ProcessOutcome};
use crate::store::Database;

type InFlightKey = (String, i64);

/// Shared by the live feed and the backfill.
pub struct OfferPipeline {
    store: Arc<dyn Database>,
    relay: Relay,
    price_ceiling: Decimal,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl OfferPipeline {
    pub fn new(store: Arc<dyn Database>, relay: Relay, price_ceiling: Decimal) -> Self {
        Self {
            store,
            relay,
            price_ceiling,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn price_ceiling(&self) -> Decimal {
        self.price_ceiling
    }

    /// Run one candidate message through the pipeline.
    ///
    /// Only a failed dedup lookup is an error; every other outcome,
    /// including a failed send, is reported as a [`ProcessOutcome`].
    pub async fn process(
        &self,
        message: &CandidateMessage,
        extractor: &dyn OfferExtractor,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(text) = message.text() else {
            return Ok(ProcessOutcome::SkippedNoText);
        };

        let offer = extractor.extract(text).await;
        let price = match offer.price {
            Some(price) if offer.is_qualifying && price > Decimal::ZERO => price,
            _ => {
                debug!(
                    source = %message.source,
                    message_id = message.message_id,
                    extractor = extractor.name(),
                    "Not a qualifying offer"
                );
                return Ok(ProcessOutcome::NotQualifying);
            }
        };

        if price > self.price_ceiling {
            debug!(
                source = %message.source,
                message_id = message.message_id,
                price = %price,
                "Offer over ceiling"
            );
            return Ok(ProcessOutcome::OverCeiling { price });
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, message) else {
            debug!(
                source = %message.source,
                message_id = message.message_id,
                "Offer already being relayed by the other feed"
            );
            return Ok(ProcessOutcome::AlreadyRelayed);
        };

        if self
            .store
            .is_relayed(&message.source, message.message_id)
            .await
            .map_err(PipelineError::DedupLookup)?
        {
            return Ok(ProcessOutcome::AlreadyRelayed);
        }

        match self.relay.relay(message, &offer, price).await {
            Ok(_) => Ok(ProcessOutcome::Relayed { price }),
            // Delivered; only the record is missing.
            Err(RelayError::Record(_)) => Ok(ProcessOutcome::Relayed { price }),
            Err(RelayError::Send(e)) => {
                warn!(
                    source = %message.source,
                    message_id = message.message_id,
                    error = %e,
                    "Relay send failed; message stays eligible"
                );
                Ok(ProcessOutcome::SendFailed)
            }
        }
    }
}

/// Holds a (source, message id) slot while a relay is in progress.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<InFlightKey>>>, message: &CandidateMessage) -> Option<Self> {
        let key = (message.source.to_ascii_lowercase(), message.message_id);
        let mut held = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}
