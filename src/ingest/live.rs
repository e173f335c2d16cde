//! Live feed: runs every new post from a registered source through the
//! pipeline as it arrives.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::RelayContext;
use crate::extract::OfferExtractor;
use crate::ingest::TaskHandle;
use crate::pipeline::OfferPipeline;
use crate::pipeline::types::{CandidateMessage, ProcessOutcome};

/// Spawn the live feed.
///
/// Registered sources are joined first. Messages are then handled one at
/// a time in arrival order. The task ends
/// when the reader's stream ends, on subscribe failure, or when the
/// handle is stopped.
pub fn spawn_live_feed(
    ctx: RelayContext,
    pipeline: Arc<OfferPipeline>,
    extractor: Arc<dyn OfferExtractor>,
) -> TaskHandle {
    let (stop_tx, mut stop) = watch::channel(false);

    let join = tokio::spawn(async move {
        join_registered_sources(&ctx).await;

        let mut stream = match ctx.reader.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Live feed could not subscribe");
                return;
            }
        };

        info!(reader = ctx.reader.name(), extractor = extractor.name(), "Live feed started");

        loop {
            let message = tokio::select! {
                _ = stop.changed() => break,
                next = stream.next() => match next {
                    Some(message) => message,
                    None => {
                        warn!("Live stream ended");
                        break;
                    }
                },
            };

            handle_live_message(&ctx, &pipeline, extractor.as_ref(), message).await;
        }

        info!("Live feed stopped");
    });

    TaskHandle::new("live", stop_tx, join)
}

/// Ask the reader to join every registered source so its posts reach the
/// live stream. Failures are logged and skipped. Returns how many joined.
pub(crate) async fn join_registered_sources(ctx: &RelayContext) -> usize {
    let sources = match ctx.store.list_sources().await {
        Ok(sources) => sources,
        Err(e) => {
            warn!(error = %e, "Source registry unavailable; not joining sources");
            return 0;
        }
    };

    let mut joined = 0;
    for source in &sources {
        match ctx.reader.resolve_source(&source.identifier).await {
            Ok(_) => joined += 1,
            Err(e) => warn!(source = %source.identifier, error = %e, "Could not join source"),
        }
    }

    info!(joined, total = sources.len(), "Joined registered sources");
    joined
}

/// Process one live message if it comes from a registered source.
///
/// The registry is read fresh for every message, so additions and
/// removals apply to the next message. Returns `None` when the message
/// was discarded before reaching the pipeline.
pub(crate) async fn handle_live_message(
    ctx: &RelayContext,
    pipeline: &OfferPipeline,
    extractor: &dyn OfferExtractor,
    message: CandidateMessage,
) -> Option<ProcessOutcome> {
    let sources = match ctx.store.list_sources().await {
        Ok(sources) => sources,
        Err(e) => {
            warn!(
                source = %message.source,
                message_id = message.message_id,
                error = %e,
                "Source registry unavailable; skipping live message"
            );
            return None;
        }
    };

    let registered = sources.iter().find(|s| s.matches(&message.source))?;

    // Key dedup by the registered spelling so both feeds agree.
    let message = CandidateMessage {
        source: registered.identifier.clone(),
        ..message
    };

    match pipeline.process(&message, extractor).await {
        Ok(outcome) => {
            debug!(
                source = %message.source,
                message_id = message.message_id,
                outcome = outcome.label(),
                "Live message processed"
            );
            Some(outcome)
        }
        Err(e) => {
            warn!(
                source = %message.source,
                message_id = message.message_id,
                error = %e,
                "Skipping live message"
            );
            None
        }
    }
}
