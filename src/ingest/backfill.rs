//! Historical backfill: walks each source's recent history through the
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::CATCH_UP_WINDOW_HOURS;
use crate::context::RelayContext;
use crate::error::PipelineError;
use crate::extract::OfferExtractor;
use crate::ingest::scheduler::{PeriodicScheduler, SchedulerHandle};
use crate::pipeline::OfferPipeline;
use crate::pipeline::types::ProcessOutcome;

/// Counters for one backfill cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sources: usize,
    pub messages: usize,
    pub relayed: usize,
    /// History fetches, dedup lookups or sends that failed.
    pub failures: usize,
}

/// Serial backfill over all registered sources.
pub struct Backfill {
    ctx: RelayContext,
    pipeline: Arc<OfferPipeline>,
    extractor: Arc<dyn OfferExtractor>,
    relay_pause: Duration,
}

impl Backfill {
    pub fn new(
        ctx: RelayContext,
        pipeline: Arc<OfferPipeline>,
        extractor: Arc<dyn OfferExtractor>,
        relay_pause: Duration,
    ) -> Self {
        Self {
            ctx,
            pipeline,
            extractor,
            relay_pause,
        }
    }

    /// Process every message posted in the trailing `window`, source by
    /// source, oldest first.
    ///
    /// Fails only when the registry cannot be read; per-source and
    /// per-message failures are counted and logged.
    pub async fn run_cycle(&self, window: chrono::Duration) -> Result<CycleReport, PipelineError> {
        let sources = self
            .ctx
            .store
            .list_sources()
            .await
            .map_err(PipelineError::Registry)?;

        let since = Utc::now() - window;
        let mut report = CycleReport {
            sources: sources.len(),
            ..CycleReport::default()
        };

        info!(
            sources = sources.len(),
            window_hours = window.num_hours(),
            extractor = self.extractor.name(),
            "Backfill cycle started"
        );

        for source in &sources {
            let history = match self.ctx.reader.history(&source.identifier, since).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(source = %source.identifier, error = %e, "History fetch failed; skipping source");
                    report.failures += 1;
                    continue;
                }
            };

            for message in &history {
                report.messages += 1;

                match self.pipeline.process(message, self.extractor.as_ref()).await {
                    Ok(ProcessOutcome::Relayed { .. }) => {
                        report.relayed += 1;
                        tokio::time::sleep(self.relay_pause).await;
                    }
                    Ok(ProcessOutcome::SendFailed) => report.failures += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            source = %source.identifier,
                            message_id = message.message_id,
                            error = %e,
                            "Skipping message"
                        );
                        report.failures += 1;
                    }
                }
            }
        }

        info!(
            sources = report.sources,
            messages = report.messages,
            relayed = report.relayed,
            failures = report.failures,
            "Backfill cycle complete"
        );
        Ok(report)
    }

    /// One-off cycle over the 72-hour catch-up window.
    pub async fn catch_up(&self) -> Result<CycleReport, PipelineError> {
        self.run_cycle(chrono::Duration::hours(CATCH_UP_WINDOW_HOURS))
            .await
    }

    /// Run [`Backfill::run_cycle`] forever on `scheduler`.
    ///
    /// A cycle whose registry read fails is logged and skipped.
    pub fn spawn(self: Arc<Self>, scheduler: PeriodicScheduler, window: chrono::Duration) -> SchedulerHandle {
        scheduler.spawn("backfill", move || {
            let backfill = Arc::clone(&self);
            async move {
                if let Err(e) = backfill.run_cycle(window).await {
                    error!(error = %e, "Backfill cycle skipped");
                }
            }
        })
    }
}
