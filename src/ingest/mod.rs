//! Ingestion coordinator: feeds candidate messages into the pipeline.
//!
//! Two long-lived tasks share one [`OfferPipeline`](crate::pipeline::OfferPipeline):
//! - the live feed ([`spawn_live_feed`]), semantic extraction
//! - the periodic backfill ([`Backfill`] under a [`PeriodicScheduler`]),
//!   pattern extraction

pub mod backfill;
pub mod live;
pub mod scheduler;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use backfill::{Backfill, CycleReport};
pub use live::spawn_live_feed;
pub use scheduler::{PeriodicScheduler, SchedulerHandle};

/// Handle to a spawned background task with a stop signal.
///
/// Dropping the handle also stops the task.
pub struct TaskHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(name: &'static str, stop: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            stop,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait until the task ends on its own. Returns immediately if it
    /// already ended.
    pub async fn finished(&mut self) {
        if let Some(join) = self.join.as_mut() {
            if let Err(e) = join.await {
                tracing::error!(task = self.name, error = %e, "Task panicked");
            }
            self.join = None;
        }
    }

    /// Signal the task to stop and wait for it.
    pub async fn stop(mut self) {
        self.stop.send_replace(true);
        self.finished().await;
    }
}
