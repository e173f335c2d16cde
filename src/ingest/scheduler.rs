//! Fixed-delay scheduler for the periodic backfill.
//!
//! The first run starts immediately. Each following run starts
//! `interval` (+ optional random jitter) after the previous run *ended*,
//! so runs never overlap and a slow run pushes the next one back.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ingest::TaskHandle;

/// Handle returned by [`PeriodicScheduler::spawn`].
pub type SchedulerHandle = TaskHandle;

#[derive(Debug, Clone, Copy)]
pub struct PeriodicScheduler {
    interval: Duration,
    jitter: Option<Duration>,
}

impl PeriodicScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jitter: None,
        }
    }

    /// Add up to `jitter` of random delay to every sleep.
    pub fn with_jitter(mut self, jitter: Option<Duration>) -> Self {
        self.jitter = jitter.filter(|j| !j.is_zero());
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay between the end of one run and the start of the next.
    fn next_delay(&self) -> Duration {
        match self.jitter {
            Some(jitter) => {
                let extra_ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
                self.interval + Duration::from_millis(extra_ms)
            }
            None => self.interval,
        }
    }

    /// Spawn `job` on the fixed-delay schedule.
    ///
    /// A stop signal interrupts both the sleep and an in-progress run.
    pub fn spawn<F, Fut>(self, name: &'static str, mut job: F) -> SchedulerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(
                task = name,
                interval_secs = self.interval.as_secs(),
                jitter_secs = self.jitter.map(|j| j.as_secs()),
                "Scheduler started"
            );

            let mut runs: u64 = 0;
            loop {
                if *stop.borrow() {
                    break;
                }

                tokio::select! {
                    _ = stop.changed() => break,
                    _ = job() => {}
                }
                runs += 1;

                let delay = self.next_delay();
                debug!(task = name, runs, delay_secs = delay.as_secs(), "Next run scheduled");

                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!(task = name, runs, "Scheduler stopped");
        });

        TaskHandle::new(name, stop_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnMut() -> futures::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test]
    async fn first_run_is_immediate() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicScheduler::new(Duration::from_secs(3600)).spawn("test", counting_job(&runs));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn repeats_after_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicScheduler::new(Duration::from_millis(20)).spawn("test", counting_job(&runs));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await;

        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn stop_is_deterministic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicScheduler::new(Duration::from_millis(10)).spawn("test", counting_job(&runs));

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn next_run_waits_for_previous_to_end() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let (a, o) = (Arc::clone(&active), Arc::clone(&overlaps));
        let handle = PeriodicScheduler::new(Duration::from_millis(1)).spawn("slow", move || {
            let (a, o) = (Arc::clone(&a), Arc::clone(&o));
            async move {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(15)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn jitter_bounds_delay() {
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10))
            .with_jitter(Some(Duration::from_secs(2)));
        for _ in 0..50 {
            let delay = scheduler.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(12));
        }

        let zero = PeriodicScheduler::new(Duration::from_secs(10)).with_jitter(Some(Duration::ZERO));
        assert_eq!(zero.next_delay(), Duration::from_secs(10));
    }
}
