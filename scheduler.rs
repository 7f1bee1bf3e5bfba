//! Named recurring jobs: keep-alive ticks, discovery refresh, bucket
//! maintenance, reputation decay/checkpointing, channel maintenance.
//! Each job runs on its own tokio task and stops cooperatively when the
//! scheduler's shutdown flag is observed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Spawns `job` to run every `period`, polling the shutdown flag once
    /// per tick rather than mid-job so in-flight work always completes.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!(job = name, "scheduler job stopping");
                    break;
                }
                job().await;
            }
        });
        self.handles.push(handle);
    }

    /// Signals every spawned job to stop at its next tick boundary and waits
    /// for them to drain.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn periodic_job_runs_multiple_times() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let counter_clone = counter.clone();
        scheduler.spawn_periodic("test-tick", Duration::from_millis(10), move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        tokio::time::sleep(Duration::from_millis(45)).await;
        scheduler.shutdown().await;
        assert!(counter.load(Ordering::Relaxed) >= 2);
    }
}
