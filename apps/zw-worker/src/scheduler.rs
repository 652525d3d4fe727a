use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use zw_kernel::Kernel;

use crate::config::WorkerConfig;
use crate::coordinator::{run_alert_job, run_occupancy_job};
use crate::singleflight::RunGuard;

/// Periodic driver for the occupancy and alert jobs.
///
/// Each job runs on its own fixed cadence behind a single-flight
/// guard; an overlapping tick is skipped, never queued. A finished
/// occupancy run that processed anything also kicks the alert loop
/// over a notify channel so new occupancy alerts go out without
/// waiting for the next alert tick. The kick only wakes an alert loop
/// that is already idle at the channel; one arriving while an alert
/// run is in flight is dropped, never queued behind it.
pub struct Scheduler {
    kernel: Kernel,
    cfg: WorkerConfig,
    occupancy_guard: RunGuard,
    alert_guard: RunGuard,
    alert_kick: Arc<Notify>,
}

impl Scheduler {
    pub fn new(kernel: Kernel, cfg: WorkerConfig) -> Self {
        Self {
            kernel,
            cfg,
            occupancy_guard: RunGuard::new(),
            alert_guard: RunGuard::new(),
            alert_kick: Arc::new(Notify::new()),
        }
    }

    /// Spawn both loops. The handles run until aborted.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_occupancy_loop(), self.spawn_alert_loop()]
    }

    fn spawn_occupancy_loop(&self) -> JoinHandle<()> {
        let kernel = self.kernel.clone();
        let cfg = self.cfg.clone();
        let guard = self.occupancy_guard.clone();
        let kick = self.alert_kick.clone();
        tokio::spawn(async move {
            let mut tick = interval(cfg.occupancy_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(_token) = guard.try_begin() else {
                    debug!("occupancy run still in flight, skipping tick");
                    continue;
                };
                match run_occupancy_job(&kernel, &cfg).await {
                    // notify_waiters stores no permit, so a busy alert
                    // loop never replays this kick after it finishes.
                    Ok(report) if report.logs_processed > 0 => kick.notify_waiters(),
                    Ok(_) => {}
                    Err(err) => {
                        // Already logged with state detail; the next
                        // tick retries from a clean slate.
                        warn!(error = %format!("{err:#}"), "occupancy run failed");
                    }
                }
            }
        })
    }

    fn spawn_alert_loop(&self) -> JoinHandle<()> {
        let kernel = self.kernel.clone();
        let cfg = self.cfg.clone();
        let guard = self.alert_guard.clone();
        let kick = self.alert_kick.clone();
        tokio::spawn(async move {
            let mut tick = interval(cfg.alert_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = kick.notified() => {
                        debug!("alert run kicked by occupancy finish");
                    }
                }
                let Some(_token) = guard.try_begin() else {
                    debug!("alert run still in flight, skipping trigger");
                    continue;
                };
                if let Err(err) = run_alert_job(&kernel, &cfg).await {
                    warn!(error = %format!("{err:#}"), "alert run failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use zw_engine::alerts::BackoffConfig;

    fn scheduler(dir: &TempDir) -> Scheduler {
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        let cfg = WorkerConfig {
            worker_id: "worker-sched".to_string(),
            state_dir: PathBuf::from(dir.path()),
            chunk_size: 100,
            occupancy_interval: Duration::from_secs(3600),
            alert_interval: Duration::from_secs(3600),
            backoff: BackoffConfig::default(),
            alert_freshness: chrono::Duration::days(1),
        };
        Scheduler::new(kernel, cfg)
    }

    #[tokio::test]
    async fn kick_during_in_flight_alert_run_is_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let sched = scheduler(&dir);

        // An in-flight alert run holds the guard and is not waiting at
        // the channel; a kick arriving now must leave nothing behind.
        let token = sched.alert_guard.try_begin().expect("begin");
        sched.alert_kick.notify_waiters();
        drop(token);

        let woke = tokio::time::timeout(
            Duration::from_millis(50),
            sched.alert_kick.notified(),
        )
        .await;
        assert!(woke.is_err(), "a dropped kick must not wake a later wait");
    }

    #[tokio::test]
    async fn kick_wakes_an_idle_alert_loop() {
        let dir = TempDir::new().expect("tempdir");
        let sched = scheduler(&dir);

        let kick = sched.alert_kick.clone();
        let waiter = tokio::spawn(async move { kick.notified().await });
        // Current-thread runtime: the yield parks the waiter at the
        // channel before the kick fires.
        tokio::task::yield_now().await;
        sched.alert_kick.notify_waiters();
        waiter.await.expect("waiter woken");
    }
}
