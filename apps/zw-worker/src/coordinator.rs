use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info};

use zw_engine::alerts::AlertCounts;
use zw_engine::builder::build_intervals;
use zw_kernel::Kernel;

use crate::config::WorkerConfig;

/// Phases of an occupancy run as reported in structured logs. Alert
/// derivation and the ledger flip sit inside the reconciliation
/// transaction and log from there. A failure after the claim committed
/// moves through `Compensating`, which deletes the claim so the batch
/// is picked up again on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    ClaimingBatch,
    Reconciling,
    Compensating,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunReport {
    pub logs_processed: usize,
    pub people_processed: usize,
    pub alerts: AlertCounts,
    pub elapsed_secs: f64,
}

/// One full occupancy reconciliation run.
///
/// Phase one claims a batch in its own transaction. Phase two
/// (reconcile, alert, mark done) is a second transaction; when it
/// fails the committed claim is rolled back by deletion. A failure of
/// that compensation leaves the batch stuck Processing and needs an
/// operator, so both errors are surfaced together.
pub async fn run_occupancy_job(kernel: &Kernel, cfg: &WorkerConfig) -> Result<RunReport> {
    let started = Instant::now();

    debug!(state = ?RunState::ClaimingBatch, "starting occupancy run");
    let events = kernel
        .claim_batch_async(&cfg.worker_id, cfg.chunk_size)
        .await
        .context("claim batch")?;
    if events.is_empty() {
        info!("no detections to process");
        return Ok(RunReport::default());
    }

    let event_ids: Vec<i64> = events.iter().map(|e| e.id).collect();
    let candidates = build_intervals(&events);
    debug!(
        state = ?RunState::Reconciling,
        logs = events.len(),
        people = candidates.len(),
        "claimed batch"
    );

    match kernel
        .finish_batch_async(
            &cfg.worker_id,
            candidates,
            event_ids.clone(),
            Utc::now(),
            cfg.backoff,
        )
        .await
    {
        Ok(summary) => {
            let report = RunReport {
                logs_processed: events.len(),
                people_processed: summary.people,
                alerts: summary.alerts,
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                logs = report.logs_processed,
                people = report.people_processed,
                closed = summary.closed,
                inserted = summary.inserted,
                alerts = report.alerts.total(),
                elapsed_secs = report.elapsed_secs,
                "occupancy run finished"
            );
            Ok(report)
        }
        Err(err) => {
            debug!(state = ?RunState::Compensating, "rolling back batch claim");
            match kernel.compensate_claim_async(event_ids).await {
                Ok(_) => {
                    error!(state = ?RunState::Failed, error = %format!("{err:#}"),
                           "occupancy run failed, claim rolled back");
                    Err(err.context("occupancy run failed (claim rolled back)"))
                }
                Err(comp_err) => {
                    error!(state = ?RunState::Failed, error = %format!("{err:#}"),
                           compensation_error = %format!("{comp_err:#}"),
                           "compensation failed, batch stuck Processing, operator attention required");
                    Err(err.context(format!(
                        "compensation of the batch claim also failed: {comp_err:#}"
                    )))
                }
            }
        }
    }
}

/// One alert derivation run over the worker's current open occupancy.
pub async fn run_alert_job(kernel: &Kernel, cfg: &WorkerConfig) -> Result<AlertCounts> {
    let started = Instant::now();
    let counts = kernel
        .alert_pass_async(&cfg.worker_id, Utc::now(), cfg.backoff, cfg.alert_freshness)
        .await
        .context("alert pass")?;
    if counts.total() == 0 {
        debug!("no alerts generated");
    } else {
        info!(
            unknown = counts.unknown,
            unauthorized = counts.unauthorized,
            overstay = counts.overstay,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "alerts generated"
        );
    }
    Ok(counts)
}
