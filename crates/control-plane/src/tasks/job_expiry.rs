use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    Result,
    config::CallsConfig,
    persistence::{self as db, tasks as task_store},
};

pub const JOB_EXPIRED_ERROR: &str = "job expired without completion";

/// Start the sweep that fails abandoned jobs. Returns `None` when job expiry
/// is disabled.
pub fn spawn_job_expiry_worker(
    db: db::Db,
    calls: CallsConfig,
    shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if calls.job_ttl_secs == 0 {
        info!("job expiry disabled");
        return None;
    }
    Some(tokio::spawn(job_expiry_loop(db, calls, shutdown)))
}

pub async fn job_expiry_loop(db: db::Db, calls: CallsConfig, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(calls.job_sweep_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        ttl_secs = calls.job_ttl_secs,
        interval_secs = calls.job_sweep_interval_secs,
        "job expiry worker started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_job_expiry_sweep(&db, &calls, Utc::now()).await {
                    Ok(0) => {}
                    Ok(expired) => {
                        counter!("fleet_hub_jobs_expired_total").increment(expired);
                        info!(expired, "job expiry sweep failed stale jobs");
                    }
                    Err(err) => warn!(?err, "job expiry sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("job expiry worker stopping");
                    break;
                }
            }
        }
    }
}

/// Fail every accepted job that has been `running` longer than the TTL.
pub async fn run_job_expiry_sweep(db: &db::Db, calls: &CallsConfig, now: DateTime<Utc>) -> Result<u64> {
    if calls.job_ttl_secs == 0 {
        return Ok(0);
    }

    let cutoff = now - ChronoDuration::seconds(calls.job_ttl_secs.min(i64::MAX as u64) as i64);
    task_store::fail_stale_jobs(db, cutoff, JOB_EXPIRED_ERROR, now).await
}
