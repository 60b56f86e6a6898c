use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    Result,
    app_state::AppState,
    config::AccrualConfig,
    persistence::{self as db, LedgerReason, checkpoints, ledger, nodes},
    registry::{ConnectionRegistry, OnlineNode},
};

/// Summary of one accrual cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccrualReport {
    pub online: usize,
    pub credited: usize,
    pub unbound: usize,
    /// Online nodes with no row in the store.
    pub skipped: usize,
    pub failed: usize,
    pub total_credited: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeAccrual {
    Credited(i64),
    Unbound,
    Missing,
}

/// Start the periodic worker. Returns `None` when accrual is disabled.
pub fn spawn_accrual_worker(state: AppState, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    if !state.accrual.enabled {
        info!("online accrual disabled");
        return None;
    }
    Some(tokio::spawn(accrual_loop(state, shutdown)))
}

pub async fn accrual_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(state.accrual.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing has accrued yet.
    interval.tick().await;
    info!(interval_secs = state.accrual.interval_secs, "online accrual worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = run_accrual_cycle(&state.db, &state.registry, &state.accrual, Utc::now()).await;
                if report.failed > 0 {
                    warn!(?report, "accrual cycle finished with failures");
                } else if report.total_credited > 0 {
                    info!(?report, "accrual cycle finished");
                } else {
                    debug!(?report, "accrual cycle finished");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("online accrual worker stopping");
                    break;
                }
            }
        }
    }
}

/// Credit owners for the online time of every node live at `now`.
///
/// Each node is settled in its own transaction, so one failure does not
/// hold back the rest of the fleet.
pub async fn run_accrual_cycle(
    db: &db::Db,
    registry: &ConnectionRegistry,
    cfg: &AccrualConfig,
    now: DateTime<Utc>,
) -> AccrualReport {
    let online = registry.online_snapshot().await;
    let mut report = AccrualReport {
        online: online.len(),
        ..AccrualReport::default()
    };

    for node in &online {
        match accrue_node(db, node, cfg, now).await {
            Ok(NodeAccrual::Credited(amount)) => {
                if amount > 0 {
                    report.credited += 1;
                    report.total_credited += amount;
                }
            }
            Ok(NodeAccrual::Unbound) => report.unbound += 1,
            Ok(NodeAccrual::Missing) => report.skipped += 1,
            Err(err) => {
                report.failed += 1;
                counter!("fleet_hub_accrual_failed_total").increment(1);
                warn!(node_id = %node.node_id, ?err, "accrual failed for node");
            }
        }
    }

    if report.total_credited > 0 {
        counter!("fleet_hub_accrual_credited_total").increment(report.total_credited as u64);
    }
    report
}

async fn accrue_node(
    db: &db::Db,
    node: &OnlineNode,
    cfg: &AccrualConfig,
    now: DateTime<Utc>,
) -> Result<NodeAccrual> {
    let mut tx = db.begin().await?;
    let Some(record) = nodes::get_node_tx(&mut tx, &node.node_id).await? else {
        return Ok(NodeAccrual::Missing);
    };
    let checkpoint = checkpoints::get_checkpoint_tx(&mut tx, &node.node_id).await?;

    // Time before the current link connected was never observed online.
    let since = checkpoint
        .as_ref()
        .map(|c| c.last_credited_at.max(node.connected_at))
        .unwrap_or(node.connected_at);
    let interval_ms = (cfg.interval_secs as i64).saturating_mul(1_000);
    let elapsed_ms = (now - since).num_milliseconds().clamp(0, interval_ms);

    let Some(owner) = record.owner() else {
        // No backlog is kept for a future owner.
        checkpoints::upsert_checkpoint_tx(&mut tx, &node.node_id, now, 0).await?;
        tx.commit().await?;
        return Ok(NodeAccrual::Unbound);
    };

    let carry_ms = checkpoint.as_ref().map(|c| c.carry_ms).unwrap_or(0);
    let (amount, carry_ms) = credit_for(carry_ms + elapsed_ms, cfg);
    checkpoints::upsert_checkpoint_tx(&mut tx, &node.node_id, now, carry_ms).await?;

    let mut credited = 0;
    if amount > 0 {
        match ledger::apply_credit_tx(
            &mut tx,
            owner,
            amount,
            LedgerReason::OnlineAccrual,
            Some(&node.node_id),
            now,
        )
        .await?
        {
            Some(_) => credited = amount,
            None => warn!(node_id = %node.node_id, user_id = owner, "owner missing; accrual dropped"),
        }
    }
    tx.commit().await?;
    Ok(NodeAccrual::Credited(credited))
}

/// Whole units in `total_ms` and the remainder carried to the next cycle.
fn credit_for(total_ms: i64, cfg: &AccrualConfig) -> (i64, i64) {
    let unit_ms = (cfg.unit_secs as i64).saturating_mul(1_000).max(1);
    let units = total_ms / unit_ms;
    (units.saturating_mul(cfg.credits_per_unit), total_ms % unit_ms)
}
