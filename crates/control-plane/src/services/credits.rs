use common::api::{CreditAdjustmentResponse, CreditBalance, LedgerEntry};
use tracing::info;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    persistence::{LedgerReason, LedgerRecord, ledger, users},
};

const RECENT_ENTRIES: u32 = 20;

fn to_entry(record: LedgerRecord) -> LedgerEntry {
    LedgerEntry {
        id: record.id,
        amount: record.amount,
        reason: record.reason.as_str().to_string(),
        node_id: record.node_id,
        created_at: record.created_at,
    }
}

pub async fn balance(state: &AppState, user_id: i64) -> ApiResult<CreditBalance> {
    let user = users::get_user(&state.db, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;
    let transactions = ledger::list_entries_for_user(&state.db, user_id, RECENT_ENTRIES)
        .await?
        .into_iter()
        .map(to_entry)
        .collect();
    Ok(CreditBalance {
        user_id: user.id,
        credits: user.credits,
        transactions,
    })
}

/// Apply a signed manual adjustment with its ledger entry.
pub async fn adjust(state: &AppState, user_id: i64, adjustment: i64) -> ApiResult<CreditAdjustmentResponse> {
    if adjustment == 0 {
        return Err(AppError::bad_request("adjustment must be non-zero"));
    }
    let credits = ledger::apply_credit(&state.db, user_id, adjustment, LedgerReason::AdminAdjustment)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;
    info!(user_id, adjustment, credits, "credits adjusted");
    Ok(CreditAdjustmentResponse { user_id, credits })
}
