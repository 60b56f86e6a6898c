use chrono::{Duration as ChronoDuration, Utc};
use common::api::{BindTokenResponse, NodePage, NodeSummary, SessionsResponse};
use common::protocol::is_valid_node_id;
use tracing::info;

use crate::{
    app_state::AppState,
    auth::Caller,
    error::{ApiResult, AppError},
    persistence::{NodeRecord, NodeStatus, bind_tokens, nodes},
    tokens::{generate_bind_token, hash_bind_token},
};

fn to_summary(record: NodeRecord, online: bool) -> NodeSummary {
    NodeSummary {
        node_id: record.id,
        user_id: record.user_id,
        bound: record.bound,
        hostname: record.hostname,
        agent_version: record.agent_version,
        status: match record.status {
            NodeStatus::Online => common::api::NodeStatus::Online,
            NodeStatus::Offline => common::api::NodeStatus::Offline,
        },
        online,
        last_seen: record.last_seen,
        created_at: record.created_at,
    }
}

fn check_node_id(node_id: &str) -> ApiResult<()> {
    if !is_valid_node_id(node_id) {
        return Err(AppError::bad_request("invalid node_id"));
    }
    Ok(())
}

/// Nodes bound to the caller with their live status.
pub async fn list_my_nodes(state: &AppState, caller: &Caller) -> ApiResult<Vec<NodeSummary>> {
    let online = state.registry.list_online().await;
    let records = nodes::list_nodes_for_user(&state.db, caller.user_id).await?;
    Ok(records
        .into_iter()
        .map(|record| {
            let is_online = online.contains(&record.id);
            to_summary(record, is_online)
        })
        .collect())
}

pub async fn list_all_nodes(state: &AppState, limit: u32, offset: u32) -> ApiResult<NodePage> {
    let online = state.registry.list_online().await;
    let total = nodes::count_nodes(&state.db).await?;
    let items = nodes::list_nodes(&state.db, limit, offset)
        .await?
        .into_iter()
        .map(|record| {
            let is_online = online.contains(&record.id);
            to_summary(record, is_online)
        })
        .collect();
    Ok(NodePage {
        limit,
        offset,
        total,
        items,
    })
}

pub async fn sessions(state: &AppState) -> SessionsResponse {
    let sessions = state.registry.status_snapshot().await;
    SessionsResponse {
        online: state.registry.len().await,
        sessions,
    }
}

/// Issue a one-time token the caller hands to a node to claim it.
pub async fn create_bind_token(state: &AppState, caller: &Caller) -> ApiResult<BindTokenResponse> {
    let token = generate_bind_token();
    let expires_at = Utc::now() + ChronoDuration::seconds(state.bind.token_ttl_secs as i64);
    bind_tokens::create_bind_token(&state.db, &hash_bind_token(&token), caller.user_id, expires_at)
        .await?;
    info!(user_id = caller.user_id, %expires_at, "bind token issued");
    Ok(BindTokenResponse { token, expires_at })
}

/// Release a node. `owner` restricts the change to a node bound to that
/// user; admins pass `None`.
pub async fn unbind_node(state: &AppState, node_id: &str, owner: Option<i64>) -> ApiResult<()> {
    check_node_id(node_id)?;
    let updated = nodes::unbind_node(&state.db, node_id, owner, Utc::now()).await?;
    if updated == 0 {
        return Err(AppError::not_found("node not found"));
    }
    info!(node_id, ?owner, "node unbound");
    Ok(())
}

/// Forget a node. A live link is closed so it cannot outlive its row.
pub async fn delete_node(state: &AppState, node_id: &str) -> ApiResult<()> {
    check_node_id(node_id)?;
    let deleted = nodes::delete_node(&state.db, node_id).await?;
    if deleted == 0 {
        return Err(AppError::not_found("node not found"));
    }
    if let Some(link) = state.registry.lookup(node_id).await {
        state.registry.unregister(&link, "deleted").await;
        link.close("deleted");
    }
    info!(node_id, "node deleted");
    Ok(())
}

/// Outcome of a `bind` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound { user_id: i64 },
    Rejected(&'static str),
}

/// Bind `node_id` to the user that issued `token`. The token is consumed
/// only if the bind lands.
pub async fn bind_from_link(state: &AppState, node_id: &str, token: &str) -> crate::Result<BindOutcome> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let Some(user_id) =
        bind_tokens::consume_bind_token_tx(&mut tx, &hash_bind_token(token), node_id, now).await?
    else {
        return Ok(BindOutcome::Rejected("invalid or expired bind token"));
    };
    if nodes::bind_node_tx(&mut tx, node_id, user_id, now).await? == 0 {
        return Ok(BindOutcome::Rejected("unknown node"));
    }
    tx.commit().await?;
    info!(node_id, user_id, "node bound");
    Ok(BindOutcome::Bound { user_id })
}
