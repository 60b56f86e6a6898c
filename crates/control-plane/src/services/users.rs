use common::api::{CreateUserRequest, SystemStats, UserPage, UserSummary};
use tracing::info;

use crate::{
    app_state::AppState,
    auth::Caller,
    error::{ApiResult, AppError, is_unique_violation},
    persistence::{UserRecord, UserRole, stats, users},
};

fn to_summary(record: UserRecord) -> UserSummary {
    UserSummary {
        id: record.id,
        email: record.email,
        role: record.role.into(),
        credits: record.credits,
        created_at: record.created_at,
    }
}

pub(crate) fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_ascii_lowercase();
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(AppError::bad_request("invalid email"));
    }
    Ok(email)
}

pub async fn list_users(state: &AppState, limit: u32, offset: u32) -> ApiResult<UserPage> {
    let total = users::count_users(&state.db).await?;
    let items = users::list_users(&state.db, limit, offset)
        .await?
        .into_iter()
        .map(to_summary)
        .collect();
    Ok(UserPage {
        limit,
        offset,
        total,
        items,
    })
}

pub async fn create_user(state: &AppState, req: CreateUserRequest) -> ApiResult<UserSummary> {
    let email = normalize_email(&req.email)?;
    let role = req.role.map(UserRole::from).unwrap_or(UserRole::User);
    match users::create_user(&state.db, &email, role).await {
        Ok(user) => {
            info!(user_id = user.id, role = ?user.role, "user created");
            Ok(to_summary(user))
        }
        Err(err) if is_unique_violation(&err) => {
            Err(AppError::conflict("user_exists", "user with this email already exists"))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn update_role(state: &AppState, user_id: i64, role: UserRole) -> ApiResult<UserSummary> {
    if users::update_role(&state.db, user_id, role).await? == 0 {
        return Err(AppError::not_found("user not found"));
    }
    let user = users::get_user(&state.db, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;
    info!(user_id, ?role, "user role updated");
    Ok(to_summary(user))
}

/// Delete a user with their tasks, ledger and bind tokens. Their nodes are
/// released, not deleted.
pub async fn delete_user(state: &AppState, caller: &Caller, user_id: i64) -> ApiResult<()> {
    if caller.user_id == user_id {
        return Err(AppError::bad_request("cannot delete the calling user"));
    }
    if users::delete_user(&state.db, user_id).await? == 0 {
        return Err(AppError::not_found("user not found"));
    }
    info!(user_id, "user deleted");
    Ok(())
}

pub async fn system_stats(state: &AppState) -> ApiResult<SystemStats> {
    let counts = stats::system_counts(&state.db).await?;
    Ok(SystemStats {
        users: counts.users,
        nodes: counts.nodes,
        bound_nodes: counts.bound_nodes,
        online_nodes: state.registry.len().await,
        tasks: counts.tasks,
        transactions: counts.transactions,
        total_credits: counts.total_credits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::setup_state;
    use axum::http::StatusCode;

    fn request(email: &str) -> CreateUserRequest {
        CreateUserRequest {
            email: email.into(),
            role: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let state = setup_state().await;
        let user = create_user(&state, request(" Ann@Example.com ")).await.expect("create");
        assert_eq!(user.email, "ann@example.com");
        assert_eq!(user.role, common::api::UserRole::User);

        let err = create_user(&state, request("ann@example.com"))
            .await
            .expect_err("duplicate");
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "user_exists");

        let err = create_user(&state, request("not-an-email"))
            .await
            .expect_err("invalid");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn role_change_and_self_delete_guard() {
        let state = setup_state().await;
        let admin = create_user(&state, request("root@example.com")).await.expect("admin");
        let admin = update_role(&state, admin.id, UserRole::Admin).await.expect("promote");
        assert_eq!(admin.role, common::api::UserRole::Admin);

        let caller = Caller {
            user_id: admin.id,
            role: UserRole::Admin,
        };
        assert_eq!(
            delete_user(&state, &caller, admin.id).await.expect_err("self").status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            delete_user(&state, &caller, 999).await.expect_err("missing").status,
            StatusCode::NOT_FOUND
        );

        let stats = system_stats(&state).await.expect("stats");
        assert_eq!(stats.users, 1);
        assert_eq!(stats.online_nodes, 0);
    }
}
