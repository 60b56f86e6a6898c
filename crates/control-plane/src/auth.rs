use axum::{
    extract::{FromRequestParts, State},
    http::{HeaderMap, Request, header::AUTHORIZATION, request::Parts},
    middleware::Next,
};
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    persistence::{UserRole, users},
    telemetry,
    tokens::secrets_match,
};

/// Authenticated user resolved from the gateway headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub role: UserRole,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// User filter for scoped reads; admins are unscoped.
    pub fn scope(&self) -> Option<i64> {
        if self.is_admin() {
            None
        } else {
            Some(self.user_id)
        }
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .copied()
            .ok_or_else(|| AppError::unauthorized("missing caller identity"))
    }
}

/// Accept requests forwarded by the auth gateway: a shared bearer token plus
/// the id of a user known to the hub.
pub async fn require_gateway_auth(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = telemetry::request_id_from_request(&req);
    let token = match extract_bearer(req.headers()) {
        Ok(token) => token,
        Err(err) => {
            warn!(request_id = request_id.as_deref(), reason = %err.message, "gateway auth rejected");
            return Err(err);
        }
    };
    if !state
        .gateway
        .tokens
        .iter()
        .any(|expected| secrets_match(expected, &token))
    {
        warn!(request_id = request_id.as_deref(), "invalid gateway token");
        return Err(AppError::unauthorized("invalid gateway token"));
    }

    let user_id = req
        .headers()
        .get(state.gateway.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| AppError::unauthorized("missing or invalid user id header"))?;

    let Some(user) = users::get_user(&state.db, user_id)
        .await
        .map_err(AppError::from)?
    else {
        warn!(request_id = request_id.as_deref(), user_id, "unknown user");
        return Err(AppError::unauthorized("unknown user"));
    };

    req.extensions_mut().insert(Caller {
        user_id: user.id,
        role: user.role,
    });
    Ok(next.run(req).await)
}

/// Route layer placed after `require_gateway_auth` on admin routes.
pub async fn require_admin(
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    match req.extensions().get::<Caller>() {
        Some(caller) if caller.is_admin() => Ok(next.run(req).await),
        Some(_) => Err(AppError::forbidden("admin role required")),
        None => Err(AppError::unauthorized("missing caller identity")),
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("invalid authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::unauthorized("invalid authorization header scheme"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_bearer_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(
            extract_bearer(&headers).expect_err("scheme").message,
            "invalid authorization header scheme"
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(extract_bearer(&headers).expect("token"), "tok-1");
    }

    #[test]
    fn admin_callers_are_unscoped() {
        let admin = Caller {
            user_id: 1,
            role: UserRole::Admin,
        };
        let user = Caller {
            user_id: 2,
            role: UserRole::User,
        };
        assert_eq!(admin.scope(), None);
        assert_eq!(user.scope(), Some(2));
    }
}
