use axum::http::Request;
use metrics::counter;
use sqlx::Error as SqlxError;
use tower_http::request_id::RequestId;

pub(crate) fn request_id_from_request<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string)
}

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("fleet_hub_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::PoolTimedOut => "pool_timeout",
            SqlxError::Io(_) => "io",
            _ => "other",
        };
        counter!("fleet_hub_db_errors_total", "kind" => kind).increment(1);
    }
}
