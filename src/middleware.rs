use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use tracing::{debug, warn};

use crate::app::auth::AuthValidator;
use crate::handler::ConnectionHandler;
use crate::http_handler::AppError;

/// Split a raw query string into a multimap without percent-decoding.
/// The REST signature is computed over the values exactly as they appear
/// on the wire, so decoding here would break compatibility with
/// reference signers.
pub fn query_multimap(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    params
}

/// Authentication middleware for the `/apps/{app_id}/...` REST surface.
///
/// Resolves the app from the path, buffers the body (needed both for
/// `body_md5` and so the downstream handler can still read it), validates
/// the request signature and either forwards or rejects.
pub async fn api_auth_middleware(
    State(handler): State<Arc<ConnectionHandler>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let uri = request.uri().clone();
    let method = request.method().clone();
    let path = uri.path().to_string();

    let app_id = path
        .trim_start_matches('/')
        .split('/')
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let app = handler
        .app_manager
        .find_by_id(&app_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("application {app_id} not found")))?;

    let params = query_multimap(uri.query());

    let (parts, body) = request.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| AppError::Internal(format!("failed to read request body: {e}")))?
        .to_bytes();

    if let Err(e) =
        AuthValidator::validate_api_request(&app, method.as_str(), &path, &params, &body_bytes)
    {
        warn!(%app_id, %path, "REST request rejected: {e}");
        handler
            .metrics
            .message_errors
            .with_label_values(&[&app.key, "api_auth"])
            .inc();
        return Err(AppError::AuthFailed(e.to_string()));
    }
    debug!(%app_id, %path, "REST request authenticated");

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}

/// Records `http_requests_total` and `http_request_duration_seconds` for
/// every route, labeled by matched path template rather than raw path.
pub async fn http_metrics_middleware(
    State(handler): State<Arc<ConnectionHandler>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    handler
        .metrics
        .http_requests_total
        .with_label_values(&[&endpoint, &method, response.status().as_str()])
        .inc();
    handler
        .metrics
        .http_request_duration
        .with_label_values(&[&endpoint, &method])
        .observe(start.elapsed().as_secs_f64());

    response
}
