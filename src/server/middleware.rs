//! HTTP middleware: request ids, request logging and per-client rate limiting

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{info_span, Level};

use crate::core::errors::GatewayError;
use crate::core::rate_limiter::KeyedRateLimiter;
use crate::server::api::{ApiError, USER_ID_HEADER};

/// Header carrying the request id, generated when the client sends none
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Default, Deserialize)]
struct ClientQuery {
    user_id: Option<String>,
}

/// Rate limit key: user id when known, client IP otherwise
pub fn client_key(request: &Request) -> String {
    let header_user = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let query_user = || {
        Query::<ClientQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.user_id)
            .filter(|v| !v.is_empty())
    };

    if let Some(user) = header_user.or_else(query_user) {
        return format!("user:{}", user);
    }
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "anonymous".to_string(),
    }
}

/// Reject clients that exceed their request rate with 429
pub async fn limit_clients(
    State(limiter): State<Arc<KeyedRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    if !limiter.allow(&key) {
        return ApiError(GatewayError::RateLimitExceeded { key }).into_response();
    }
    next.run(request).await
}

/// Apply the per-client limiter to every route of `router`
pub fn rate_limited<S>(router: Router<S>, limiter: Arc<KeyedRateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(limiter, limit_clients))
}

/// Wrap `router` with request ids and request logging
pub fn with_request_tracing(router: Router) -> Router {
    let trace = TraceLayer::new_for_http()
        .make_span_with(|request: &Request| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
