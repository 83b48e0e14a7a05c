//! HTTP API server implementation

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::errors::GatewayError;
use crate::core::models::{GenerationRequest, GenerationResponse, Model, QuotaStatus};
use crate::core::rate_limiter::KeyedRateLimiter;
use crate::fanout::{project_channel, user_channel};
use crate::gateway::Gateway;
use crate::generation::Orchestrator;
use crate::server::{middleware, sse};

/// Header carrying the caller identity set by the auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// Buffer between a streaming generation and its HTTP response
const EVENT_BUFFER: usize = 32;

/// Application state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    health_timeout: Duration,
    client_limiter: Arc<KeyedRateLimiter>,
}

impl AppState {
    pub fn new(
        orchestrator: Orchestrator,
        health_timeout: Duration,
        client_limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        Self {
            orchestrator,
            health_timeout,
            client_limiter,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Gateway error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::RateLimitExceeded { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Upstream { .. } | GatewayError::Decode { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamUnavailable { .. } | GatewayError::Http(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_admission_failure() {
            debug!(error = %self.0, "Request rejected");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Caller identity from the `x-user-id` header, if any
#[derive(Debug, Clone, Default)]
pub struct AuthenticatedUser(pub Option<String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Ok(AuthenticatedUser(user))
    }
}

impl AuthenticatedUser {
    fn require(self) -> Result<String, ApiError> {
        self.0
            .ok_or_else(|| GatewayError::validation("missing x-user-id header").into())
    }
}

/// Parse the body and attach the caller identity; the header wins over the body
fn generation_request(
    user: AuthenticatedUser,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<GenerationRequest, ApiError> {
    let Json(mut request) =
        payload.map_err(|e| ApiError(GatewayError::validation(e.body_text())))?;
    if let Some(user_id) = user.0 {
        request.user_id = user_id;
    }
    Ok(request)
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    fn from_check(kind: &str, check: Result<(), String>) -> Self {
        match check {
            Ok(()) => Self {
                status: "healthy".to_string(),
                kind: kind.to_string(),
                error: None,
            },
            Err(error) => Self {
                status: "unhealthy".to_string(),
                kind: kind.to_string(),
                error: Some(error),
            },
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Services {
    pub llm: ServiceHealth,
    pub redis: ServiceHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: Services,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    project_id: Option<String>,
}

/// Non-streaming generation handler
async fn generate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let request = generation_request(user, payload)?;
    let response = state
        .orchestrator
        .generate(request, &CancellationToken::new())
        .await?;
    Ok(Json(response))
}

/// Streaming generation handler
///
/// Admission runs before the response starts, so rejected requests get a
/// JSON error and a proper status instead of an event stream.
async fn generate_stream(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = generation_request(user, payload)?;
    let admission = state.orchestrator.admit(request).await?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let orchestrator = state.orchestrator.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let generation_id = admission.generation_id.clone();
        match orchestrator.stream(admission, tx, task_cancel).await {
            Ok(outcome) => debug!(
                generation_id = %generation_id,
                tokens = outcome.total_tokens,
                "Stream delivered"
            ),
            Err(GatewayError::ClientDisconnect) => {
                debug!(generation_id = %generation_id, "Stream abandoned by client")
            }
            Err(e) => warn!(generation_id = %generation_id, error = %e, "Stream failed"),
        }
    });

    Ok(sse::stream_response(rx, cancel.drop_guard()))
}

/// Get models handler
async fn get_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.orchestrator.models().await,
    })
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let backend = state.orchestrator.backend();
    let llm_check = match tokio::time::timeout(state.health_timeout, backend.health()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!(
            "health check timed out after {}ms",
            state.health_timeout.as_millis()
        )),
    };
    let llm = ServiceHealth::from_check(backend.kind(), llm_check);

    let bus = state.orchestrator.fanout().bus();
    let redis = ServiceHealth::from_check(bus.kind(), bus.ping().await.map_err(|e| e.to_string()));

    let healthy = llm.is_healthy() && redis.is_healthy();
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            services: Services { llm, redis },
        }),
    )
}

/// Subscribe to the caller's generation events
async fn events(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let user_id = user.require()?;
    let mut channels = vec![user_channel(&user_id)];
    if let Some(project_id) = query.project_id.filter(|p| !p.is_empty()) {
        channels.push(project_channel(&project_id));
    }

    let subscription = state.orchestrator.fanout().subscribe(&channels).await?;
    info!(user_id = %user_id, channels = ?channels, "Event subscription opened");
    Ok(sse::subscription_response(subscription))
}

/// Caller's daily quota
async fn quota(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<QuotaStatus>, ApiError> {
    let user_id = user.require()?;
    Ok(Json(state.orchestrator.quota_status(&user_id).await?))
}

/// Build the HTTP router
///
/// Every route except `/health` sits behind the per-client limiter.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/generate", post(generate))
        .route("/generate/stream", post(generate_stream))
        .route("/models", get(get_models))
        .route("/events", get(events))
        .route("/quota", get(quota));
    let limited = middleware::rate_limited(limited, state.client_limiter.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(limited)
        .with_state(state);

    middleware::with_request_tracing(app)
}

/// Run the HTTP server
pub async fn run_server(gateway: Gateway) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", gateway.config.host, gateway.config.port).parse()?;
    let app = router(gateway.app_state());

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GatewayError::validation("x"), StatusCode::BAD_REQUEST),
            (
                GatewayError::RateLimitExceeded { key: "u".into() },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                GatewayError::QuotaExceeded {
                    user_id: "u".into(),
                    daily_limit: 1,
                    used_today: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                GatewayError::Upstream {
                    status: 400,
                    message: "no".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::UpstreamUnavailable {
                    attempts: 4,
                    message: "down".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (GatewayError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn test_body_user_is_fallback() {
        let body = GenerationRequest::new("p", "from-body");
        let request = generation_request(AuthenticatedUser(None), Ok(Json(body.clone()))).unwrap();
        assert_eq!(request.user_id, "from-body");

        let request =
            generation_request(AuthenticatedUser(Some("from-header".into())), Ok(Json(body))).unwrap();
        assert_eq!(request.user_id, "from-header");
    }
}
