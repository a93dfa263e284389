//! HTTP server for Linear webhooks.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection, ConnectInfo, DefaultBodyLimit, FromRequestParts, Query, State,
    },
    http::{header::RETRY_AFTER, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::agent::{relay_event, AgentClient, AgentError, AgentInput, RunMetadata};
use crate::config::Config;
use crate::format::format_payload;
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::webhooks::{
    validate_webhook_timestamp, verify_webhook_signature, PayloadError, WebhookHeaders,
    WebhookPayload,
};

/// Service name reported by the health check.
pub const SERVICE_NAME: &str = "linear-langsmith-webhook-bridge";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Configuration.
    pub config: Arc<Config>,
    /// Agent client.
    pub agent: Arc<dyn AgentClient>,
    /// Per-client request limiter.
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Build state with a limiter sized from `config`.
    pub fn new(config: Config, agent: Arc<dyn AgentClient>) -> Result<Self, RateLimitError> {
        let limiter = RateLimiter::new(config.rate_limit.clone())?;
        Ok(Self::with_limiter(config, agent, Arc::new(limiter)))
    }

    /// Build state around an existing limiter.
    pub fn with_limiter(
        config: Config,
        agent: Arc<dyn AgentClient>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            agent,
            limiter,
        }
    }
}

/// Build the HTTP router for the bridge.
pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        .route(&state.config.webhook_path, post(linear_webhook_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "environment": state.config.environment,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Query parameters accepted by the webhook route.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Shared secret token
    pub token: Option<String>,
}

/// Caller address used as the rate limit key.
#[derive(Debug, Clone, Default)]
pub struct ClientAddr {
    peer: Option<SocketAddr>,
    forwarded_for: Option<String>,
}

impl ClientAddr {
    /// Rate limit key: first `X-Forwarded-For` hop when trusted, else the peer IP.
    #[must_use]
    pub fn key(&self, trust_forwarded_for: bool) -> String {
        if trust_forwarded_for {
            if let Some(forwarded) = &self.forwarded_for {
                return forwarded.clone();
            }
        }
        self.peer
            .map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let forwarded_for = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            peer,
            forwarded_for,
        })
    }
}

/// Rejections and failures on the webhook route.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Stale webhook: {0}")]
    StaleTimestamp(String),

    #[error("Agent invocation failed for webhook {webhook_id}")]
    Agent {
        webhook_id: String,
        source: AgentError,
    },
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            Self::RateLimited {
                message,
                retry_after_secs,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "message": message,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            Self::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid signature" })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response(),
            Self::InvalidPayload(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid payload", "message": message })),
            )
                .into_response(),
            Self::StaleTimestamp(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Stale webhook", "message": message })),
            )
                .into_response(),
            Self::Agent { webhook_id, .. } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "status": "error",
                    "webhook_id": webhook_id,
                    "error": "Agent invocation failed",
                })),
            )
                .into_response(),
        }
    }
}

/// Handle incoming Linear webhooks.
///
/// This handler:
/// 1. Applies the per-client rate limit
/// 2. Verifies the webhook signature (if a secret is configured)
/// 3. Checks the `token` query parameter (if one is configured); an
///    unparseable query string counts as a bad token
/// 4. Parses the payload and drops event types outside the allow-list
/// 5. Relays the formatted event to the agent
pub async fn linear_webhook_handler(
    State(state): State<AppState>,
    client: ClientAddr,
    query: Result<Query<WebhookQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    let config = &state.config;
    let webhook_headers = WebhookHeaders::from_header_map(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let delivery_id = webhook_headers.delivery_id().to_string();
    let client_key = client.key(config.trust_forwarded_for);

    if let Err(e) = state.limiter.check_limit(&client_key).await {
        warn!(delivery_id = %delivery_id, client = %client_key, error = %e, "Rate limit exceeded");
        return Err(match e {
            RateLimitError::LimitExceeded {
                limit,
                retry_after_secs,
                ..
            } => WebhookError::RateLimited {
                message: limit,
                retry_after_secs,
            },
            RateLimitError::ConfigurationError(message) => WebhookError::RateLimited {
                message,
                retry_after_secs: 1,
            },
        });
    }

    if let Some(secret) = &config.signing_secret {
        let verified = webhook_headers
            .signature
            .as_deref()
            .is_some_and(|sig| verify_webhook_signature(&body, sig, secret));
        if !verified {
            warn!(
                delivery_id = %delivery_id,
                client = %client_key,
                has_signature = webhook_headers.signature.is_some(),
                "Invalid Linear signature"
            );
            return Err(WebhookError::InvalidSignature);
        }
        debug!(delivery_id = %delivery_id, "Webhook signature verified");
    }

    if let Some(expected) = &config.webhook_token {
        let supplied = match &query {
            Ok(Query(query)) => query.token.as_deref().unwrap_or_default(),
            Err(rejection) => {
                warn!(delivery_id = %delivery_id, error = %rejection, "Unparseable query string");
                ""
            }
        };
        if !bool::from(supplied.as_bytes().ct_eq(expected.as_bytes())) {
            warn!(delivery_id = %delivery_id, client = %client_key, "Invalid webhook token");
            return Err(WebhookError::Unauthorized);
        }
    }

    let payload = WebhookPayload::parse(&body).map_err(|e| {
        match &e {
            PayloadError::Empty => warn!(delivery_id = %delivery_id, "Empty payload received"),
            PayloadError::Invalid(err) => {
                error!(delivery_id = %delivery_id, error = %err, "Failed to parse webhook payload");
            }
        }
        WebhookError::InvalidPayload(e.to_string())
    })?;

    if let Some(max_age_ms) = config.max_timestamp_age_ms {
        let fresh = payload
            .webhook_timestamp
            .is_some_and(|ts| validate_webhook_timestamp(ts, max_age_ms));
        if !fresh {
            warn!(
                delivery_id = %delivery_id,
                timestamp = ?payload.webhook_timestamp,
                "Webhook timestamp is stale or missing"
            );
            return Err(WebhookError::StaleTimestamp(format!(
                "webhookTimestamp must be within {max_age_ms}ms"
            )));
        }
    }

    info!(
        delivery_id = %delivery_id,
        event_type = %payload.event_type,
        action = %payload.action,
        header_event = webhook_headers.event_type.as_deref().unwrap_or("unknown"),
        "Received Linear webhook"
    );

    if !config.is_event_allowed(&payload.event_type) {
        info!(
            delivery_id = %delivery_id,
            event_type = %payload.event_type,
            "Skipping filtered event type"
        );
        return Ok(Json(json!({
            "status": "skipped",
            "webhook_id": delivery_id,
            "message": format!("Event type {} not in filter", payload.event_type),
        })));
    }

    let input = AgentInput::human(format_payload(&payload)).with_metadata(RunMetadata {
        webhook_id: delivery_id.clone(),
        event_type: payload.event_type.clone(),
        action: payload.action.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });

    let outcome = tokio::time::timeout(
        config.agent.timeout,
        relay_event(state.agent.as_ref(), &input),
    )
    .await
    .unwrap_or(Err(AgentError::Timeout));

    match outcome {
        Ok(reply) => {
            info!(
                delivery_id = %delivery_id,
                thread_id = %reply.thread_id,
                response_length = reply.text.len(),
                "Agent completed"
            );
            Ok(Json(json!({
                "status": "success",
                "webhook_id": delivery_id,
                "thread_id": reply.thread_id,
                "message": "Agent triggered successfully",
                "response_length": reply.text.len(),
            })))
        }
        Err(e) => {
            error!(
                delivery_id = %delivery_id,
                event_type = %payload.event_type,
                error = %e,
                "Error triggering agent"
            );
            Err(WebhookError::Agent {
                webhook_id: delivery_id,
                source: e,
            })
        }
    }
}
