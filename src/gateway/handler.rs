//! HTTP API and stream upgrade handler

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::gateway::server::GatewayState;
use crate::registry::ConnectionRegistry;
use crate::router::ChannelRouter;
use crate::session::stream::{self, UpgradeParams};
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub(crate) verifier: Arc<TokenVerifier>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Arc<ChannelRouter>,
    pub(crate) gateway_config: GatewayConfig,
    pub(crate) state: Arc<RwLock<GatewayState>>,
}

/// API handler for HTTP endpoints
pub struct ApiHandler;

impl ApiHandler {
    /// Create the router
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/status", get(get_status))
            .route("/stream/:identity", get(stream_upgrade))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Status response
#[derive(Debug, Serialize)]
struct StatusResponse {
    state: String,
    active_connections: usize,
    topics: usize,
    identities: HashMap<String, usize>,
}

/// Get gateway status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        state: format!("{:?}", *state.state.read().await),
        active_connections: state.registry.total(),
        topics: state.router.topic_count().await,
        identities: state.registry.identity_counts(),
    })
}

/// Stream upgrade query parameters
#[derive(Debug, Deserialize)]
struct StreamQuery {
    /// Bearer credential; may instead arrive in the Authorization header
    token: Option<String>,
    /// Conversation addressed by this stream
    conversation: Option<String>,
}

/// WebSocket upgrade for `/stream/:identity`
///
/// All validation happens after the upgrade so every rejection surfaces as
/// a precise close code rather than an opaque HTTP error.
async fn stream_upgrade(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    // Query parameter wins over the Authorization header
    let credential = query.token.clone().or_else(|| bearer_token(&headers));

    let params = UpgradeParams {
        claimed_identity: identity,
        conversation: query.conversation,
        credential,
        origin,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: UpgradeParams) {
    let established = stream::establish(
        params,
        &state.verifier,
        &state.registry,
        &state.router,
        &state.gateway_config.allowed_origins,
    )
    .await;

    match established {
        Ok(session) => {
            stream::run(
                socket,
                session,
                &state.router,
                &state.registry,
                state.gateway_config.max_inbound_frame_bytes,
            )
            .await;
        }
        Err(reason) => {
            tracing::info!(code = reason.code(), %reason, "Stream setup rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: reason.code(),
                    reason: reason.as_str().into(),
                })))
                .await;
        }
    }
}

/// Extract a bearer credential from the Authorization header
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}
