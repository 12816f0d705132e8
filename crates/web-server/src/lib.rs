// In crates/web-server/src/lib.rs

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
};
use core_types::{SessionId, Symbol};
use engine::SessionController;
use events::{InstanceView, WsMessage};
use futures::{sink::SinkExt, stream::StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use types::{
    EmergencyStopResponse, ResetResponse, StartSessionRequest, StartSessionResponse, ValidateResponse,
    link_state_name,
};

pub mod error;
pub mod types;

// Re-export our custom error type for convenience.
pub use error::{Error, Result};

/// The shared application state that is available to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
}

impl AppState {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

/// Creates the main application router with all routes and middleware.
pub fn create_router(app_state: AppState) -> Router {
    // Any origin; there is no authentication to protect.
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let api_router = Router::new()
        .route("/sessions", post(start_session_handler).get(list_sessions_handler))
        .route("/sessions/{id}", delete(stop_session_handler))
        .route("/sessions/{id}/reset", post(reset_connection_handler))
        .route("/emergency-stop", post(emergency_stop_handler))
        .route("/strategies/validate", post(validate_strategy_handler));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check_handler))
        .nest("/api", api_router)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn health_check_handler() -> &'static str {
    "OK"
}

/// `POST /api/sessions`
async fn start_session_handler(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>)> {
    if request.symbol.trim().is_empty() {
        return Err(Error::BadRequest("symbol must not be empty".into()));
    }
    let session_id = state
        .controller
        .start(Symbol::new(&request.symbol), &request.strategy_id)
        .await?;
    Ok((StatusCode::CREATED, Json(StartSessionResponse { session_id })))
}

/// `GET /api/sessions`
async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(state.controller.sessions().await)
}

/// `DELETE /api/sessions/{id}`
async fn stop_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>> {
    let view = state.controller.stop(&SessionId(id)).await?;
    Ok(Json(view))
}

/// `POST /api/sessions/{id}/reset`
async fn reset_connection_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResetResponse>> {
    let session_id = SessionId(id);
    let previous = state.controller.reset_connection(&session_id).await?;
    Ok(Json(ResetResponse { session_id, previous_link_state: link_state_name(previous) }))
}

/// `POST /api/emergency-stop`
async fn emergency_stop_handler(State(state): State<AppState>) -> Json<EmergencyStopResponse> {
    let instances = state.controller.stop_all().await;
    Json(EmergencyStopResponse { stopped: instances.len(), instances })
}

/// `POST /api/strategies/validate`. The body is the raw strategy JSON.
async fn validate_strategy_handler(State(state): State<AppState>, body: String) -> Result<Json<ValidateResponse>> {
    let definition = state.controller.validator().validate_json(&body)?;
    let sections = definition
        .sections()
        .filter(|section| !section.is_empty())
        .map(|section| section.id.as_str())
        .collect();
    Ok(Json(ValidateResponse {
        valid: true,
        strategy_id: definition.id,
        fingerprint: definition.fingerprint,
        sections,
    }))
}

/// The handler for `GET /ws`.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, message: &WsMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialise outbound event.");
            true
        }
    }
}

/// Replays a `full_update`, then streams live events until the client leaves.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    tracing::info!("New WebSocket client connected.");

    // Subscribe before taking the snapshot so nothing falls in between.
    let mut rx = state.controller.subscribe();
    let snapshot = WsMessage::FullUpdate(state.controller.full_update().await);
    if !send_json(&mut socket, &snapshot).await {
        tracing::info!("WebSocket client disconnected during replay.");
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) => {
                    if !send_json(&mut socket, &message).await {
                        tracing::info!("WebSocket client disconnected.");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "WebSocket client lagged behind the event stream.");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket client sent close frame.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::info!(error = %e, "WebSocket client errored.");
                    break;
                }
            },
        }
    }
    tracing::info!("WebSocket client connection closed.");
}

/// Binds `host:port` and serves the API until `shutdown` resolves.
pub async fn run<F>(host: &str, port: u16, app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(app_state);

    let address = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&address).await.map_err(Error::ServerBindError)?;
    tracing::info!("Web server listening on {}", address);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Serve)
}
