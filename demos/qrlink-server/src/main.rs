//! HTTP panel over the session manager, backed by simulated protocol clients.
//!
//! Run with: cargo run -p qrlink-server
//!
//! `GET /qrcode` starts a pairing attempt, `POST /sessions/{id}/simulate-scan`
//! plays the phone confirming it, `GET /events` streams lifecycle events.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use qrcode::{QrCode, render::svg};
use qrlink_core::{
    PanelConfig,
    sim::{SimScript, SimulatedFactory},
    traits::{DeviceIdentity, SessionId, SessionRecord},
};
use qrlink_session::{ConnectionState, ManagerError, SessionManager, storage::SqliteStore};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Manager = SessionManager<SimulatedFactory, SqliteStore>;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("Failed to render QR code: {0}")]
    Render(#[from] qrcode::types::QrError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Manager(ManagerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Manager(ManagerError::QrTimeout(_)) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = PanelConfig::from_env().context("failed to load configuration")?;
    let store = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    let manager = SessionManager::new(
        SimulatedFactory::new(SimScript::default()),
        store,
        config.session.clone(),
    );
    if let Err(e) = manager.purge_orphaned_artifacts().await {
        tracing::warn!("Failed to purge orphaned session stores: {e}");
    }

    let state = AppState {
        manager: Arc::clone(&manager),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/qrcode", get(qrcode_handler))
        .route("/connection-status", get(status_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/{id}", delete(delete_handler))
        .route("/sessions/{id}/disconnect", post(disconnect_handler))
        .route("/sessions/{id}/simulate-scan", post(scan_handler))
        .route("/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct QrResponse {
    session_id: SessionId,
    code: String,
    svg: String,
}

async fn qrcode_handler(State(state): State<AppState>) -> Result<Json<QrResponse>, ApiError> {
    let pairing = state.manager.start_pairing().await?;
    let svg = QrCode::new(pairing.code.as_bytes())?
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build();

    Ok(Json(QrResponse {
        session_id: pairing.session_id,
        code: pairing.code,
        svg,
    }))
}

#[derive(Deserialize)]
struct StatusQuery {
    session_id: SessionId,
}

#[derive(Serialize)]
struct StatusResponse {
    session_id: SessionId,
    connected: bool,
    state: ConnectionState,
}

async fn status_handler(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = state.manager.get_session(query.session_id).await?;
    Ok(Json(StatusResponse {
        session_id: handle.id(),
        connected: handle.is_connected(),
        state: handle.state(),
    }))
}

#[derive(Serialize)]
struct SessionView {
    display_name: String,
    phone: String,
    #[serde(flatten)]
    record: SessionRecord,
}

async fn sessions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = state
        .manager
        .persisted_sessions()
        .await?
        .into_iter()
        .map(|record| SessionView {
            display_name: record.display_name(),
            phone: record.formatted_phone().to_string(),
            record,
        })
        .collect();
    Ok(Json(sessions))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disconnect_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    state.manager.disconnect_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ScanQuery {
    phone: Option<String>,
}

async fn scan_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = state.manager.get_session(id).await?;
    let phone = query.phone.unwrap_or_else(|| "5511900000000".to_string());
    handle.client().scan(DeviceIdentity {
        remote_id: format!("{phone}.0:1@s.whatsapp.net"),
        phone_number: phone,
    });

    Ok(Json(StatusResponse {
        session_id: id,
        connected: handle.is_connected(),
        state: handle.state(),
    }))
}

async fn events_handler(State(state): State<AppState>) -> impl IntoResponse {
    Sse::new(state.manager.feed().sse_stream()).keep_alive(KeepAlive::default())
}
