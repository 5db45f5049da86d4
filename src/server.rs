use std::path::Path;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as UrlPath, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{BroadcastHub, SUBSCRIBER_BUFFER},
    orchestrator::{Orchestrator, StartError},
    store::StoreError,
    terminal,
    types::{Report, ReportSummary, RunPhase, RunRequest, StartResponse},
};

#[derive(Clone, Debug)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::InvalidRunId(_) => ApiError::BadRequest(e.to_string()),
            StartError::Duplicate(_) => ApiError::Conflict(e.to_string()),
            StartError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidId(_) => ApiError::NotFound("Report not found".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Build the full application: JSON API, WebSockets, and the static UI fallback.
pub fn router(state: AppState, static_dir: &Path) -> Router {
    let scans = Router::new()
        .route("/start", post(post_start))
        .route("/ws/{run_id}", get(scan_ws))
        .route("/{run_id}/status", get(get_status));

    let reports = Router::new()
        .route("/", get(list_reports))
        .route("/{id}", get(get_report));

    let api = Router::new()
        .nest("/scans", scans)
        .nest("/reports", reports)
        .route("/terminal/ws", get(terminal::terminal_ws))
        .fallback(api_not_found)
        .with_state(state);

    let static_svc = ServeDir::new(static_dir)
        .append_index_html_on_directories(true)
        .fallback(ServeFile::new(static_dir.join("index.html")));

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind `bind` and serve `app` until `shutdown` is cancelled.
pub async fn serve(bind: &str, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_listener(listener, app, shutdown).await
}

/// Serve `app` on an already bound listener until `shutdown` is cancelled.
pub async fn serve_listener(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "serving dashboard");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn post_start(
    State(app): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let run_id = app.orchestrator.start(req).await?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse::initiated(run_id))))
}

async fn get_status(
    State(app): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> Json<RunPhase> {
    Json(app.orchestrator.status(&run_id).await)
}

async fn list_reports(State(app): State<AppState>) -> Result<Json<Vec<ReportSummary>>, ApiError> {
    Ok(Json(app.orchestrator.store().list().await?))
}

async fn get_report(
    State(app): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Report>, ApiError> {
    app.orchestrator
        .store()
        .read(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Report not found".into()))
}

async fn api_not_found() -> ApiError {
    ApiError::NotFound("Not Found".into())
}

async fn scan_ws(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> Response {
    let hub = app.orchestrator.hub().clone();
    ws.on_upgrade(move |socket| observe_run(socket, hub, run_id))
}

/// Subscribe the socket to `run_id` and forward events until the client goes away.
///
/// The hub holds the only strong sender. Once it prunes this observer the forwarding loop
/// ends and the socket is closed.
async fn observe_run(socket: WebSocket, hub: BroadcastHub, run_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let observer = tx.downgrade();
    hub.subscribe(&run_id, tx).await;
    info!(run_id = %run_id, "observer connected");

    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to encode run event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        debug!("observer dropped by the hub, closing socket");
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(run_id = %run_id, text = text.as_str(), "ignoring inbound frame")
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "observer socket error");
                break;
            }
        }
    }

    if let Some(tx) = observer.upgrade() {
        hub.unsubscribe(&run_id, &tx).await;
    }
    forward.abort();
    info!(run_id = %run_id, "observer disconnected");
}
