use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::error::{TrackerError, TrackerResult};
use crate::live_status::LiveStatus;
use crate::tracker::TrackerOutput;

/// Shared between the HTTP handlers and the task that follows tracker output.
///
/// Every clone holds the output sender, so the broadcast channel never closes
/// while the dashboard is up. [`DashboardState::shutdown`] is what ends the
/// follower, the server and any open sockets.
#[derive(Clone)]
pub struct DashboardState {
    latest: Arc<RwLock<Option<LiveStatus>>>,
    outputs: broadcast::Sender<TrackerOutput>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DashboardState {
    pub fn new(outputs: broadcast::Sender<TrackerOutput>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            latest: Arc::new(RwLock::new(None)),
            outputs,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Keep `latest` current with each diagnostics snapshot the tracker emits.
    pub fn follow_status(&self) -> JoinHandle<()> {
        let mut rx = self.outputs.subscribe();
        let mut stop = self.shutdown.subscribe();
        let latest = self.latest.clone();
        tokio::spawn(async move {
            loop {
                if *stop.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(TrackerOutput::Diagnostics(status)) => *latest.write().await = Some(status),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("Dashboard status follower lagged by {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Dashboard status follower stopped");
        })
    }

    /// Stop the status follower, the HTTP server and open WebSocket streams.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once [`DashboardState::shutdown`] has been called.
    async fn stopped(&self) {
        let mut stop = self.shutdown.subscribe();
        // Only errors if the sender is gone, which `self` rules out
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    pub async fn set_status(&self, status: LiveStatus) {
        *self.latest.write().await = Some(status);
    }
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_dashboard(state: DashboardState, port: u16) -> TrackerResult<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TrackerError::Internal(format!("bind {}: {}", addr, e)))?;
    log::info!("Dashboard listening on http://{}", addr);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move { state.stopped().await })
        .await
        .map_err(|e| TrackerError::Internal(format!("dashboard server: {}", e)))
}

async fn status_handler(State(state): State<DashboardState>) -> Response {
    match state.latest.read().await.clone() {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no status yet" })),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    let rx = state.outputs.subscribe();
    ws.on_upgrade(move |socket| async move {
        tokio::select! {
            _ = handle_socket(socket, rx) => {}
            _ = state.stopped() => {}
        }
    })
}

/// Forward every tracker output to the client as JSON until either side closes.
async fn handle_socket(socket: WebSocket, mut rx: broadcast::Receiver<TrackerOutput>) {
    let (mut sink, mut stream) = socket.split();

    let mut forward = tokio::spawn(async move {
        loop {
            let output = match rx.recv().await {
                Ok(output) => output,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("WebSocket client lagged by {} messages", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let json = match serde_json::to_string(&output) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("Failed to encode tracker output: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; the stream only tells us when the client leaves
    let mut watch = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut forward => watch.abort(),
        _ = &mut watch => forward.abort(),
    }
}
