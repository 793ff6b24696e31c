use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use basket_core::BasketKey;
use basket_store::Store;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::hub::{self, HubHandle};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: HubHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub max_send_queue: usize,
}

impl AppState {
    /// Wire a dispatcher with every basket method onto `hub`.
    pub fn new(store: Store, hub: HubHandle, max_send_queue: usize) -> Self {
        let mut dispatcher = Dispatcher::new(hub.clone());
        handlers::register_all(&mut dispatcher);
        Self {
            store,
            hub,
            dispatcher: Arc::new(dispatcher),
            max_send_queue,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the hub and the HTTP listener. Returns a handle to shut them down.
pub async fn start(config: ServerConfig, store: Store) -> Result<ServerHandle, std::io::Error> {
    let (hub, hub_task) = hub::spawn(config.hub_queue);
    let state = AppState::new(store, hub.clone(), config.max_send_queue);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "basket server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        hub,
        shutdown: Some(shutdown_tx),
        server,
        _hub: hub_task,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    _hub: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and give in-flight requests a grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Open WebSockets hold graceful shutdown until they close.
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server).await.is_err() {
            warn!(addr = %self.addr, "graceful shutdown timed out, aborting");
            self.server.abort();
        }
        info!(addr = %self.addr, "basket server stopped");
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    basket: Option<String>,
}

/// WebSocket upgrade handler. Rejects a missing or non-v4 basket key with 400.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let raw = params.basket.unwrap_or_default();
    let basket = match BasketKey::parse(&raw) {
        Ok(key) => key,
        Err(e) => {
            warn!(basket = %raw, error = %e, "rejecting WebSocket upgrade");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| connection::handle_ws_connection(socket, basket, state))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.hub.client_count().await;
    if state.store.database().is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "clients": clients })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "status": "healthy", "clients": clients })),
    )
}
