// HTTP API server

use crate::error::Result;
use crate::pipeline::Services;
use axum::http::Method;
use axum::routing::{delete, get, post, put};
use axum::Router;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

pub mod handlers;
pub mod management;
pub mod models;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

pub fn build_router(services: Arc<Services>) -> Router {
    let state = AppState { services };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(management::health))
        .route("/v1/messages", post(handlers::messages))
        // Admin API
        .route("/api/admin/accounts", get(management::list_accounts))
        .route("/api/admin/accounts", post(management::create_accounts))
        .route("/api/admin/accounts/:id", put(management::update_account))
        .route(
            "/api/admin/accounts/:id",
            delete(management::delete_account),
        )
        .route(
            "/api/admin/accounts/oauth/authorize-url",
            get(management::oauth_authorize_url),
        )
        .route(
            "/api/admin/accounts/oauth/exchange",
            post(management::oauth_exchange),
        )
        .route(
            "/api/admin/accounts/:id/reauthenticate",
            post(management::reauthenticate_account),
        )
        .route("/api/admin/settings", get(management::get_settings))
        .route("/api/admin/settings", put(management::put_settings))
        .route("/api/admin/statistics", get(management::statistics))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(services: Arc<Services>) -> Result<()> {
    let config = services.settings.get();
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(services);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::ProxyError::Internal(anyhow::anyhow!("bind {}: {}", addr, e)))?;
    tracing::info!("API server listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();
    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await
        .map_err(|e| crate::error::ProxyError::Internal(anyhow::anyhow!("serve: {}", e)))?;

    Ok(())
}

pub fn stop_server() {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("API server stopped");
        }
    }
}
