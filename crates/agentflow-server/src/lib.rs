//! Agentflow Server — HTTP adapter for the workflow platform.
//!
//! A standalone axum backend on top of `agentflow-core`, exposing:
//! - workflow CRUD and manual/webhook triggers
//! - the scheduler tick endpoint
//! - decision query/respond
//! - plan generation
//! - per-execution SSE event streams

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use agentflow_core::db::Database;
use agentflow_core::integrations::AdapterRegistry;
use agentflow_core::planner::HttpModelClient;
use agentflow_core::state::{AppConfig, AppState, AppStateInner};

/// Configuration for the Agentflow backend server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3410,
            db_path: "agentflow.db".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("AGENTFLOW_HOST") {
            config.host = v;
        }
        if let Ok(v) = std::env::var("AGENTFLOW_PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Ok(v) = std::env::var("AGENTFLOW_DB_PATH") {
            config.db_path = v;
        }
        config
    }
}

/// Create a shared `AppState` from a database path, with adapters and the
/// model client configured from the environment.
pub fn create_app_state(db_path: &str) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(Arc::new(AppStateInner::new(
        db,
        Arc::new(AdapterRegistry::from_env()),
        Arc::new(HttpModelClient::from_env()),
        AppConfig::from_env(),
    )))
}

/// Start the backend server. Returns the actual listening address.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow_server=info,tower_http=info".into()),
        )
        .init();

    tracing::info!(
        "Starting Agentflow backend server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.db_path)?;
    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`. Useful when the
/// state is shared with another consumer (embedded runner, tests).
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Agentflow backend server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "agentflow-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
