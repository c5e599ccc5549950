use anyhow::{Context, Result};
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::api::{self, AppState};
use crate::config::settings::Config;
use crate::db::{Database, Schema};
use crate::execute::executor::Executor;

pub async fn start_server(config: &Config, port: Option<u16>) -> Result<()> {
    let store_path = config.store_path()?;
    let store = Database::open(&store_path, Schema::Store)?;
    info!("backing store ready at {}", store_path.display());

    if config.auth.tokens.is_empty() {
        warn!("no [auth] tokens configured; every authenticated route will answer 401");
    }

    let state = AppState::new(Executor::new(store), config.auth.tokens.clone());
    let app = api::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.bind, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    println!("sitelog server running at http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
