use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatcher::{Dispatcher, StatusSnapshot};

pub fn create_app(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .with_state(dispatcher)
}

async fn status_handler(State(dispatcher): State<Dispatcher>) -> Json<StatusSnapshot> {
    Json(dispatcher.snapshot())
}

/// Bind the status listener; serving starts with [`serve`]
pub async fn bind(listen: &str) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind status server on {listen}"))
}

pub async fn serve(listener: TcpListener, dispatcher: Dispatcher) -> Result<()> {
    info!("Status server listening on {}", listener.local_addr()?);
    axum::serve(listener, create_app(dispatcher))
        .await
        .context("Status server stopped")
}
