//! HTTP endpoint answering the `/kubectl` Slack slash command.
//!
//! Stateless: checks the shared token and replies with a fixed liveness
//! message. Shares nothing with the watch pipeline.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const ALIVE_TEXT: &str = "I'm alive!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashConfig {
    /// Verification token Slack sends with every command.
    pub token: String,
    pub listen: SocketAddr,
}

/// Form fields Slack posts for a slash command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlashCommand {
    pub token: String,
    pub team_id: String,
    pub team_domain: String,
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    pub text: String,
    pub response_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlashResponse {
    pub text: String,
    pub attachments: Vec<ResponseAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseAttachment {
    pub text: String,
    pub color: String,
}

struct AppState {
    token: String,
}

pub fn build_router(token: impl Into<String>) -> Router {
    let state = Arc::new(AppState { token: token.into() });
    Router::new()
        .route("/kubectl", post(kubectl_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn kubectl_handler(
    State(state): State<Arc<AppState>>,
    Form(cmd): Form<SlashCommand>,
) -> Result<Json<SlashResponse>, (StatusCode, &'static str)> {
    if cmd.token != state.token {
        warn!(user = %cmd.user_name, team = %cmd.team_domain, "slash command with invalid token");
        return Err((StatusCode::UNAUTHORIZED, "Invalid token."));
    }
    debug!(user = %cmd.user_name, channel = %cmd.channel_name, command = %cmd.command, text = %cmd.text, "slash command");
    Ok(Json(SlashResponse { text: ALIVE_TEXT.to_string(), attachments: Vec::new() }))
}

/// Serve until Ctrl-C.
pub async fn serve(cfg: &SlashConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(addr = %cfg.listen, "slash command endpoint listening");
    axum::serve(listener, build_router(cfg.token.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down slash endpoint");
        })
        .await
        .context("serving slash command endpoint")
}
