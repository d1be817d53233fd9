//! The socket gateway: authenticated WebSocket sessions plus a health
//! probe.

pub mod auth;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::api::error::{ErrorResponse, ToHttpStatus};
use serde::Deserialize;
use tracing::info;

use crate::context::AppContext;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(ctx)
}

async fn health(
    State(ctx): State<Arc<AppContext>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "env": ctx.config.deploy_env.as_str(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: String,
}

/// The token is checked before the upgrade completes; a bad token never
/// gets a socket.
async fn ws_upgrade(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match ctx.verifier.verify(&params.token) {
        Ok(identity) => {
            info!(user_id = %identity.user_id, role = %identity.role, "socket auth ok");
            ws.on_upgrade(move |socket| {
                session::handle(ctx, socket, identity)
            })
            .into_response()
        }
        Err(err) => {
            let status = err.to_http_status();
            (status, Json(ErrorResponse::from(err))).into_response()
        }
    }
}
