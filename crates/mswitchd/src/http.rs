//! HTTP control surface (C8).
//!
//! A thin `axum` router over the Command Queue: every handler enqueues and
//! returns, it never touches `ControllerState` directly. Shaped after
//! `midi-admin::api::failover`'s handlers — `State` extractor,
//! `Json<Value>` responses — generalized from host-pair failover toggles
//! to N-way source switching, plus a `GET /status` read endpoint in the
//! same shape as `get_failover_state`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use mswitch_core::Controller;

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

pub fn build_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/switch/:id", post(switch_by_path))
        .route("/switch", post(switch_by_body))
        .route("/status", get(status))
        .with_state(controller)
}

#[derive(Debug, Deserialize)]
struct SwitchBody {
    source: String,
}

async fn switch_by_path(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    enqueue_switch(&controller, &id)
}

async fn switch_by_body(
    State(controller): State<Arc<Controller>>,
    Json(body): Json<SwitchBody>,
) -> (StatusCode, Json<Value>) {
    enqueue_switch(&controller, &body.source)
}

fn enqueue_switch(controller: &Controller, source_id: &str) -> (StatusCode, Json<Value>) {
    match controller.request_switch(source_id, now_us()) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "source": source_id })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": err.to_string() })),
        ),
    }
}

async fn status(State(controller): State<Arc<Controller>>) -> Json<Value> {
    let active_index = controller.state.active_index();
    let sources: Vec<Value> = controller
        .sources
        .iter()
        .enumerate()
        .map(|(idx, descriptor)| {
            let health = descriptor.health_snapshot();
            json!({
                "index": idx,
                "id": descriptor.meta.id,
                "name": descriptor.meta.name,
                "active": idx == active_index,
                "is_healthy": health.is_healthy,
                "current_loss_percent": health.current_loss_percent,
                "stream_loss_count": health.stream_loss_count,
            })
        })
        .collect();

    Json(json!({
        "active_index": active_index,
        "switching": controller.state.switching(),
        "mode": controller.state.mode.to_string(),
        "failover_count": controller.policy.failover_count(),
        "last_failover_time_ms": controller.policy.last_failover_time_ms(),
        "switch_count": controller.switch_count.get(),
        "sources": sources,
    }))
}
