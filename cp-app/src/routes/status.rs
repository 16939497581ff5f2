use crate::server::ChatpaceState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/status", get(get_status))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<ChatpaceState>>) -> Json<serde_json::Value> {
    let engagement = state.engagement.as_ref().map(|scheduler| {
        serde_json::json!({
            "watched": scheduler.len(),
            "conversations": scheduler.snapshot(),
        })
    });

    Json(serde_json::json!({
        "channel_id": state.channel_id,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "gate": state.gate.snapshot(),
        "queue": {
            "pending": state.queue.len(),
            "conversations": state.queue.snapshot(),
        },
        "pending_sticker_timers": state.gateway.pending_sticker_timers(),
        "engagement": engagement,
    }))
}
