//! Push endpoint for bridges that deliver events instead of being polled.

use crate::server::ChatpaceState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use cp_channels::BridgeEnvelope;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/inbound", post(post_inbound))
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_inbound(
    Extension(state): Extension<Arc<ChatpaceState>>,
    Json(envelope): Json<BridgeEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    let index = state.pushed_events.fetch_add(1, Ordering::Relaxed);
    let Some(event) = envelope.to_inbound(&state.channel_id, index) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": "unusable event" })),
        );
    };
    let event_id = event.event_id.clone();
    if let Err(e) = state.inbound_tx.send(event).await {
        tracing::error!(error = %e, "inbound queue closed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "error", "error": "shutting down" })),
        );
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted", "event_id": event_id })),
    )
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::routes::response_body_json;
    use crate::server::test_support;
    use axum::Extension;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
    use cp_channels::InboundKind;
    use tower::util::ServiceExt;

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/inbound")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn pushed_text_reaches_the_gateway_channel() {
        let (state, mut rx) = test_support::state();
        let response = router()
            .layer(Extension(state))
            .oneshot(post(serde_json::json!({
                "event_id": "evt-1",
                "sender": "alice",
                "content": "hello",
            })))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response_body_json(response).await;
        assert_eq!(body["event_id"], "evt-1");

        let event = rx.recv().await.expect("event forwarded");
        assert_eq!(event.kind, InboundKind::Text);
        assert_eq!(event.conversation_id.as_str(), "alice");
        assert_eq!(event.channel_id, "bridge");
    }

    #[tokio::test]
    async fn group_event_without_conversation_is_rejected() {
        let (state, mut rx) = test_support::state();
        let response = router()
            .layer(Extension(state))
            .oneshot(post(serde_json::json!({
                "sender": "bob",
                "is_group": true,
                "content": "hi all",
            })))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }
}
