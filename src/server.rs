use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::logging::{LogError, WebResult};
use crate::model::SubscriptionInfo;
use crate::registry::Registration;
use crate::server_state::ServerState;

/// Largest subscription body accepted.
pub const MAX_SUBSCRIPTION_BYTES: usize = 4096;

async fn status() -> &'static str {
    "ok"
}

async fn vapid_public_key(State(state): State<ServerState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "application/octet-stream")],
        state.vapid_pubkey.to_vec(),
    )
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "application/json" || v.starts_with("application/json;"))
        .unwrap_or(false)
}

async fn new_subscription(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebResult<StatusCode> {
    if !is_json(&headers) {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let info: SubscriptionInfo = serde_json::from_slice(&body).log_error_unprocessable()?;
    tracing::info!(endpoint = %info.endpoint, "New push subscription.");

    match state.registry.add(&info).log_error_unprocessable()? {
        Registration::Added(_) | Registration::AlreadyRegistered(_) => Ok(StatusCode::NO_CONTENT),
        Registration::Closed(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

pub fn app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/vapid-public-key", get(vapid_public_key))
        .route("/new-subscription", post(new_subscription))
        .layer(DefaultBodyLimit::max(MAX_SUBSCRIPTION_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Could not listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
}

pub async fn serve(port: Option<u16>, state: ServerState) -> anyhow::Result<()> {
    let port: u16 = if let Some(port) = port {
        port
    } else if let Ok(port) = std::env::var("PORT") {
        port.parse()?
    } else {
        8080
    };

    let registry = state.registry.clone();
    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::ikm::EphemeralEcdh;
    use crate::model::tests::{AUTH, P256DH};
    use crate::registry::tests::RecordingDelivery;
    use crate::registry::{RegistryConfig, SubscriptionRegistry};

    fn state() -> ServerState {
        ServerState {
            registry: SubscriptionRegistry::new(
                RegistryConfig {
                    delivery_interval: Duration::from_secs(3600),
                    ..RegistryConfig::default()
                },
                Arc::new(EphemeralEcdh),
                Arc::new(RecordingDelivery::default()),
            ),
            vapid_pubkey: vec![4u8; 65].into(),
        }
    }

    fn subscribe(content_type: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/new-subscription")
            .header(CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    fn subscription_json(endpoint: &str) -> String {
        serde_json::json!({
            "endpoint": endpoint,
            "keys": { "p256dh": P256DH, "auth": AUTH },
            "expirationTime": null,
        })
        .to_string()
    }

    #[tokio::test]
    async fn status_is_ok() {
        let response = app(state())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn serves_raw_public_key() {
        let response = app(state())
            .oneshot(
                Request::builder()
                    .uri("/vapid-public-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/octet-stream"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], &[4u8; 65][..]);
    }

    #[tokio::test]
    async fn registers_subscription_once() {
        let state = state();
        let json = subscription_json("https://push.example.net/send/1");

        for _ in 0..2 {
            let response = app(state.clone())
                .oneshot(subscribe("application/json; charset=utf-8", json.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn rejects_wrong_content_type() {
        let state = state();
        let response = app(state.clone())
            .oneshot(subscribe(
                "text/plain",
                subscription_json("https://push.example.net/send/1"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let padding = "x".repeat(MAX_SUBSCRIPTION_BYTES);
        let response = app(state())
            .oneshot(subscribe(
                "application/json",
                subscription_json(&format!("https://push.example.net/{}", padding)),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn rejects_malformed_json_and_schemes() {
        let state = state();

        let response = app(state.clone())
            .oneshot(subscribe("application/json", "{\"endpoint\":"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app(state.clone())
            .oneshot(subscribe(
                "application/json",
                subscription_json("ws://push.example.net/send/1"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = app(state())
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
