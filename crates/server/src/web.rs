//! The server's only externally visible HTTP surface: a single WebSocket
//! upgrade route plus a liveness probe. Everything else happens inside
//! the encrypted WS channel, so there is no REST API to speak of.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::gateway::handle_connection;
use crate::rate_limiter::RateLimiter;

/// The peer address of the raw TCP connection, injected per-connection by
/// the manual accept loop in `main.rs` since the hand-rolled hyper server
/// doesn't run through `axum::serve`'s `ConnectInfo` machinery.
#[derive(Clone, Copy)]
pub struct RemoteAddr(pub SocketAddr);

#[derive(Clone)]
pub struct WebState {
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limiter: Arc<RateLimiter>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

pub fn build_router(state: WebState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(axum::middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Extension(RemoteAddr(remote_addr)): Extension<RemoteAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_connection(
            socket,
            remote_addr.ip(),
            state.dispatcher,
            state.rate_limiter,
            state.heartbeat_interval,
            state.heartbeat_timeout,
        )
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn security_headers(request: axum::extract::Request, next: axum::middleware::Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, "nosniff".parse().unwrap());
    headers.insert(header::X_FRAME_OPTIONS, "DENY".parse().unwrap());
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=63072000; includeSubDomains".parse().unwrap(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AppState;
    use crate::executors::{self, SpeechRecognizer, VideoPool};
    use crate::pending_call::PendingCallRegistry;
    use crate::repositories::{InMemoryCallRepository, InMemoryRefreshTokenRepository, InMemoryUserRepository};
    use crate::session::SessionRegistry;
    use http_body_util::BodyExt;
    use jsonwebtoken::{DecodingKey, EncodingKey};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tower::ServiceExt;

    fn test_state() -> WebState {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let priv_pem = private.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let pub_pem = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let app_state = Arc::new(AppState {
            users: Arc::new(InMemoryUserRepository::default()),
            refresh_tokens: Arc::new(InMemoryRefreshTokenRepository::default()),
            calls: Arc::new(InMemoryCallRepository::default()),
            sessions: Arc::new(SessionRegistry::new()),
            pending_calls: Arc::new(PendingCallRegistry::new()),
            encoding_key: EncodingKey::from_rsa_pem(priv_pem.as_bytes()).unwrap(),
            decoding_key: DecodingKey::from_rsa_pem(pub_pem.as_bytes()).unwrap(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 3600,
            video_pool: Arc::new(VideoPool::new(Arc::new(executors::NoopLipReader), 8)),
            audio_recognizer_factory: Arc::new(|| Box::new(executors::NoopRecognizer) as Box<dyn SpeechRecognizer>),
            ice_servers: vec![],
        });
        WebState {
            dispatcher: Arc::new(Dispatcher::new(app_state)),
            rate_limiter: Arc::new(RateLimiter::new(5, 5, 30)),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let app = build_router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers().get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
    }
}
