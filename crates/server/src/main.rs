mod auth;
mod config;
mod dispatch;
mod executors;
mod gateway;
mod media;
mod pending_call;
mod rate_limiter;
mod repositories;
mod session;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonwebtoken::{DecodingKey, EncodingKey};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::dispatch::{AppState, Dispatcher};
use crate::pending_call::PendingCallRegistry;
use crate::rate_limiter::RateLimiter;
use crate::repositories::{InMemoryCallRepository, InMemoryRefreshTokenRepository, InMemoryUserRepository};
use crate::session::SessionRegistry;
use crate::web::{RemoteAddr, WebState};

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/lipcall.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Resolves a config field that may hold either inline PEM text or a
/// filesystem path to a PEM file.
fn resolve_pem(value: &str) -> Result<String> {
    if value.contains("BEGIN") {
        Ok(value.to_string())
    } else {
        std::fs::read_to_string(value).with_context(|| format!("failed to read PEM file: {value}"))
    }
}

/// Loads the configured RSA keypair, or generates an ephemeral one for
/// development when none is configured. An ephemeral keypair means every
/// restart invalidates outstanding tokens.
fn load_jwt_keys(jwt: &lipcall_protocol::JwtConfig) -> Result<(EncodingKey, DecodingKey)> {
    match (&jwt.private_key, &jwt.public_key) {
        (Some(private), Some(public)) => {
            let private_pem = resolve_pem(private)?;
            let public_pem = resolve_pem(public)?;
            Ok((EncodingKey::from_rsa_pem(private_pem.as_bytes())?, DecodingKey::from_rsa_pem(public_pem.as_bytes())?))
        }
        _ => {
            tracing::warn!("No JWT keypair configured, generating an ephemeral one for this process");
            let mut rng = rand::thread_rng();
            let private = rsa::RsaPrivateKey::new(&mut rng, 2048).context("failed to generate RSA keypair")?;
            let public = rsa::RsaPublicKey::from(&private);
            use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
            let priv_pem = private.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)?;
            let pub_pem = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)?;
            Ok((EncodingKey::from_rsa_pem(priv_pem.as_bytes())?, DecodingKey::from_rsa_pem(pub_pem.as_bytes())?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!("Configuration has {} issue(s). Fix the ERROR(s) above and restart.", issues.len());
            std::process::exit(1);
        }
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port).parse().context("Invalid bind address")?;

    let tls_result = tls::build_tls_config(config.server.tls_cert.as_deref(), config.server.tls_key.as_deref())?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    let (encoding_key, decoding_key) = load_jwt_keys(&config.jwt)?;

    let app_state = Arc::new(AppState {
        users: Arc::new(InMemoryUserRepository::default()),
        refresh_tokens: Arc::new(InMemoryRefreshTokenRepository::default()),
        calls: Arc::new(InMemoryCallRepository::default()),
        sessions: Arc::new(SessionRegistry::new()),
        pending_calls: Arc::new(PendingCallRegistry::new()),
        encoding_key,
        decoding_key,
        access_token_ttl_secs: config.jwt.access_token_ttl_secs,
        refresh_token_ttl_secs: config.jwt.refresh_token_ttl_secs,
        video_pool: Arc::new(executors::VideoPool::new(Arc::new(executors::NoopLipReader), 8)),
        audio_recognizer_factory: Arc::new(|| Box::new(executors::NoopRecognizer) as Box<dyn executors::SpeechRecognizer>),
        ice_servers: Vec::new(),
    });

    let web_state = WebState {
        dispatcher: Arc::new(Dispatcher::new(app_state)),
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit.window_secs,
            config.rate_limit.max_messages_per_window,
            config.rate_limit.ban_secs,
        )),
        heartbeat_interval: Duration::from_secs(config.heartbeat.interval_secs),
        heartbeat_timeout: Duration::from_secs(config.heartbeat.timeout_secs),
    };

    let app = web::build_router(web_state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id =
                        request.headers().get("x-request-id").and_then(|v| v.to_str().ok()).unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(|response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                    tracing::event!(
                        Level::INFO,
                        status = %response.status().as_u16(),
                        duration_ms = %latency.as_millis(),
                        "completed"
                    );
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  LipCall Signaling Server v0.1.0");
    tracing::info!("  Listening on wss://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr).await.with_context(|| format!("Failed to bind to {bind_addr}"))?;
    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone().layer(axum::Extension(RemoteAddr(peer_addr)));

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    tracing::info!("LipCall server shut down cleanly");
    Ok(())
}
