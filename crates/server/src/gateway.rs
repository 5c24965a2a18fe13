//! Per-connection lifecycle: X25519 handshake, then a receive loop that
//! decrypts envelopes, rate-limits, dispatches, and re-encrypts replies,
//! multiplexed against a heartbeat timeout and an outbox fed by other
//! connections routing messages to this user.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use lipcall_protocol::{decrypt_json, derive_session_key, encrypt_json, generate_keypair, generate_salt};
use lipcall_protocol::{ClientHello, ClientMessage, ErrorCode, ServerHello, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::dispatch::{ConnectionIdentity, Dispatcher};
use crate::rate_limiter::{RateLimiter, Verdict};

/// WebSocket close code used when a connection is banned by the rate
/// limiter, matching the range reserved for application-level closes.
const CLOSE_CODE_RATE_LIMITED: u16 = 4008;

pub async fn handle_connection(
    mut socket: WebSocket,
    remote_addr: IpAddr,
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Arc<RateLimiter>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let session_key = match perform_handshake(&mut socket).await {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!("handshake failed: {err}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let mut identity = ConnectionIdentity::default();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let (mut sink, mut stream) = socket.split();
    let mut last_activity = Instant::now();
    let mut ticker = tokio::time::interval(heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if last_activity.elapsed() > heartbeat_timeout {
                    tracing::info!("connection {connection_id} timed out on heartbeat");
                    break;
                }
            }
            outgoing = outbox_rx.recv() => {
                let Some(message) = outgoing else { break };
                if send_encrypted(&mut sink, &session_key, &message).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else { break };
                let Ok(incoming) = incoming else { break };
                let Message::Text(text) = incoming else {
                    if matches!(incoming, Message::Close(_)) { break; }
                    continue;
                };
                last_activity = Instant::now();

                if let Verdict::Banned { remaining } = rate_limiter.check(remote_addr) {
                    tracing::warn!(%remote_addr, ?remaining, "closing connection: rate limit exceeded");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_CODE_RATE_LIMITED,
                            reason: "rate limited".into(),
                        })))
                        .await;
                    break;
                }

                let envelope: lipcall_protocol::EncryptedEnvelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let client_message: ClientMessage = match decrypt_json(&session_key, &envelope) {
                    Ok(m) => m,
                    Err(_) => {
                        let reply = ServerMessage::error(ErrorCode::UnknownError, "could not decrypt message");
                        if send_encrypted(&mut sink, &session_key, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let was_logged_in = identity.user_id;
                let reply = dispatcher.dispatch(&mut identity, client_message).await;

                if was_logged_in.is_none() {
                    if let Some(user_id) = identity.user_id {
                        let username = identity.username.clone().unwrap_or_default();
                        dispatcher.state.sessions.register(user_id, username, outbox_tx.clone());
                    }
                }

                if send_encrypted(&mut sink, &session_key, &reply).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(user_id) = identity.user_id {
        if let Some(session) = dispatcher.state.sessions.get(user_id) {
            if let Some(pc) = session.take_server_pc() {
                let _ = pc.close().await;
            }
        }
        dispatcher.state.sessions.remove(user_id);
    }
}

async fn perform_handshake(socket: &mut WebSocket) -> anyhow::Result<[u8; 32]> {
    let Some(Ok(Message::Text(text))) = socket.next().await else {
        anyhow::bail!("socket closed before client hello");
    };
    let hello: ClientHello = serde_json::from_str(&text)?;
    let client_public = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &hello.client_public_key)?;

    let (secret, public) = generate_keypair();
    let salt = generate_salt();
    let reply = ServerHello {
        server_public_key: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, public.as_bytes()),
        salt: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, salt),
    };
    socket.send(Message::Text(serde_json::to_string(&reply)?.into())).await?;

    let key = derive_session_key(secret, &client_public, &salt)?;
    Ok(key)
}

async fn send_encrypted(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    key: &[u8; 32],
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let envelope = encrypt_json(key, message)?;
    let text = serde_json::to_string(&envelope)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
