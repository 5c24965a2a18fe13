//! Central message dispatcher: the one place a decoded [`ClientMessage`]
//! is turned into reactions. Every message other than `signup`, `login`,
//! `refresh_token`, and `heartbeat` carries its own `access_token` and
//! `user_id`; the dispatcher verifies the token and its subject before a
//! handler ever sees the message, rather than trusting a cached
//! "logged in" flag from earlier in the connection's life.

use std::sync::Arc;

use jsonwebtoken::{DecodingKey, EncodingKey};
use lipcall_protocol::{
    CallHistoryEntry, ClientMessage, ContactInfo, ErrorCode, IceCandidateInfo, ModelPreference, ServerMessage,
    SignalingTarget,
};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::auth::{self, TokenVerifyError};
use crate::executors::{self, SpeechRecognizer, VideoPool};
use crate::media;
use crate::pending_call::{PendingCall, PendingCallRegistry};
use crate::repositories::{CallRepository, RefreshTokenRepository, UserRepository};
use crate::session::SessionRegistry;

pub struct AppState {
    pub users: Arc<dyn UserRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub calls: Arc<dyn CallRepository>,
    pub sessions: Arc<SessionRegistry>,
    pub pending_calls: Arc<PendingCallRegistry>,
    pub encoding_key: EncodingKey,
    pub decoding_key: DecodingKey,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub video_pool: Arc<VideoPool>,
    pub audio_recognizer_factory: Arc<dyn Fn() -> Box<dyn SpeechRecognizer> + Send + Sync>,
    pub ice_servers: Vec<RTCIceServer>,
}

/// Per-connection identity cache, populated once `login`/`signup`
/// succeeds. Used only to know which user to register in the session
/// registry and to route the gateway's own `logout`/disconnect cleanup;
/// it plays no role in authorizing subsequent messages, which each carry
/// and are checked against their own access token.
#[derive(Default, Clone)]
pub struct ConnectionIdentity {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
}

pub struct Dispatcher {
    pub state: Arc<AppState>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn dispatch(&self, identity: &mut ConnectionIdentity, message: ClientMessage) -> ServerMessage {
        if let Some((token, user_id)) = message.auth_fields() {
            if let Err(e) = self.verify_message_auth(token, user_id) {
                return e;
            }
        }
        match message {
            ClientMessage::Signup { username, password, name } => self.handle_signup(identity, username, password, name),
            ClientMessage::Login { username, password } => self.handle_login(identity, username, password),
            ClientMessage::RefreshToken { refresh_token } => self.handle_refresh(refresh_token),
            ClientMessage::Logout { user_id, .. } => self.handle_logout(identity, user_id),
            ClientMessage::AddContact { user_id, username, .. } => self.handle_add_contact(user_id, &username),
            ClientMessage::RemoveContact { user_id, username, .. } => self.handle_remove_contact(user_id, &username),
            ClientMessage::ListContacts { user_id, .. } => self.handle_list_contacts(user_id),
            ClientMessage::SetModelPreference { user_id, model, .. } => self.handle_set_model_preference(user_id, model),
            ClientMessage::FetchCallHistory { user_id, .. } => self.handle_fetch_call_history(user_id),
            ClientMessage::CallInvite { user_id, target, message, .. } => self.handle_call_invite(user_id, target, message),
            ClientMessage::CallAccept { user_id, target, message, .. } => {
                self.handle_call_accept_notice(user_id, target, message)
            }
            ClientMessage::CallReject { user_id, target, message, .. } => self.handle_call_reject(user_id, target, message),
            ClientMessage::CallEnd { user_id, target, message, .. } => self.handle_call_end(user_id, target, message),
            ClientMessage::Offer { user_id, target, other_user, sdp, .. } => {
                self.handle_offer(user_id, target, other_user, sdp).await
            }
            ClientMessage::Answer { user_id, target, sdp, .. } => self.handle_answer(user_id, target, sdp).await,
            ClientMessage::IceCandidate { user_id, target, candidate, .. } => {
                self.handle_ice_candidate(user_id, target, candidate).await
            }
            ClientMessage::VideoState { user_id, target, enabled, .. } => self.handle_video_state(user_id, target, enabled),
            ClientMessage::Heartbeat => ServerMessage::Heartbeat,
        }
    }

    /// Verifies `token` is a currently-valid access token whose subject
    /// is `user_id`. Every authenticated message goes through this
    /// before its handler runs.
    fn verify_message_auth(&self, token: &str, user_id: Uuid) -> Result<(), ServerMessage> {
        if token.is_empty() {
            return Err(ServerMessage::error(ErrorCode::MissingToken, "access token required"));
        }
        match auth::verify_access_token(token, &self.state.decoding_key) {
            Ok(claims) if claims.sub == user_id => Ok(()),
            Ok(_) => Err(ServerMessage::error(ErrorCode::InvalidUser, "token does not match user_id")),
            Err(TokenVerifyError::Expired) => Err(ServerMessage::error(ErrorCode::TokenExpired, "access token expired")),
            Err(TokenVerifyError::Invalid) => Err(ServerMessage::error(ErrorCode::InvalidToken, "invalid access token")),
        }
    }

    fn handle_signup(
        &self,
        identity: &mut ConnectionIdentity,
        username: String,
        password: String,
        name: String,
    ) -> ServerMessage {
        if username.is_empty() || password.is_empty() {
            return ServerMessage::error(ErrorCode::SignupMissingCredentials, "username and password are required");
        }
        if username.len() > auth::USERNAME_MAX || password.len() > auth::PASSWORD_MAX || name.len() > auth::NAME_PART_MAX * 2 + 1 {
            return ServerMessage::error(ErrorCode::FieldsTooLong, "one or more fields exceed the maximum length");
        }
        if !auth::validate_username(&username) {
            return ServerMessage::error(ErrorCode::InvalidUsername, "username may only contain letters, digits, and underscores");
        }
        if !auth::validate_display_name(&name) {
            return ServerMessage::error(ErrorCode::InvalidNameFormat, "name must be a first and last name");
        }
        if !auth::validate_password_complexity(&password) {
            return ServerMessage::error(ErrorCode::WeakPassword, "password does not meet complexity requirements");
        }
        let hash = match auth::hash_password(&password) {
            Ok(h) => h,
            Err(_) => return ServerMessage::error(ErrorCode::UnknownError, "failed to hash password"),
        };
        match self.state.users.create(&username, &hash, &name) {
            Ok(user) => self.issue_auth_success(identity, user.id, user.username),
            Err(_) => ServerMessage::error(ErrorCode::UsernameExists, "username already taken"),
        }
    }

    fn handle_login(&self, identity: &mut ConnectionIdentity, username: String, password: String) -> ServerMessage {
        if username.is_empty() || password.is_empty() {
            return ServerMessage::error(ErrorCode::AuthMissingCredentials, "username and password are required");
        }
        if username.len() > auth::USERNAME_MAX || password.len() > auth::PASSWORD_MAX {
            return ServerMessage::error(ErrorCode::CredentialsTooLong, "username or password too long");
        }
        let user = match self.state.users.find_by_username(&username) {
            Ok(Some(u)) => u,
            _ => return ServerMessage::error(ErrorCode::UserNotFound, "no such user"),
        };
        if !auth::verify_password(&password, &user.password_hash) {
            return ServerMessage::error(ErrorCode::IncorrectPassword, "incorrect password");
        }
        self.issue_auth_success(identity, user.id, user.username)
    }

    fn issue_auth_success(&self, identity: &mut ConnectionIdentity, user_id: Uuid, username: String) -> ServerMessage {
        let pair = match auth::issue_token_pair(
            user_id,
            &self.state.encoding_key,
            self.state.access_token_ttl_secs,
            self.state.refresh_token_ttl_secs,
            self.state.refresh_tokens.as_ref(),
        ) {
            Ok(p) => p,
            Err(_) => return ServerMessage::error(ErrorCode::UnknownError, "failed to issue tokens"),
        };
        identity.user_id = Some(user_id);
        identity.username = Some(username);
        ServerMessage::AuthSuccess { user_id, access_token: pair.access_token, refresh_token: pair.refresh_token }
    }

    fn handle_refresh(&self, refresh_token: String) -> ServerMessage {
        if refresh_token.is_empty() {
            return ServerMessage::error(ErrorCode::MissingRefreshToken, "refresh_token is required");
        }
        let access_token = match auth::refresh_access_token(
            &refresh_token,
            &self.state.decoding_key,
            &self.state.encoding_key,
            self.state.access_token_ttl_secs,
            self.state.refresh_tokens.as_ref(),
        ) {
            Ok(t) => t,
            Err(_) => return ServerMessage::error(ErrorCode::RefreshFailed, "refresh token invalid or expired"),
        };
        let claims = match auth::verify_access_token(&access_token, &self.state.decoding_key) {
            Ok(c) => c,
            Err(_) => return ServerMessage::error(ErrorCode::RefreshFailed, "failed to verify new token"),
        };
        ServerMessage::AuthSuccess { user_id: claims.sub, access_token, refresh_token }
    }

    fn handle_logout(&self, identity: &mut ConnectionIdentity, user_id: Uuid) -> ServerMessage {
        self.state.sessions.remove(user_id);
        if identity.user_id == Some(user_id) {
            identity.user_id = None;
            identity.username = None;
        }
        ServerMessage::Ack
    }

    fn handle_add_contact(&self, user_id: Uuid, username: &str) -> ServerMessage {
        match self.state.users.add_contact(user_id, username) {
            Ok(()) => ServerMessage::Ack,
            Err(_) => ServerMessage::error(ErrorCode::AddContactFailed, "no such user"),
        }
    }

    fn handle_remove_contact(&self, user_id: Uuid, username: &str) -> ServerMessage {
        match self.state.users.remove_contact(user_id, username) {
            Ok(()) => ServerMessage::Ack,
            Err(_) => ServerMessage::error(ErrorCode::UserNotFound, "no such user"),
        }
    }

    fn handle_list_contacts(&self, user_id: Uuid) -> ServerMessage {
        match self.state.users.list_contacts(user_id) {
            Ok(contacts) => {
                let contacts = contacts
                    .into_iter()
                    .map(|u| ContactInfo { user_id: u.id, online: self.state.sessions.is_online(u.id), username: u.username })
                    .collect();
                ServerMessage::ContactList { contacts }
            }
            Err(_) => ServerMessage::error(ErrorCode::FetchFailed, "failed to fetch contacts"),
        }
    }

    fn handle_set_model_preference(&self, user_id: Uuid, model: ModelPreference) -> ServerMessage {
        match self.state.sessions.get(user_id) {
            Some(session) => {
                session.set_model_preference(model);
                ServerMessage::Ack
            }
            None => ServerMessage::error(ErrorCode::NoActiveConnection, "no active connection"),
        }
    }

    fn handle_fetch_call_history(&self, user_id: Uuid) -> ServerMessage {
        let calls = match self.state.calls.history_for_user(user_id) {
            Ok(c) => c,
            Err(_) => return ServerMessage::error(ErrorCode::CallHistoryError, "failed to fetch call history"),
        };
        let entries = calls
            .into_iter()
            .filter_map(|call| {
                let peer_id = if call.caller_id == user_id { call.callee_id } else { call.caller_id };
                let peer = self.state.users.find_by_id(peer_id).ok().flatten()?;
                Some(CallHistoryEntry {
                    call_id: call.id,
                    peer_username: peer.username,
                    started_at: call.started_at.to_rfc3339(),
                    ended_at: call.ended_at.map(|t| t.to_rfc3339()),
                    duration_seconds: call.duration_seconds,
                    initiated_by_me: call.caller_id == user_id,
                })
            })
            .collect();
        ServerMessage::CallHistory { entries }
    }

    /// `target` must exist and be in `user_id`'s contact list. Both a
    /// missing user and a non-contact target are reported as the same
    /// `USER_NOT_FOUND`: from the caller's point of view neither is
    /// something they can call.
    fn resolve_peer(&self, user_id: Uuid, target: Uuid) -> Result<(), ServerMessage> {
        let exists = self.state.users.find_by_id(target).ok().flatten().is_some();
        if !exists || !self.state.users.is_contact(user_id, target).unwrap_or(false) {
            return Err(ServerMessage::error(ErrorCode::UserNotFound, "no such user"));
        }
        Ok(())
    }

    fn handle_call_invite(&self, user_id: Uuid, target: Uuid, message: Option<String>) -> ServerMessage {
        if let Err(e) = self.resolve_peer(user_id, target) {
            return e;
        }
        match self.state.sessions.get(target) {
            Some(session) => {
                session.send(ServerMessage::CallInvite { from: user_id, message });
                ServerMessage::Ack
            }
            None => ServerMessage::error(ErrorCode::TargetNotAvailable, "target is not connected"),
        }
    }

    /// Relays a UI-level "I'm accepting your invite" notice. The
    /// pending-call state machine and the persisted `Call` row aren't
    /// touched here; those transition on the real SDP offer/answer
    /// exchange that follows.
    fn handle_call_accept_notice(&self, user_id: Uuid, target: Uuid, message: Option<String>) -> ServerMessage {
        if let Err(e) = self.resolve_peer(user_id, target) {
            return e;
        }
        match self.state.sessions.get(target) {
            Some(session) => {
                session.send(ServerMessage::CallAccept { from: user_id, message });
                ServerMessage::Ack
            }
            None => ServerMessage::error(ErrorCode::TargetNotAvailable, "target is not connected"),
        }
    }

    fn handle_call_reject(&self, user_id: Uuid, target: Uuid, message: Option<String>) -> ServerMessage {
        if let Err(e) = self.resolve_peer(user_id, target) {
            return e;
        }
        let _ = self.state.pending_calls.reject(user_id, target);
        if let Some(session) = self.state.sessions.get(target) {
            session.send(ServerMessage::CallReject { from: user_id, message });
        }
        ServerMessage::Ack
    }

    fn handle_call_end(&self, user_id: Uuid, target: Uuid, message: Option<String>) -> ServerMessage {
        if let Err(e) = self.resolve_peer(user_id, target) {
            return e;
        }
        match self.state.pending_calls.end(user_id, target) {
            Ok(call_id) => {
                let _ = self.state.calls.finish(call_id);
                if let Some(session) = self.state.sessions.get(target) {
                    session.send(ServerMessage::CallEnd { from: user_id, message });
                }
                ServerMessage::Ack
            }
            Err(_) => ServerMessage::error(ErrorCode::TargetNotAvailable, "no active call with this contact"),
        }
    }

    /// `target == Peer(id)` runs the ordinary peer-to-peer signaling
    /// relay and drives the pending-call state machine: the first offer
    /// between a pair opens it. `target == Server` instead stands up a
    /// Media Terminus connection: the server itself negotiates an answer
    /// and terminates the call's media, rather than relaying the offer
    /// to anyone.
    async fn handle_offer(
        &self,
        user_id: Uuid,
        target: SignalingTarget,
        other_user: Option<Uuid>,
        sdp: String,
    ) -> ServerMessage {
        match target {
            SignalingTarget::Peer(peer_id) => {
                if let Err(e) = self.resolve_peer(user_id, peer_id) {
                    return e;
                }
                if self.state.pending_calls.start_offer(user_id, peer_id).is_err() {
                    return ServerMessage::error(ErrorCode::TargetNotConnected, "a call is already in progress with this contact");
                }
                match self.state.sessions.get(peer_id) {
                    Some(session) => {
                        session.send(ServerMessage::Offer { from: user_id, sdp });
                        ServerMessage::Ack
                    }
                    None => ServerMessage::error(ErrorCode::TargetNotAvailable, "target is not connected"),
                }
            }
            SignalingTarget::Server => self.handle_server_offer(user_id, other_user, sdp).await,
        }
    }

    async fn handle_server_offer(&self, user_id: Uuid, other_user: Option<Uuid>, sdp: String) -> ServerMessage {
        let Some(peer_id) = other_user else {
            return ServerMessage::error(ErrorCode::MissingFields, "other_user is required for a server-targeted offer");
        };
        if let Err(e) = self.resolve_peer(user_id, peer_id) {
            return e;
        }
        let Some(session) = self.state.sessions.get(user_id) else {
            return ServerMessage::error(ErrorCode::NoActiveConnection, "no active connection");
        };

        let pc = match media::build_peer_connection(self.state.ice_servers.clone()).await {
            Ok(pc) => pc,
            Err(_) => return ServerMessage::error(ErrorCode::UnknownError, "failed to create media connection"),
        };
        let answer_sdp = match media::accept_offer(&pc, &sdp).await {
            Ok(s) => s,
            Err(_) => return ServerMessage::error(ErrorCode::UnknownError, "failed to negotiate media connection"),
        };

        let calls_for_term = self.state.calls.clone();
        let pending_for_term = self.state.pending_calls.clone();
        media::wire_call_termination(
            pc.clone(),
            Arc::new(move || {
                if let Some(PendingCall::Active(call_id)) = pending_for_term.state(user_id, peer_id) {
                    let _ = calls_for_term.finish(call_id);
                }
            }),
        );

        let audio_worker = Arc::new(executors::AudioWorkerHandle::spawn((self.state.audio_recognizer_factory)(), 8));
        media::wire_inference_pipeline(
            pc.clone(),
            self.state.sessions.clone(),
            self.state.calls.clone(),
            self.state.pending_calls.clone(),
            user_id,
            peer_id,
            session.model_preference(),
            self.state.video_pool.clone(),
            audio_worker,
        );

        session.set_server_pc(pc);
        ServerMessage::Answer { from: user_id, sdp: answer_sdp }
    }

    /// `target == Peer(id)` relays the answer and, on the first answer
    /// for a pending offer, persists the `Call` row and advances the
    /// pending-call state to `Active`. `target == Server` is never a
    /// valid answer destination: the server produces its own answer
    /// synchronously in [`Self::handle_server_offer`].
    async fn handle_answer(&self, user_id: Uuid, target: SignalingTarget, sdp: String) -> ServerMessage {
        let peer_id = match target {
            SignalingTarget::Peer(id) => id,
            SignalingTarget::Server => {
                return ServerMessage::error(ErrorCode::NoActiveConnection, "answers are not valid against the server target");
            }
        };
        if let Err(e) = self.resolve_peer(user_id, peer_id) {
            return e;
        }

        let call_id = match self.state.pending_calls.state(peer_id, user_id) {
            Some(PendingCall::Offered) => {
                let id = match self.state.calls.start(peer_id, user_id) {
                    Ok(id) => id,
                    Err(_) => return ServerMessage::error(ErrorCode::CallHistoryError, "failed to persist call"),
                };
                if self.state.pending_calls.accept(peer_id, user_id, id).is_err() {
                    return ServerMessage::error(ErrorCode::TargetNotConnected, "no pending offer from this contact");
                }
                id
            }
            Some(PendingCall::Active(id)) => id,
            None => return ServerMessage::error(ErrorCode::TargetNotConnected, "no pending offer from this contact"),
        };
        let _ = call_id;

        match self.state.sessions.get(peer_id) {
            Some(session) => {
                session.send(ServerMessage::Answer { from: user_id, sdp });
                ServerMessage::Ack
            }
            None => ServerMessage::error(ErrorCode::CallerNotAvailable, "caller disconnected before the answer arrived"),
        }
    }

    async fn handle_ice_candidate(&self, user_id: Uuid, target: SignalingTarget, candidate: IceCandidateInfo) -> ServerMessage {
        match target {
            SignalingTarget::Peer(peer_id) => {
                if let Err(e) = self.resolve_peer(user_id, peer_id) {
                    return e;
                }
                match self.state.sessions.get(peer_id) {
                    Some(session) => {
                        session.send(ServerMessage::IceCandidate { from: user_id, candidate });
                        ServerMessage::Ack
                    }
                    None => ServerMessage::error(ErrorCode::NotConnected, "target is not connected"),
                }
            }
            SignalingTarget::Server => {
                let Some(session) = self.state.sessions.get(user_id) else {
                    return ServerMessage::error(ErrorCode::NoActiveConnection, "no active connection");
                };
                let Some(pc) = session.server_pc() else {
                    return ServerMessage::error(ErrorCode::NoActiveConnection, "no server connection established yet");
                };
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: None,
                };
                match pc.add_ice_candidate(init).await {
                    Ok(()) => ServerMessage::Ack,
                    Err(_) => ServerMessage::error(ErrorCode::UnknownError, "failed to add ice candidate"),
                }
            }
        }
    }

    fn handle_video_state(&self, user_id: Uuid, target: Uuid, enabled: bool) -> ServerMessage {
        if let Err(e) = self.resolve_peer(user_id, target) {
            return e;
        }
        match self.state.sessions.get(target) {
            Some(session) => {
                session.send(ServerMessage::VideoState { from: user_id, enabled });
                ServerMessage::Ack
            }
            None => ServerMessage::error(ErrorCode::TargetNotAvailable, "target is not connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{InMemoryCallRepository, InMemoryRefreshTokenRepository, InMemoryUserRepository};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tokio::sync::mpsc;

    fn test_dispatcher() -> Dispatcher {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let priv_pem = private.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let pub_pem = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let state = Arc::new(AppState {
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
        Dispatcher::new(state)
    }

    async fn login(dispatcher: &Dispatcher, username: &str, password: &str) -> (ConnectionIdentity, String) {
        let mut identity = ConnectionIdentity::default();
        let reply = dispatcher
            .dispatch(
                &mut identity,
                ClientMessage::Signup { username: username.to_string(), password: password.to_string(), name: "Test User".to_string() },
            )
            .await;
        let access_token = match reply {
            ServerMessage::AuthSuccess { access_token, .. } => access_token,
            other => panic!("signup failed: {other:?}"),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.state.sessions.register(identity.user_id.unwrap(), username.to_string(), tx);
        (identity, access_token)
    }

    #[tokio::test]
    async fn unauthenticated_message_is_rejected() {
        let dispatcher = test_dispatcher();
        let mut identity = ConnectionIdentity::default();
        let reply = dispatcher
            .dispatch(&mut identity, ClientMessage::ListContacts { access_token: String::new(), user_id: Uuid::new_v4() })
            .await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::MissingToken, .. }));
    }

    #[tokio::test]
    async fn forged_user_id_on_a_valid_token_is_rejected() {
        let dispatcher = test_dispatcher();
        let (mut identity, token) = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let reply = dispatcher.dispatch(&mut identity, ClientMessage::ListContacts { access_token: token, user_id: Uuid::new_v4() }).await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::InvalidUser, .. }));
    }

    #[tokio::test]
    async fn signup_then_list_contacts_empty() {
        let dispatcher = test_dispatcher();
        let (mut identity, token) = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let user_id = identity.user_id.unwrap();
        let reply = dispatcher.dispatch(&mut identity, ClientMessage::ListContacts { access_token: token, user_id }).await;
        match reply {
            ServerMessage::ContactList { contacts } => assert!(contacts.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_signup_rejected() {
        let dispatcher = test_dispatcher();
        let _ = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let mut identity2 = ConnectionIdentity::default();
        let reply = dispatcher
            .dispatch(
                &mut identity2,
                ClientMessage::Signup { username: "alice".to_string(), password: "Other1!Pass".to_string(), name: "Alice Other".to_string() },
            )
            .await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::UsernameExists, .. }));
    }

    #[tokio::test]
    async fn weak_password_is_rejected_at_signup() {
        let dispatcher = test_dispatcher();
        let mut identity = ConnectionIdentity::default();
        let reply = dispatcher
            .dispatch(
                &mut identity,
                ClientMessage::Signup { username: "carol".to_string(), password: "weak".to_string(), name: "Carol Jones".to_string() },
            )
            .await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::WeakPassword, .. }));
    }

    #[tokio::test]
    async fn malformed_display_name_is_rejected_at_signup() {
        let dispatcher = test_dispatcher();
        let mut identity = ConnectionIdentity::default();
        let reply = dispatcher
            .dispatch(
                &mut identity,
                ClientMessage::Signup { username: "carol".to_string(), password: "Str0ng!Pass".to_string(), name: "Carol".to_string() },
            )
            .await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::InvalidNameFormat, .. }));
    }

    #[tokio::test]
    async fn call_invite_requires_contact() {
        let dispatcher = test_dispatcher();
        let (mut alice, alice_token) = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let (bob, _bob_token) = login(&dispatcher, "bob", "Str0ng!Pass").await;
        let alice_id = alice.user_id.unwrap();
        let bob_id = bob.user_id.unwrap();
        let reply = dispatcher
            .dispatch(&mut alice, ClientMessage::CallInvite { access_token: alice_token, user_id: alice_id, target: bob_id, message: None })
            .await;
        assert!(matches!(reply, ServerMessage::Error { error_code: ErrorCode::UserNotFound, .. }));
    }

    #[tokio::test]
    async fn full_call_flow_creates_exactly_one_call_row() {
        let dispatcher = test_dispatcher();
        let (mut alice, alice_token) = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let (mut bob, bob_token) = login(&dispatcher, "bob", "Str0ng!Pass").await;
        let alice_id = alice.user_id.unwrap();
        let bob_id = bob.user_id.unwrap();

        dispatcher
            .dispatch(&mut alice, ClientMessage::AddContact { access_token: alice_token.clone(), user_id: alice_id, username: "bob".to_string() })
            .await;
        dispatcher
            .dispatch(&mut bob, ClientMessage::AddContact { access_token: bob_token.clone(), user_id: bob_id, username: "alice".to_string() })
            .await;

        let offer = dispatcher
            .dispatch(
                &mut alice,
                ClientMessage::Offer {
                    access_token: alice_token.clone(),
                    user_id: alice_id,
                    target: SignalingTarget::Peer(bob_id),
                    other_user: None,
                    sdp: "v=0 offer".to_string(),
                },
            )
            .await;
        assert!(matches!(offer, ServerMessage::Ack));

        let answer = dispatcher
            .dispatch(
                &mut bob,
                ClientMessage::Answer {
                    access_token: bob_token.clone(),
                    user_id: bob_id,
                    target: SignalingTarget::Peer(alice_id),
                    sdp: "v=0 answer".to_string(),
                },
            )
            .await;
        assert!(matches!(answer, ServerMessage::Ack));

        let history = dispatcher
            .dispatch(&mut alice, ClientMessage::FetchCallHistory { access_token: alice_token.clone(), user_id: alice_id })
            .await;
        match history {
            ServerMessage::CallHistory { entries } => assert_eq!(entries.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }

        let second_offer = dispatcher
            .dispatch(
                &mut alice,
                ClientMessage::Offer {
                    access_token: alice_token.clone(),
                    user_id: alice_id,
                    target: SignalingTarget::Peer(bob_id),
                    other_user: None,
                    sdp: "v=0".to_string(),
                },
            )
            .await;
        assert!(matches!(second_offer, ServerMessage::Error { error_code: ErrorCode::TargetNotConnected, .. }));

        let end = dispatcher
            .dispatch(&mut alice, ClientMessage::CallEnd { access_token: alice_token.clone(), user_id: alice_id, target: bob_id, message: None })
            .await;
        assert!(matches!(end, ServerMessage::Ack));

        let third_offer = dispatcher
            .dispatch(
                &mut alice,
                ClientMessage::Offer {
                    access_token: alice_token,
                    user_id: alice_id,
                    target: SignalingTarget::Peer(bob_id),
                    other_user: None,
                    sdp: "v=0".to_string(),
                },
            )
            .await;
        assert!(matches!(third_offer, ServerMessage::Ack));
    }

    #[tokio::test]
    async fn server_targeted_offer_creates_a_media_terminus_connection() {
        let dispatcher = test_dispatcher();
        let (mut alice, alice_token) = login(&dispatcher, "alice", "Str0ng!Pass").await;
        let (bob, _bob_token) = login(&dispatcher, "bob", "Str0ng!Pass").await;
        let alice_id = alice.user_id.unwrap();
        let bob_id = bob.user_id.unwrap();

        dispatcher
            .dispatch(&mut alice, ClientMessage::AddContact { access_token: alice_token.clone(), user_id: alice_id, username: "bob".to_string() })
            .await;

        let offerer = media::build_peer_connection(vec![]).await.unwrap();
        offerer.add_transceiver_from_kind(webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video, None).await.unwrap();
        let offer = offerer.create_offer(None).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();

        let reply = dispatcher
            .dispatch(
                &mut alice,
                ClientMessage::Offer {
                    access_token: alice_token,
                    user_id: alice_id,
                    target: SignalingTarget::Server,
                    other_user: Some(bob_id),
                    sdp: offer.sdp,
                },
            )
            .await;
        match reply {
            ServerMessage::Answer { from, sdp } => {
                assert_eq!(from, alice_id);
                assert!(!sdp.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(dispatcher.state.sessions.get(alice_id).unwrap().server_pc().is_some());
    }
}
