use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::errors::ErrorCode;

/// First message sent by the client once the socket is open: its X25519
/// public key, base64-encoded. Sent in the clear, before a session key
/// exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_public_key: String,
}

/// Server's reply to [`ClientHello`]: its own public key plus the random
/// HKDF salt for this connection. Once both sides derive the session key,
/// every further frame is an [`crate::crypto::EncryptedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_public_key: String,
    pub salt: String,
}

/// A contact as returned by `list_contacts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub user_id: Uuid,
    pub username: String,
    pub online: bool,
}

/// One row of call history, enriched with the peer's display name at read
/// time rather than stored denormalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallHistoryEntry {
    pub call_id: Uuid,
    pub peer_username: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub initiated_by_me: bool,
}

/// Which model(s) should run against this connection's media. `Lip` runs
/// the lip-reading pipeline only, `Vosk` the speech pipeline only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelPreference {
    Lip,
    Vosk,
}

impl Default for ModelPreference {
    fn default() -> Self {
        ModelPreference::Lip
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    LipReading,
    Speech,
}

/// Login/signup credentials. Password is redacted in Debug output so it
/// never ends up in a log line by accident.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Target of an offer/answer/ice_candidate signaling message: either a
/// peer's user id, or the literal `"server"`, meaning the Media Terminus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingTarget {
    Peer(Uuid),
    Server,
}

impl Serialize for SignalingTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SignalingTarget::Peer(id) => id.to_string().serialize(serializer),
            SignalingTarget::Server => "server".serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SignalingTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "server" {
            Ok(SignalingTarget::Server)
        } else {
            Uuid::parse_str(&raw).map(SignalingTarget::Peer).map_err(D::Error::custom)
        }
    }
}

/// A trickle ICE candidate, matching the shape a browser's
/// `RTCPeerConnection.onicecandidate` emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateInfo {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Messages sent by the client inside the encrypted channel. Every
/// variant other than `Signup`, `Login`, `RefreshToken`, and `Heartbeat`
/// must carry a valid access token whose subject matches `user_id`; the
/// dispatcher verifies this before the handler ever sees the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Signup { username: String, password: String, name: String },
    Login { username: String, password: String },
    RefreshToken { refresh_token: String },
    Logout { access_token: String, user_id: Uuid },
    AddContact { access_token: String, user_id: Uuid, username: String },
    RemoveContact { access_token: String, user_id: Uuid, username: String },
    ListContacts { access_token: String, user_id: Uuid },
    SetModelPreference { access_token: String, user_id: Uuid, model: ModelPreference },
    FetchCallHistory { access_token: String, user_id: Uuid },
    CallInvite { access_token: String, user_id: Uuid, target: Uuid, message: Option<String> },
    CallAccept { access_token: String, user_id: Uuid, target: Uuid, message: Option<String> },
    CallReject { access_token: String, user_id: Uuid, target: Uuid, message: Option<String> },
    CallEnd { access_token: String, user_id: Uuid, target: Uuid, message: Option<String> },
    Offer { access_token: String, user_id: Uuid, target: SignalingTarget, other_user: Option<Uuid>, sdp: String },
    Answer { access_token: String, user_id: Uuid, target: SignalingTarget, sdp: String },
    IceCandidate { access_token: String, user_id: Uuid, target: SignalingTarget, candidate: IceCandidateInfo },
    VideoState { access_token: String, user_id: Uuid, target: Uuid, enabled: bool },
    Heartbeat,
}

impl ClientMessage {
    /// Messages the dispatcher must allow before a valid access token has
    /// been presented on this connection.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            ClientMessage::Signup { .. }
                | ClientMessage::Login { .. }
                | ClientMessage::RefreshToken { .. }
                | ClientMessage::Heartbeat
        )
    }

    /// The `(access_token, user_id)` pair carried on an authenticated
    /// message, if this variant carries one.
    pub fn auth_fields(&self) -> Option<(&str, Uuid)> {
        match self {
            ClientMessage::Logout { access_token, user_id }
            | ClientMessage::AddContact { access_token, user_id, .. }
            | ClientMessage::RemoveContact { access_token, user_id, .. }
            | ClientMessage::ListContacts { access_token, user_id }
            | ClientMessage::SetModelPreference { access_token, user_id, .. }
            | ClientMessage::FetchCallHistory { access_token, user_id }
            | ClientMessage::CallInvite { access_token, user_id, .. }
            | ClientMessage::CallAccept { access_token, user_id, .. }
            | ClientMessage::CallReject { access_token, user_id, .. }
            | ClientMessage::CallEnd { access_token, user_id, .. }
            | ClientMessage::Offer { access_token, user_id, .. }
            | ClientMessage::Answer { access_token, user_id, .. }
            | ClientMessage::IceCandidate { access_token, user_id, .. }
            | ClientMessage::VideoState { access_token, user_id, .. } => Some((access_token.as_str(), *user_id)),
            ClientMessage::Signup { .. } | ClientMessage::Login { .. } | ClientMessage::RefreshToken { .. } | ClientMessage::Heartbeat => None,
        }
    }
}

/// Messages sent by the server inside the encrypted channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess { user_id: Uuid, access_token: String, refresh_token: String },
    Ack,
    Error { error_code: ErrorCode, message: String },
    ContactList { contacts: Vec<ContactInfo> },
    CallHistory { entries: Vec<CallHistoryEntry> },
    CallInvite { from: Uuid, message: Option<String> },
    CallAccept { from: Uuid, message: Option<String> },
    CallReject { from: Uuid, message: Option<String> },
    CallEnd { from: Uuid, message: Option<String> },
    Offer { from: Uuid, sdp: String },
    Answer { from: Uuid, sdp: String },
    IceCandidate { from: Uuid, candidate: IceCandidateInfo },
    VideoState { from: Uuid, enabled: bool },
    PredictionResult { from: Uuid, kind: PredictionKind, text: String, is_final: bool },
    Heartbeat,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error { error_code: code, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tag_is_snake_case() {
        let msg = ClientMessage::CallInvite {
            access_token: "tok".into(),
            user_id: Uuid::nil(),
            target: Uuid::nil(),
            message: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "call_invite");
    }

    #[test]
    fn server_error_message_round_trips() {
        let msg = ServerMessage::error(ErrorCode::TargetNotAvailable, "target is offline");
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_str(&json).unwrap();
        match decoded {
            ServerMessage::Error { error_code, message } => {
                assert_eq!(error_code, ErrorCode::TargetNotAvailable);
                assert_eq!(message, "target is offline");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_has_no_extra_fields() {
        let json = serde_json::to_value(&ClientMessage::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "heartbeat" }));
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let raw = serde_json::json!({ "type": "not_a_real_message" });
        let result: Result<ClientMessage, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn login_signup_refresh_and_heartbeat_do_not_require_auth() {
        assert!(!ClientMessage::Login { username: "a".into(), password: "b".into() }.requires_auth());
        assert!(!ClientMessage::Signup { username: "a".into(), password: "b".into(), name: "A B".into() }.requires_auth());
        assert!(!ClientMessage::RefreshToken { refresh_token: "x".into() }.requires_auth());
        assert!(!ClientMessage::Heartbeat.requires_auth());
        assert!(ClientMessage::ListContacts { access_token: "t".into(), user_id: Uuid::nil() }.requires_auth());
    }

    #[test]
    fn auth_fields_extracted_from_authenticated_variants() {
        let user_id = Uuid::new_v4();
        let msg = ClientMessage::ListContacts { access_token: "tok".into(), user_id };
        assert_eq!(msg.auth_fields(), Some(("tok", user_id)));
        assert_eq!(ClientMessage::Heartbeat.auth_fields(), None);
    }

    #[test]
    fn credentials_password_redacted_in_debug() {
        let creds = Credentials { username: "admin".to_string(), password: "super_secret".to_string() };
        let debug_str = format!("{creds:?}");
        assert!(debug_str.contains("admin"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super_secret"));
    }

    #[test]
    fn signaling_target_round_trips_server_and_peer() {
        let peer = Uuid::new_v4();
        let target = SignalingTarget::Peer(peer);
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, format!("\"{peer}\""));
        let decoded: SignalingTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, target);

        let server_json = serde_json::to_string(&SignalingTarget::Server).unwrap();
        assert_eq!(server_json, "\"server\"");
        let decoded: SignalingTarget = serde_json::from_str(&server_json).unwrap();
        assert_eq!(decoded, SignalingTarget::Server);
    }
}
