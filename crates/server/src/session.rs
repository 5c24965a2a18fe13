//! Registry of connected users, keyed by user id rather than connection
//! id: at most one live session per user, matching a single active
//! connection per account.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lipcall_protocol::{ModelPreference, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;

pub struct Session {
    pub user_id: Uuid,
    pub username: String,
    outbox: mpsc::UnboundedSender<ServerMessage>,
    model_preference: RwLock<ModelPreference>,
    server_pc: RwLock<Option<Arc<RTCPeerConnection>>>,
}

impl Session {
    /// Pushes a message to this user's connection. Returns `false` if the
    /// connection has already gone away and the send could not be
    /// delivered.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    pub fn model_preference(&self) -> ModelPreference {
        *self.model_preference.read().unwrap()
    }

    pub fn set_model_preference(&self, preference: ModelPreference) {
        *self.model_preference.write().unwrap() = preference;
    }

    /// The peer connection this session holds open with the Media
    /// Terminus, if a `server`-targeted offer has been accepted.
    pub fn server_pc(&self) -> Option<Arc<RTCPeerConnection>> {
        self.server_pc.read().unwrap().clone()
    }

    pub fn set_server_pc(&self, pc: Arc<RTCPeerConnection>) {
        *self.server_pc.write().unwrap() = Some(pc);
    }

    /// Takes and clears the server peer connection, for closing it down
    /// on disconnect or call termination.
    pub fn take_server_pc(&self) -> Option<Arc<RTCPeerConnection>> {
        self.server_pc.write().unwrap().take()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly authenticated connection, replacing any prior
    /// session for the same user (a second login from elsewhere takes
    /// over; the old connection's outbox is simply dropped and its
    /// gateway task notices on its next send).
    pub fn register(&self, user_id: Uuid, username: String, outbox: mpsc::UnboundedSender<ServerMessage>) -> Arc<Session> {
        let session = Arc::new(Session {
            user_id,
            username,
            outbox,
            model_preference: RwLock::new(ModelPreference::default()),
            server_pc: RwLock::new(None),
        });
        self.sessions.write().unwrap().insert(user_id, session.clone());
        session
    }

    pub fn remove(&self, user_id: Uuid) {
        self.sessions.write().unwrap().remove(&user_id);
    }

    pub fn get(&self, user_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(&user_id).cloned()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.sessions.read().unwrap().contains_key(&user_id)
    }
}
