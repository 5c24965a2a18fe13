//! Narrow repository traits for the three persisted entities plus the
//! in-memory implementations used until a real database-backed
//! implementation is wired up. Keeping the interfaces narrow is what lets
//! the dispatcher and handlers stay storage-agnostic.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub jti: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub replaced_by: Option<Uuid>,
}

/// Which pipeline produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    Lip,
    Vosk,
}

#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub t: DateTime<Utc>,
    pub speaker_id: Uuid,
    pub text: String,
    pub source: TranscriptSource,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub id: Uuid,
    pub caller_id: Uuid,
    pub callee_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub transcripts: Vec<TranscriptLine>,
}

pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

pub trait UserRepository: Send + Sync {
    fn create(&self, username: &str, password_hash: &str, display_name: &str) -> Result<User>;
    fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;
    fn add_contact(&self, user_id: Uuid, contact_username: &str) -> Result<()>;
    fn remove_contact(&self, user_id: Uuid, contact_username: &str) -> Result<()>;
    fn list_contacts(&self, user_id: Uuid) -> Result<Vec<User>>;
    fn is_contact(&self, user_id: Uuid, other_id: Uuid) -> Result<bool>;
}

pub trait RefreshTokenRepository: Send + Sync {
    fn insert(&self, record: RefreshTokenRecord) -> Result<()>;
    fn find_valid(&self, jti: Uuid, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;
    /// Atomically marks `jti` revoked and links it to its successor. Used
    /// when a new refresh token is issued at login/signup so a previously
    /// valid refresh token for that user stops working.
    fn rotate(&self, jti: Uuid, replaced_by: Uuid) -> Result<()>;
    fn revoke(&self, jti: Uuid) -> Result<()>;
    /// Revokes every currently-valid refresh token belonging to `user_id`,
    /// linking each to `replaced_by`. Called when a fresh pair is issued
    /// at login/signup so only the newest refresh token remains usable.
    fn revoke_all_for_user(&self, user_id: Uuid, replaced_by: Uuid) -> Result<()>;
}

pub trait CallRepository: Send + Sync {
    fn start(&self, caller_id: Uuid, callee_id: Uuid) -> Result<Uuid>;
    fn append_line(&self, call_id: Uuid, speaker_id: Uuid, text: &str, source: TranscriptSource) -> Result<()>;
    fn finish(&self, call_id: Uuid) -> Result<()>;
    fn transcript(&self, call_id: Uuid) -> Result<Option<Call>>;
    fn history_for_user(&self, user_id: Uuid) -> Result<Vec<Call>>;
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    users_by_id: RwLock<HashMap<Uuid, User>>,
    contacts: RwLock<HashMap<Uuid, Vec<Uuid>>>,
}

impl UserRepository for InMemoryUserRepository {
    fn create(&self, username: &str, password_hash: &str, display_name: &str) -> Result<User> {
        let mut users = self.users_by_id.write().unwrap();
        if users.values().any(|u| u.username == username) {
            anyhow::bail!("username already exists");
        }
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            display_name: display_name.to_string(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users_by_id.read().unwrap().values().find(|u| u.username == username).cloned())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users_by_id.read().unwrap().get(&id).cloned())
    }

    fn add_contact(&self, user_id: Uuid, contact_username: &str) -> Result<()> {
        let contact = self
            .find_by_username(contact_username)?
            .ok_or_else(|| anyhow::anyhow!("user not found"))?;
        let mut contacts = self.contacts.write().unwrap();
        let entry = contacts.entry(user_id).or_default();
        if !entry.contains(&contact.id) {
            entry.push(contact.id);
        }
        Ok(())
    }

    fn remove_contact(&self, user_id: Uuid, contact_username: &str) -> Result<()> {
        let contact = self
            .find_by_username(contact_username)?
            .ok_or_else(|| anyhow::anyhow!("user not found"))?;
        if let Some(entry) = self.contacts.write().unwrap().get_mut(&user_id) {
            entry.retain(|id| *id != contact.id);
        }
        Ok(())
    }

    fn list_contacts(&self, user_id: Uuid) -> Result<Vec<User>> {
        let ids = self.contacts.read().unwrap().get(&user_id).cloned().unwrap_or_default();
        let users = self.users_by_id.read().unwrap();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    fn is_contact(&self, user_id: Uuid, other_id: Uuid) -> Result<bool> {
        Ok(self.contacts.read().unwrap().get(&user_id).is_some_and(|c| c.contains(&other_id)))
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenRepository {
    tokens: RwLock<HashMap<Uuid, RefreshTokenRecord>>,
}

impl RefreshTokenRepository for InMemoryRefreshTokenRepository {
    fn insert(&self, record: RefreshTokenRecord) -> Result<()> {
        self.tokens.write().unwrap().insert(record.jti, record);
        Ok(())
    }

    fn find_valid(&self, jti: Uuid, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let tokens = self.tokens.read().unwrap();
        Ok(tokens.get(&jti).filter(|r| !r.revoked && r.token_hash == token_hash).cloned())
    }

    fn rotate(&self, jti: Uuid, replaced_by: Uuid) -> Result<()> {
        let mut tokens = self.tokens.write().unwrap();
        let record = tokens.get_mut(&jti).ok_or_else(|| anyhow::anyhow!("refresh token not found"))?;
        if record.revoked {
            anyhow::bail!("refresh token already revoked");
        }
        record.revoked = true;
        record.replaced_by = Some(replaced_by);
        Ok(())
    }

    fn revoke(&self, jti: Uuid) -> Result<()> {
        if let Some(record) = self.tokens.write().unwrap().get_mut(&jti) {
            record.revoked = true;
        }
        Ok(())
    }

    fn revoke_all_for_user(&self, user_id: Uuid, replaced_by: Uuid) -> Result<()> {
        for record in self.tokens.write().unwrap().values_mut() {
            if record.user_id == user_id && !record.revoked {
                record.revoked = true;
                record.replaced_by = Some(replaced_by);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCallRepository {
    calls: RwLock<HashMap<Uuid, Call>>,
}

impl CallRepository for InMemoryCallRepository {
    fn start(&self, caller_id: Uuid, callee_id: Uuid) -> Result<Uuid> {
        let call = Call {
            id: Uuid::new_v4(),
            caller_id,
            callee_id,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
            transcripts: Vec::new(),
        };
        let id = call.id;
        self.calls.write().unwrap().insert(id, call);
        Ok(id)
    }

    fn append_line(&self, call_id: Uuid, speaker_id: Uuid, text: &str, source: TranscriptSource) -> Result<()> {
        let mut calls = self.calls.write().unwrap();
        let call = calls.get_mut(&call_id).ok_or_else(|| anyhow::anyhow!("call not found"))?;
        call.transcripts.push(TranscriptLine { t: Utc::now(), speaker_id, text: text.to_string(), source });
        Ok(())
    }

    fn finish(&self, call_id: Uuid) -> Result<()> {
        let mut calls = self.calls.write().unwrap();
        let call = calls.get_mut(&call_id).ok_or_else(|| anyhow::anyhow!("call not found"))?;
        if call.ended_at.is_some() {
            return Ok(());
        }
        let ended_at = Utc::now();
        call.duration_seconds = Some((ended_at - call.started_at).num_seconds().max(0));
        call.ended_at = Some(ended_at);
        Ok(())
    }

    fn transcript(&self, call_id: Uuid) -> Result<Option<Call>> {
        Ok(self.calls.read().unwrap().get(&call_id).cloned())
    }

    fn history_for_user(&self, user_id: Uuid) -> Result<Vec<Call>> {
        let calls = self.calls.read().unwrap();
        let mut result: Vec<Call> =
            calls.values().filter(|c| c.caller_id == user_id || c.callee_id == user_id).cloned().collect();
        result.sort_by_key(|c| c.started_at);
        Ok(result)
    }
}
