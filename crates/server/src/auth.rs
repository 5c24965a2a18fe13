use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repositories::{hash_token, RefreshTokenRecord, RefreshTokenRepository};

pub const USERNAME_MAX: usize = 32;
pub const PASSWORD_MAX: usize = 128;
pub const NAME_PART_MAX: usize = 32;
const PASSWORD_MIN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims shared by access and refresh tokens. `jti` is only
/// meaningful for refresh tokens, where it indexes the
/// [`RefreshTokenRecord`] row used for rotation and revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: u64,
    pub exp: u64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<Uuid>,
}

pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

fn now_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH).context("system clock error")?.as_secs())
}

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("failed to hash password")
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// `username` must be non-empty, printable ASCII plus underscore, and no
/// longer than [`USERNAME_MAX`].
pub fn validate_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= USERNAME_MAX
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `name` must be exactly two whitespace-separated Latin-letter tokens,
/// each no longer than [`NAME_PART_MAX`].
pub fn validate_display_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split_whitespace().collect();
    parts.len() == 2 && parts.iter().all(|p| !p.is_empty() && p.len() <= NAME_PART_MAX && p.chars().all(|c| c.is_ascii_alphabetic()))
}

/// `password` must be at least [`PASSWORD_MIN`] characters and mix a
/// lowercase letter, an uppercase letter, a digit, and a non-word
/// character.
pub fn validate_password_complexity(password: &str) -> bool {
    password.len() >= PASSWORD_MIN
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_alphanumeric())
}

/// Issues a fresh access/refresh token pair for `user_id`, revoking any
/// refresh token the user already holds and persisting the new one's
/// record so it can later be rotated or revoked in turn. Used at login
/// and signup, where a successful authentication should invalidate
/// whatever refresh token preceded it.
pub fn issue_token_pair(
    user_id: Uuid,
    encoding_key: &EncodingKey,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
    refresh_repo: &dyn RefreshTokenRepository,
) -> Result<TokenPair> {
    let now = now_secs()?;
    let access_claims = Claims { sub: user_id, iat: now, exp: now + access_ttl_secs, token_type: TokenType::Access, jti: None };
    let access_token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &access_claims, encoding_key)
        .context("failed to encode access token")?;

    let jti = Uuid::new_v4();
    let refresh_claims =
        Claims { sub: user_id, iat: now, exp: now + refresh_ttl_secs, token_type: TokenType::Refresh, jti: Some(jti) };
    let refresh_token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &refresh_claims, encoding_key)
        .context("failed to encode refresh token")?;

    refresh_repo.revoke_all_for_user(user_id, jti)?;
    refresh_repo.insert(RefreshTokenRecord {
        jti,
        user_id,
        token_hash: hash_token(&refresh_token),
        issued_at: chrono::Utc::now(),
        expires_at: chrono::Utc::now() + chrono::Duration::seconds(refresh_ttl_secs as i64),
        revoked: false,
        replaced_by: None,
    })?;

    Ok(TokenPair { access_token, refresh_token })
}

fn decode_claims(token: &str, decoding_key: &DecodingKey) -> Result<Claims> {
    let validation = Validation::new(Algorithm::RS256);
    let data: TokenData<Claims> =
        jsonwebtoken::decode(token, decoding_key, &validation).context("invalid or expired token")?;
    Ok(data.claims)
}

/// Why an access token was rejected, so the dispatcher can report
/// `TOKEN_EXPIRED` and `INVALID_TOKEN` as the distinct error codes the
/// catalog requires instead of collapsing both into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVerifyError {
    Expired,
    Invalid,
}

/// Verifies an access token, rejecting refresh tokens presented in its
/// place.
pub fn verify_access_token(token: &str, decoding_key: &DecodingKey) -> Result<Claims, TokenVerifyError> {
    let validation = Validation::new(Algorithm::RS256);
    let data: TokenData<Claims> = jsonwebtoken::decode(token, decoding_key, &validation).map_err(|e| {
        if *e.kind() == jsonwebtoken::errors::ErrorKind::ExpiredSignature {
            TokenVerifyError::Expired
        } else {
            TokenVerifyError::Invalid
        }
    })?;
    if data.claims.token_type != TokenType::Access {
        return Err(TokenVerifyError::Invalid);
    }
    Ok(data.claims)
}

/// Verifies a refresh token against its persisted record and issues only
/// a new access token. The presented refresh token is left untouched and
/// remains usable until its own `exp` — a plain access refresh is not a
/// rotation event.
pub fn refresh_access_token(
    refresh_token: &str,
    decoding_key: &DecodingKey,
    encoding_key: &EncodingKey,
    access_ttl_secs: u64,
    refresh_repo: &dyn RefreshTokenRepository,
) -> Result<String> {
    let claims = decode_claims(refresh_token, decoding_key)?;
    if claims.token_type != TokenType::Refresh {
        anyhow::bail!("expected a refresh token");
    }
    let jti = claims.jti.context("refresh token missing jti")?;
    let record = refresh_repo
        .find_valid(jti, &hash_token(refresh_token))?
        .context("refresh token not found, already used, or revoked")?;

    let now = now_secs()?;
    let access_claims =
        Claims { sub: record.user_id, iat: now, exp: now + access_ttl_secs, token_type: TokenType::Access, jti: None };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &access_claims, encoding_key).context("failed to encode access token")
}
