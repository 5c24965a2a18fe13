//! X25519 key agreement and AES-256-GCM envelope encryption for the
//! per-connection secure channel established during the handshake.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"handshake data";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 in envelope field: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid public key length, expected 32 bytes")]
    BadPublicKey,
    #[error("AES-GCM encryption failed")]
    EncryptFailed,
    #[error("AES-GCM decryption failed, ciphertext may be tampered or key mismatched")]
    DecryptFailed,
    #[error("envelope payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Wire shape of an encrypted envelope: `{nonce, ciphertext, tag}`, each
/// base64-encoded. `aes-gcm` appends the tag to the ciphertext internally,
/// so `tag` here is a redundant split of the trailing 16 bytes kept for
/// compatibility with the original wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Derives the session key from the caller's ephemeral secret, the peer's
/// public key, and the handshake salt. `HKDF-SHA256` with the fixed info
/// string, salted with the 16 random bytes the server generated and sent
/// in `ServerHello`, 32-byte output, matching the source's
/// `derive_shared_key`.
pub fn derive_session_key(secret: EphemeralSecret, peer_public: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let peer_public: [u8; 32] = peer_public.try_into().map_err(|_| CryptoError::BadPublicKey)?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(HKDF_INFO, &mut out)
        .expect("32 is a valid HKDF-SHA256 output length");
    Ok(out)
}

/// Generates a fresh X25519 keypair for one end of the handshake.
pub fn generate_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Generates the 16-byte random salt the server sends alongside its
/// handshake public key.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypts `plaintext` under `key`, returning the base64-framed envelope.
/// A fresh random nonce is generated per call.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| CryptoError::EncryptFailed)?;
    let split_at = sealed.len().saturating_sub(16);
    let (ciphertext, tag) = sealed.split_at(split_at);
    Ok(EncryptedEnvelope {
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
        tag: BASE64.encode(tag),
    })
}

/// Decrypts an envelope produced by [`encrypt`], returning the plaintext
/// bytes. Rejoins `ciphertext || tag` before calling into `aes-gcm`, which
/// expects the tag appended rather than split out.
pub fn decrypt(key: &[u8; 32], envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = BASE64.decode(&envelope.nonce)?;
    let mut sealed = BASE64.decode(&envelope.ciphertext)?;
    sealed.extend_from_slice(&BASE64.decode(&envelope.tag)?);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypts a JSON-serializable value and wraps it for transport.
pub fn encrypt_json<T: Serialize>(key: &[u8; 32], value: &T) -> Result<EncryptedEnvelope, CryptoError> {
    let plaintext = serde_json::to_vec(value).expect("message types always serialize");
    encrypt(key, &plaintext)
}

/// Decrypts and deserializes a JSON value from an envelope.
pub fn decrypt_json<T: for<'de> Deserialize<'de>>(
    key: &[u8; 32],
    envelope: &EncryptedEnvelope,
) -> Result<T, CryptoError> {
    let plaintext = decrypt(key, envelope)?;
    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let envelope = encrypt(&key, b"hello lipcall").unwrap();
        let plain = decrypt(&key, &envelope).unwrap();
        assert_eq!(plain, b"hello lipcall");
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let key = [7u8; 32];
        let other = [9u8; 32];
        let envelope = encrypt(&key, b"secret").unwrap();
        assert!(decrypt(&other, &envelope).is_err());
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = [1u8; 32];
        let mut envelope = encrypt(&key, b"payload").unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = BASE64.encode(raw);
        assert!(decrypt(&key, &envelope).is_err());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let key = [3u8; 32];
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn handshake_key_agreement_matches_on_both_sides() {
        let (alice_secret, alice_public) = generate_keypair();
        let (bob_secret, bob_public) = generate_keypair();
        let salt = generate_salt();
        let alice_key = derive_session_key(alice_secret, bob_public.as_bytes(), &salt).unwrap();
        let bob_key = derive_session_key(bob_secret, alice_public.as_bytes(), &salt).unwrap();
        assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn derive_session_key_rejects_short_public_key() {
        let (secret, _) = generate_keypair();
        assert!(derive_session_key(secret, &[1, 2, 3], &generate_salt()).is_err());
    }

    #[test]
    fn different_salts_yield_different_keys() {
        let (alice_secret, _alice_public) = generate_keypair();
        let (_bob_secret, bob_public) = generate_keypair();
        let (alice_secret2, _) = generate_keypair();
        let salt_a = [1u8; 16];
        let salt_b = [2u8; 16];
        let key_a = derive_session_key(alice_secret, bob_public.as_bytes(), &salt_a).unwrap();
        let key_b = derive_session_key(alice_secret2, bob_public.as_bytes(), &salt_b).unwrap();
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn encrypt_json_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ping {
            n: u32,
        }
        let key = [5u8; 32];
        let envelope = encrypt_json(&key, &Ping { n: 42 }).unwrap();
        let decoded: Ping = decrypt_json(&key, &envelope).unwrap();
        assert_eq!(decoded, Ping { n: 42 });
    }
}
