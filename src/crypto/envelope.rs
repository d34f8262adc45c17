//! ECIES-style payload envelopes.
//!
//! Layout of the decoded envelope:
//!
//! ```text
//! ephemeral public key (65, uncompressed) | nonce (16) | tag (16) | ciphertext
//! ```
//!
//! The whole thing travels base64-encoded. A fresh ephemeral key is generated
//! for every envelope, so compromising one message key reveals nothing about
//! any other message sent to the same recipient.

use super::SECP256K1_CONTEXT;
use crate::error::ChainError;
use aes_gcm::{
    aead::{consts::U16, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use secp256k1::{
    constants::UNCOMPRESSED_PUBLIC_KEY_SIZE, ecdh::SharedSecret, PublicKey, SecretKey,
};
use serde_json::Value;
use sha2::Sha256;

/// AES-256-GCM with a 128-bit nonce and a 128-bit tag.
type EnvelopeCipher = AesGcm<Aes256, U16>;

const HKDF_SALT: &[u8] = b"vaultchain-envelope-salt-v1";
const HKDF_INFO: &[u8] = b"vaultchain-envelope-aes256gcm";

pub const NONCE_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const HEADER_SIZE: usize = UNCOMPRESSED_PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE;

fn derive_key(shared: &SharedSecret) -> Option<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &shared.secret_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm).ok()?;
    Some(okm)
}

/// UTF-8 form of the caller's data: strings are sealed as-is, anything else as JSON.
fn plaintext_bytes(data: &Value) -> Result<Vec<u8>, ChainError> {
    match data {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        other => serde_json::to_vec(other).map_err(|e| {
            ChainError::EncryptionError(format!("Failed to serialize payload: {}", e))
        }),
    }
}

/// The exact byte string an envelope carries for `data`; signatures are made over this.
pub fn canonical_plaintext(data: &Value) -> Result<Vec<u8>, ChainError> {
    plaintext_bytes(data)
}

/// Seals `data` to `recipient`.
pub fn encrypt(data: &Value, recipient: &PublicKey) -> Result<String, ChainError> {
    let plaintext = plaintext_bytes(data)?;

    let ephemeral_secret = SecretKey::new(&mut OsRng);
    let ephemeral_public = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &ephemeral_secret);

    let shared = SharedSecret::new(recipient, &ephemeral_secret);
    let key = derive_key(&shared)
        .ok_or_else(|| ChainError::EncryptionError("Key derivation failed".to_string()))?;

    let cipher = EnvelopeCipher::new_from_slice(&key)
        .map_err(|e| ChainError::EncryptionError(format!("Cipher initialization failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::<U16>::from_slice(&nonce_bytes);

    let mut buffer = plaintext;
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|_| ChainError::EncryptionError("AEAD encryption failed".to_string()))?;

    let mut envelope = Vec::with_capacity(HEADER_SIZE + buffer.len());
    envelope.extend_from_slice(&ephemeral_public.serialize_uncompressed());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(tag.as_slice());
    envelope.extend_from_slice(&buffer);

    Ok(STANDARD.encode(envelope))
}

/// Opens an envelope and returns the exact bytes that were sealed.
pub fn decrypt_bytes(
    envelope: &str,
    recipient_secret: &SecretKey,
) -> Result<Vec<u8>, ChainError> {
    open(envelope, recipient_secret).ok_or(ChainError::DecryptionError)
}

/// Interprets recovered plaintext: JSON comes back structured, anything else
/// as a JSON string holding the raw text.
pub fn interpret_plaintext(plaintext: Vec<u8>) -> Result<Value, ChainError> {
    let text = String::from_utf8(plaintext).map_err(|_| ChainError::DecryptionError)?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Opens an envelope with the recipient's secret key.
///
/// Every failure collapses into [`ChainError::DecryptionError`].
pub fn decrypt(envelope: &str, recipient_secret: &SecretKey) -> Result<Value, ChainError> {
    interpret_plaintext(decrypt_bytes(envelope, recipient_secret)?)
}

fn open(envelope: &str, recipient_secret: &SecretKey) -> Option<Vec<u8>> {
    let raw = STANDARD.decode(envelope.trim()).ok()?;
    if raw.len() < HEADER_SIZE {
        return None;
    }

    let (key_bytes, rest) = raw.split_at(UNCOMPRESSED_PUBLIC_KEY_SIZE);
    let (nonce_bytes, rest) = rest.split_at(NONCE_SIZE);
    let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);

    let ephemeral_public = PublicKey::from_slice(key_bytes).ok()?;
    let shared = SharedSecret::new(&ephemeral_public, recipient_secret);
    let key = derive_key(&shared)?;

    let cipher = EnvelopeCipher::new_from_slice(&key).ok()?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(nonce_bytes),
            b"",
            &mut buffer,
            Tag::from_slice(tag_bytes),
        )
        .ok()?;

    Some(buffer)
}
