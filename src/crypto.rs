//! Cryptographic primitives for VaultChain
//!
//! Keys and signatures live here; payload sealing lives in [`envelope`].

pub mod envelope;

pub use envelope::{decrypt, encrypt};

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
pub(crate) static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Canonical exported form of the public key: hex of the compressed SEC1 point.
    pub fn public_key_hex(&self) -> String {
        public_key_to_hex(&self.public_key)
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs a message (which is first hashed using SHA-256) and returns the
    /// compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);

        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::SignatureError(format!("Failed to create message: {}", e)))?;

        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

pub fn public_key_to_hex(public_key: &PublicKey) -> String {
    hex::encode(public_key.serialize())
}

/// Parses an exported public key (hex of a compressed or uncompressed SEC1 point).
pub fn public_key_from_hex(hex_str: &str) -> Result<PublicKey, ChainError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex public key: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))
}

pub fn secret_key_from_hex(hex_str: &str) -> Result<SecretKey, ChainError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
    KeyPair::from_secret_bytes(&bytes).map(|kp| kp.secret_key)
}

/// Signs `message` with `secret_key` and returns the compact signature as hex.
pub fn sign(message: &[u8], secret_key: &SecretKey) -> Result<String, ChainError> {
    let signature = KeyPair::from_secret_key(*secret_key).sign(message)?;
    Ok(hex::encode(signature))
}

/// Boolean signature check: any malformed signature or mismatched key yields `false`.
pub fn verify(message: &[u8], signature_hex: &str, public_key: &PublicKey) -> bool {
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    verify_signature(&public_key.serialize(), message, &signature_bytes).is_ok()
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::SignatureError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::SignatureError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::SignatureError(format!("Invalid public key: {}", e)))?;

    let digest = Sha256::digest(message);

    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::SignatureError(format!("Failed to create message: {}", e)))?;

    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::SignatureError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::SignatureError("Signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_key.as_ref().len(), SECRET_KEY_SIZE);
        assert_eq!(keypair.public_key_hex().len(), PUBLIC_KEY_SIZE * 2);
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = KeyPair::generate().unwrap();
        let parsed = public_key_from_hex(&keypair.public_key_hex()).unwrap();
        assert_eq!(parsed, keypair.public_key);
        assert!(public_key_from_hex("zz").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Hello, VaultChain!";

        let signature = sign(message, &keypair.secret_key).unwrap();
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE * 2);
        assert!(verify(message, &signature, &keypair.public_key));
    }

    #[test]
    fn test_flipped_message_bit_fails() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Original message".to_vec();
        let signature = sign(&message, &keypair.secret_key).unwrap();

        for byte in 0..message.len() {
            let mut tampered = message.clone();
            tampered[byte] ^= 0x01;
            assert!(!verify(&tampered, &signature, &keypair.public_key));
        }
    }

    #[test]
    fn test_flipped_signature_bit_fails() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Test message";
        let signature = keypair.sign(message).unwrap();

        for byte in [0usize, 17, 31, 32, 63] {
            let mut tampered = signature;
            tampered[byte] ^= 0x80;
            assert!(!verify(message, &hex::encode(tampered), &keypair.public_key));
        }
    }

    #[test]
    fn test_wrong_key_and_malformed_input_return_false() {
        let keypair1 = KeyPair::generate().unwrap();
        let keypair2 = KeyPair::generate().unwrap();

        let message = b"Test message";
        let signature = sign(message, &keypair1.secret_key).unwrap();

        assert!(!verify(message, &signature, &keypair2.public_key));
        assert!(!verify(message, "not-hex", &keypair1.public_key));
        assert!(!verify(message, &signature[2..], &keypair1.public_key));
        assert!(!verify(message, "", &keypair1.public_key));
    }

    #[test]
    fn test_invalid_key_or_sig_length_check() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Test";
        let signature = keypair.sign(message).unwrap();
        let pubkey_bytes = keypair.public_key_bytes();

        let result = verify_signature(&pubkey_bytes[1..], message, &signature);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Public key must be exactly"));

        let result = verify_signature(&pubkey_bytes, message, &signature[1..]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Signature must be exactly"));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }
}
