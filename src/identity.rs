//! Account identities: a key pair, a stable fingerprint and per-currency balances.

use crate::crypto::{self, envelope, KeyPair};
use crate::error::ChainError;
use rust_decimal::Decimal;
use secp256k1::{PublicKey, SecretKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
    /// Milliseconds since the Unix epoch at account creation.
    pub created_at: u64,
    fingerprint: String,
    keypair: KeyPair,
    balances: HashMap<String, Decimal>,
}

impl Identity {
    /// Creates a fresh identity with a newly generated key pair.
    pub fn new(name: &str, email: &str) -> Result<Self, ChainError> {
        let created_at = chrono::Utc::now().timestamp_millis() as u64;
        Ok(Self::with_keypair(name, email, created_at, KeyPair::generate()?))
    }

    pub fn with_keypair(name: &str, email: &str, created_at: u64, keypair: KeyPair) -> Self {
        Identity {
            name: name.to_string(),
            email: email.to_string(),
            created_at,
            fingerprint: Self::derive_fingerprint(name, email, created_at),
            keypair,
            balances: HashMap::new(),
        }
    }

    pub fn derive_fingerprint(name: &str, email: &str, created_at: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(email.as_bytes());
        hasher.update(created_at.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.keypair.secret_key
    }

    /// The externally visible address of this identity.
    pub fn export_public_key(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn sign(&self, data: &[u8]) -> Result<String, ChainError> {
        crypto::sign(data, &self.keypair.secret_key)
    }

    pub fn verify(&self, data: &[u8], signature_hex: &str) -> bool {
        crypto::verify(data, signature_hex, &self.keypair.public_key)
    }

    pub fn encrypt_to(&self, data: &Value, recipient: &PublicKey) -> Result<String, ChainError> {
        envelope::encrypt(data, recipient)
    }

    pub fn decrypt(&self, sealed: &str) -> Result<Value, ChainError> {
        envelope::decrypt(sealed, &self.keypair.secret_key)
    }

    /// Seals a sample to ourselves and opens it again; a mismatch means the
    /// key pair is corrupted.
    pub fn self_check(&self) -> Result<(), ChainError> {
        let sample = json!({ "self_check": self.fingerprint });
        let sealed = envelope::encrypt(&sample, self.public_key())
            .map_err(|e| ChainError::ConfigError(format!("key pair self-check failed: {}", e)))?;
        match envelope::decrypt(&sealed, self.secret_key()) {
            Ok(opened) if opened == sample => Ok(()),
            _ => Err(ChainError::ConfigError(format!(
                "key pair self-check failed for identity {}",
                self.fingerprint
            ))),
        }
    }

    pub fn balance(&self, currency: &str) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn balances(&self) -> &HashMap<String, Decimal> {
        &self.balances
    }

    pub fn credit(&mut self, currency: &str, amount: Decimal) -> Result<Decimal, ChainError> {
        if amount.is_sign_negative() {
            return Err(ChainError::InvalidTransaction(format!(
                "Credit amount cannot be negative: {}",
                amount
            )));
        }
        let entry = self.balances.entry(currency.to_string()).or_insert(Decimal::ZERO);
        *entry += amount;
        Ok(*entry)
    }

    pub fn debit(&mut self, currency: &str, amount: Decimal) -> Result<Decimal, ChainError> {
        if amount.is_sign_negative() {
            return Err(ChainError::InvalidTransaction(format!(
                "Debit amount cannot be negative: {}",
                amount
            )));
        }
        let current = self.balance(currency);
        let remaining = current - amount;
        if remaining < Decimal::ZERO {
            return Err(ChainError::InsufficientFunds(format!(
                "{} holds {} {} but {} was requested",
                self.fingerprint, current, currency, amount
            )));
        }
        self.balances.insert(currency.to_string(), remaining);
        Ok(remaining)
    }
}
