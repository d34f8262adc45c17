/// Transaction types for VaultChain
use crate::crypto::envelope;
use crate::error::ChainError;
use crate::identity::Identity;
use secp256k1::PublicKey;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// A sealed transaction.
///
/// `payload` is an envelope only the recipient can open. `signature` covers the
/// plaintext and was produced before sealing, so whoever opens the envelope
/// can check authorship against `sender`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub process_id: Uuid,
    pub description: String,
    /// Exported public key of the signer
    pub sender: String,
    /// Exported public key the payload is sealed to
    pub recipient: String,
    pub payload: String,
    pub timestamp: u64,
    pub signature: String,
    #[serde(default)]
    pub private: bool,
}

impl Transaction {
    /// Signs `data` as `sender`, then seals it to `recipient`.
    pub fn seal(
        sender: &Identity,
        recipient: &PublicKey,
        description: &str,
        data: &Value,
    ) -> Result<Self, ChainError> {
        let plaintext = envelope::canonical_plaintext(data)?;
        let signature = sender.sign(&plaintext)?;
        let payload = envelope::encrypt(data, recipient)?;

        Ok(Transaction {
            process_id: Uuid::new_v4(),
            description: description.to_string(),
            sender: sender.export_public_key(),
            recipient: crate::crypto::public_key_to_hex(recipient),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            signature,
            private: false,
        })
    }

    pub fn into_private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn involves(&self, address: &str) -> bool {
        self.sender == address || self.recipient == address
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.process_id.as_bytes());
        hasher.update(self.description.as_bytes());
        hasher.update(self.sender.as_bytes());
        hasher.update(self.recipient.as_bytes());
        hasher.update(self.payload.as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.signature.as_bytes());
        hasher.update([self.private as u8]);
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }
}
