/// Validation logic for transactions separated from type definitions
use crate::crypto::{self, envelope};
use crate::error::ChainError;
use crate::transaction::types::{Transaction, MAX_TRANSACTION_SIZE};
use secp256k1::SecretKey;
use serde_json::Value;

impl Transaction {
    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Stateless checks that do not need the recipient's key.
    pub fn validate(&self) -> Result<(), ChainError> {
        self.validate_size()?;

        if self.signature.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Transaction not signed".to_string(),
            ));
        }
        crypto::public_key_from_hex(&self.sender)
            .map_err(|e| ChainError::InvalidTransaction(format!("Bad sender key: {}", e)))?;
        crypto::public_key_from_hex(&self.recipient)
            .map_err(|e| ChainError::InvalidTransaction(format!("Bad recipient key: {}", e)))?;
        Ok(())
    }

    /// Checks the signature against the exact bytes recovered from the envelope.
    pub fn verify_authorship(&self, plaintext: &[u8]) -> Result<(), ChainError> {
        let sender = crypto::public_key_from_hex(&self.sender)?;
        if crypto::verify(plaintext, &self.signature, &sender) {
            Ok(())
        } else {
            Err(ChainError::SignatureError(format!(
                "Signature on transaction {} does not match its plaintext",
                self.process_id
            )))
        }
    }

    /// Opens the payload as the recipient and verifies the sender's signature
    /// before interpreting the plaintext.
    pub fn open_verified(&self, recipient_secret: &SecretKey) -> Result<Value, ChainError> {
        let plaintext = envelope::decrypt_bytes(&self.payload, recipient_secret)?;
        self.verify_authorship(&plaintext)?;
        envelope::interpret_plaintext(plaintext)
    }
}
