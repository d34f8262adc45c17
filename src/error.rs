//! Error types for VaultChain

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Encryption error: {0}")]
    EncryptionError(String),
    /// Deliberately carries no detail: a wrong key and a corrupted envelope look the same.
    #[error("Decryption failed")]
    DecryptionError,
    #[error("Signature error: {0}")]
    SignatureError(String),
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("Insufficient gas funds: {0}")]
    InsufficientGasFunds(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid chain: {0}")]
    InvalidChain(String),
    #[error("No validators available: no identity holds the minimum stake")]
    NoValidatorsAvailable,
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Bincode error: {0}")]
    BincodeError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
