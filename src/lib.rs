//! VaultChain - a ledger engine with sealed transaction payloads
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the mempool and the chain manager
//! - [`transaction`] - Sealed transactions and their validation
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-work and stake-weighted proof-of-stake
//!
//! ## Cryptography & Identity
//! - [`crypto`] - Signatures (secp256k1) and envelope encryption
//! - [`identity`] - Key-holding identities with balances
//! - [`accounts`] - Directory owning every identity
//!
//! ## Resource Accounting
//! - [`gas`] - Gas metering and base price control
//!
//! ## Service & Storage
//! - [`node`] - Async service serializing access to the chain
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;

// ============================================================================
// Cryptography & Identity
// ============================================================================
pub mod accounts;
pub mod crypto;
pub mod identity;

// ============================================================================
// Resource Accounting
// ============================================================================
pub mod gas;

// ============================================================================
// Service & Storage
// ============================================================================
pub mod node;
pub mod persistence;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
