//! Account directory: the single owner of every [`Identity`] in the process.
//!
//! Other components never see the underlying map. They look identities up by
//! exported public key or fingerprint, receive owned snapshots, and change
//! balances only through [`IdentityDirectory::credit`] and [`IdentityDirectory::debit`].

use crate::error::ChainError;
use crate::identity::Identity;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lookup and balance surface consumed by consensus, the chain manager and the gas meter.
pub trait IdentityDirectory: Send + Sync {
    fn find_by_public_key(&self, public_key: &str) -> Option<Identity>;
    fn find_by_fingerprint(&self, fingerprint: &str) -> Option<Identity>;
    fn balance(&self, fingerprint: &str, currency: &str) -> Result<Decimal, ChainError>;
    fn credit(
        &self,
        fingerprint: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Decimal, ChainError>;
    fn debit(
        &self,
        fingerprint: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Decimal, ChainError>;
    /// `(exported public key, balance)` for every identity, sorted by key.
    fn stake_holders(&self, currency: &str) -> Vec<(String, Decimal)>;
}

#[derive(Debug, Clone, Default)]
pub struct AccountDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    /// Identities keyed by fingerprint
    identities: HashMap<String, Identity>,
    /// Reverse index: exported public key -> fingerprint
    key_index: HashMap<String, String>,
}

impl AccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an identity. Duplicate fingerprints or public keys are rejected.
    pub fn register(&self, identity: Identity) -> Result<String, ChainError> {
        let mut inner = self.inner.write();
        let fingerprint = identity.fingerprint().to_string();
        let public_key = identity.export_public_key();

        if inner.identities.contains_key(&fingerprint) {
            return Err(ChainError::InvalidTransaction(format!(
                "Identity {} already registered",
                fingerprint
            )));
        }
        if inner.key_index.contains_key(&public_key) {
            return Err(ChainError::InvalidTransaction(
                "Public key already bound to another identity".to_string(),
            ));
        }

        inner.key_index.insert(public_key, fingerprint.clone());
        inner.identities.insert(fingerprint.clone(), identity);
        debug!(fingerprint = %fingerprint, "registered identity");
        Ok(fingerprint)
    }

    /// Creates, self-checks and registers a new identity.
    pub fn create_account(&self, name: &str, email: &str) -> Result<Identity, ChainError> {
        let identity = Identity::new(name, email)?;
        identity.self_check()?;
        self.register(identity.clone())?;
        Ok(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_identity_mut<R>(
        &self,
        fingerprint: &str,
        f: impl FnOnce(&mut Identity) -> Result<R, ChainError>,
    ) -> Result<R, ChainError> {
        let mut inner = self.inner.write();
        let identity = inner
            .identities
            .get_mut(fingerprint)
            .ok_or_else(|| ChainError::AccountNotFound(fingerprint.to_string()))?;
        f(identity)
    }
}

impl IdentityDirectory for AccountDirectory {
    fn find_by_public_key(&self, public_key: &str) -> Option<Identity> {
        let inner = self.inner.read();
        let fingerprint = inner.key_index.get(public_key.trim())?;
        inner.identities.get(fingerprint).cloned()
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Option<Identity> {
        self.inner.read().identities.get(fingerprint).cloned()
    }

    fn balance(&self, fingerprint: &str, currency: &str) -> Result<Decimal, ChainError> {
        self.inner
            .read()
            .identities
            .get(fingerprint)
            .map(|identity| identity.balance(currency))
            .ok_or_else(|| ChainError::AccountNotFound(fingerprint.to_string()))
    }

    fn credit(
        &self,
        fingerprint: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Decimal, ChainError> {
        self.with_identity_mut(fingerprint, |identity| identity.credit(currency, amount))
    }

    fn debit(
        &self,
        fingerprint: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Decimal, ChainError> {
        self.with_identity_mut(fingerprint, |identity| identity.debit(currency, amount))
    }

    fn stake_holders(&self, currency: &str) -> Vec<(String, Decimal)> {
        let inner = self.inner.read();
        let mut holders: Vec<(String, Decimal)> = inner
            .identities
            .values()
            .map(|identity| (identity.export_public_key(), identity.balance(currency)))
            .collect();
        holders.sort_by(|a, b| a.0.cmp(&b.0));
        holders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let directory = AccountDirectory::new();
        let alice = directory.create_account("alice", "alice@example.com").unwrap();

        let by_key = directory.find_by_public_key(&alice.export_public_key()).unwrap();
        assert_eq!(by_key.fingerprint(), alice.fingerprint());

        let by_fp = directory.find_by_fingerprint(alice.fingerprint()).unwrap();
        assert_eq!(by_fp.export_public_key(), alice.export_public_key());

        assert!(directory.find_by_public_key("02deadbeef").is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let directory = AccountDirectory::new();
        let alice = directory.create_account("alice", "alice@example.com").unwrap();
        assert!(directory.register(alice).is_err());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_balance_mutation_goes_through_directory() {
        let directory = AccountDirectory::new();
        let bob = directory.create_account("bob", "bob@example.com").unwrap();
        let fp = bob.fingerprint();

        directory.credit(fp, "STAKE", Decimal::new(100, 0)).unwrap();
        directory.debit(fp, "STAKE", Decimal::new(40, 0)).unwrap();
        assert_eq!(directory.balance(fp, "STAKE").unwrap(), Decimal::new(60, 0));

        assert!(matches!(
            directory.debit(fp, "STAKE", Decimal::new(61, 0)),
            Err(ChainError::InsufficientFunds(_))
        ));
        assert!(matches!(
            directory.credit("missing", "STAKE", Decimal::ONE),
            Err(ChainError::AccountNotFound(_))
        ));

        // Snapshots handed out earlier do not alias directory state.
        assert_eq!(bob.balance("STAKE"), Decimal::ZERO);
    }

    #[test]
    fn test_stake_holders_sorted() {
        let directory = AccountDirectory::new();
        for i in 0..4 {
            let id = directory
                .create_account(&format!("user{}", i), &format!("user{}@example.com", i))
                .unwrap();
            directory.credit(id.fingerprint(), "STAKE", Decimal::new(i, 0)).unwrap();
        }
        let holders = directory.stake_holders("STAKE");
        assert_eq!(holders.len(), 4);
        assert!(holders.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
