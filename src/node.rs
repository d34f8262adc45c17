//! Async service wrapper around the chain manager.
//!
//! The [`ChainManager`] sits behind a single `tokio::sync::Mutex`, so block
//! creation and synchronization are serialized. Mining runs on the blocking
//! pool and holds the lock for the whole search. A sync request therefore
//! checks its candidate against a snapshot of the local length and genesis
//! first. Only a candidate that would be adopted cancels in-flight searches.

use crate::accounts::{AccountDirectory, IdentityDirectory};
use crate::blockchain::{Block, ChainManager, SyncOutcome};
use crate::config::Config;
use crate::consensus::{CancelToken, ConsensusEngine};
use crate::error::ChainError;
use crate::gas::{GasMeter, GasOperation};
use crate::identity::Identity;
use crate::persistence::{BlockStore, Database, InMemoryPersistence};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use secp256k1::SecretKey;
use serde_json::Value;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One block-producing request, as accepted by [`ChainService::submit`] and
/// [`ChainService::submit_metered`].
#[derive(Debug, Clone)]
pub enum BlockRequest {
    Data { payload: Value },
    Private { payload: Value },
    Transfer { payload: Value, recipient: String },
    WithRewards { payload: Value, reward: Decimal },
    Pending,
}

impl BlockRequest {
    pub fn gas_operation(&self) -> GasOperation {
        match self {
            BlockRequest::Data { .. } | BlockRequest::Pending => GasOperation::StorageWrite,
            BlockRequest::Private { .. } => GasOperation::PrivateBlock,
            BlockRequest::Transfer { .. } => GasOperation::Transfer,
            BlockRequest::WithRewards { .. } => GasOperation::BlockWithRewards,
        }
    }

    fn apply(
        self,
        chain: &mut ChainManager,
        signer: &str,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        match self {
            BlockRequest::Data { payload } => {
                chain.create_block_cancellable(&payload, signer, cancel)
            }
            BlockRequest::Private { payload } => {
                chain.create_private_block_cancellable(&payload, signer, cancel)
            }
            BlockRequest::Transfer { payload, recipient } => {
                chain.create_transfer_block_cancellable(&payload, signer, &recipient, cancel)
            }
            BlockRequest::WithRewards { payload, reward } => {
                chain.create_block_with_rewards_cancellable(&payload, signer, reward, cancel)
            }
            BlockRequest::Pending => chain.mine_pending_cancellable(signer, cancel),
        }
    }
}

#[derive(Clone)]
pub struct ChainService {
    config: Config,
    directory: Arc<AccountDirectory>,
    chain: Arc<tokio::sync::Mutex<ChainManager>>,
    gas: Arc<GasMeter>,
    in_flight: Arc<Mutex<Vec<CancelToken>>>,
    consensus: Arc<ConsensusEngine>,
    genesis: Block,
    /// Chain length as of the last append or replacement, readable while mining holds the lock.
    length: Arc<AtomicUsize>,
}

impl ChainService {
    /// Opens the configured SQLite database, falling back to in-memory storage
    /// if it cannot be opened.
    pub fn init(config: Config) -> Result<Self, ChainError> {
        config.validate()?;

        let db_path = std::path::Path::new(&config.database.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store: Arc<dyn BlockStore> = match Database::open(&config.database.path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    "Failed to open DB at {}: {}. Falling back to in-memory persistence.",
                    config.database.path, e
                );
                Arc::new(InMemoryPersistence::new())
            }
        };

        Self::with_store(config, Arc::new(AccountDirectory::new()), store)
    }

    pub fn with_store(
        config: Config,
        directory: Arc<AccountDirectory>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, ChainError> {
        let shared: Arc<dyn IdentityDirectory> = directory.clone();
        let chain = ChainManager::from_config(&config, shared.clone(), store)?;
        let gas = GasMeter::new(config.gas.clone(), shared);

        info!(
            algorithm = ?config.consensus.algorithm,
            length = chain.len(),
            head = %chain.head().hash,
            "chain service ready"
        );

        let consensus = chain.consensus().clone();
        let genesis = chain.blocks()[0].clone();
        let length = Arc::new(AtomicUsize::new(chain.len()));

        Ok(Self {
            config,
            directory,
            chain: Arc::new(tokio::sync::Mutex::new(chain)),
            gas: Arc::new(gas),
            in_flight: Arc::new(Mutex::new(Vec::new())),
            consensus,
            genesis,
            length,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &Arc<AccountDirectory> {
        &self.directory
    }

    pub fn gas(&self) -> &Arc<GasMeter> {
        &self.gas
    }

    pub fn create_account(&self, name: &str, email: &str) -> Result<Identity, ChainError> {
        self.directory.create_account(name, email)
    }

    pub fn is_mining(&self) -> bool {
        !self.in_flight.lock().is_empty()
    }

    /// Cancels every in-flight search; returns how many were signalled.
    pub fn cancel_mining(&self) -> usize {
        let tokens = self.in_flight.lock();
        tokens.iter().for_each(CancelToken::cancel);
        tokens.len()
    }

    pub async fn create_block(&self, payload: Value, signer: &str) -> Result<Block, ChainError> {
        self.submit(signer, BlockRequest::Data { payload }).await
    }

    pub async fn create_private_block(
        &self,
        payload: Value,
        owner: &str,
    ) -> Result<Block, ChainError> {
        self.submit(owner, BlockRequest::Private { payload }).await
    }

    pub async fn create_transfer_block(
        &self,
        payload: Value,
        sender: &str,
        recipient: &str,
    ) -> Result<Block, ChainError> {
        let request = BlockRequest::Transfer {
            payload,
            recipient: recipient.to_string(),
        };
        self.submit(sender, request).await
    }

    pub async fn create_block_with_rewards(
        &self,
        payload: Value,
        signer: &str,
        reward: Decimal,
    ) -> Result<Block, ChainError> {
        self.submit(signer, BlockRequest::WithRewards { payload, reward }).await
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), ChainError> {
        self.chain.lock().await.submit_transaction(tx)
    }

    pub async fn mine_pending(&self, signer: &str) -> Result<Block, ChainError> {
        self.submit(signer, BlockRequest::Pending).await
    }

    /// Runs `request` without gas accounting.
    pub async fn submit(&self, signer: &str, request: BlockRequest) -> Result<Block, ChainError> {
        let signer = signer.to_string();
        self.run_mining(move |chain, cancel| request.apply(chain, &signer, cancel))
            .await
    }

    /// Runs `request` under gas accounting, paid by `signer`.
    ///
    /// The gas debit and the append are separate steps: a crash after the block
    /// is persisted but before the debit leaves the block unpaid.
    pub async fn submit_metered(
        &self,
        signer: &str,
        request: BlockRequest,
        gas_limit: u64,
        priority_fee: Decimal,
    ) -> Result<Block, ChainError> {
        let payer = self
            .directory
            .find_by_public_key(signer)
            .ok_or_else(|| ChainError::AccountNotFound(signer.to_string()))?;
        let fingerprint = payer.fingerprint().to_string();
        let signer = signer.to_string();
        let gas = self.gas.clone();
        let operation = request.gas_operation();

        self.run_mining(move |chain, cancel| {
            gas.execute_transaction(&fingerprint, operation, gas_limit, priority_fee, || {
                request.apply(chain, &signer, cancel)
            })
        })
        .await
    }

    async fn run_mining<F>(&self, job: F) -> Result<Block, ChainError>
    where
        F: FnOnce(&mut ChainManager, &CancelToken) -> Result<Block, ChainError> + Send + 'static,
    {
        let token = CancelToken::new();
        self.in_flight.lock().push(token.clone());

        let chain = self.chain.clone();
        let in_flight = self.in_flight.clone();
        let gas = self.gas.clone();
        let length = self.length.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = chain.blocking_lock();
            let result = job(&mut guard, &token);
            length.store(guard.len(), Ordering::Release);
            in_flight.lock().retain(|t| !t.same_as(&token));
            if result.is_ok() {
                gas.adjust_base_price(&*guard);
            }
            result
        })
        .await
        .map_err(io::Error::from)?;

        result
    }

    /// Offers `candidate` to the chain manager.
    ///
    /// A candidate that is not strictly longer, has another genesis or fails
    /// validation is rejected here without waiting for the lock, and running
    /// searches continue. Otherwise in-flight mining is cancelled and the chain
    /// manager re-checks the candidate under the lock before adopting it.
    pub async fn synchronize_chain(
        &self,
        candidate: Vec<Block>,
    ) -> Result<SyncOutcome, ChainError> {
        let local = self.length.load(Ordering::Acquire);
        let consensus = self.consensus.clone();
        let genesis = self.genesis.clone();
        let (candidate, rejection) = tokio::task::spawn_blocking(move || {
            let rejection = ChainManager::assess_candidate(&consensus, &genesis, local, &candidate);
            (candidate, rejection)
        })
        .await
        .map_err(io::Error::from)?;

        if let Some(rejection) = rejection {
            return Ok(SyncOutcome::Rejected(rejection));
        }

        let preempted = self.cancel_mining();
        if preempted > 0 {
            info!(preempted, "cancelled in-flight mining for chain sync");
        }

        let length = self.length.clone();
        let mut guard = self.chain.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let outcome = guard.synchronize_chain(candidate);
            length.store(guard.len(), Ordering::Release);
            outcome
        })
        .await
        .map_err(io::Error::from)?
    }

    pub async fn get_decrypted_block_data(
        &self,
        index: usize,
        secret_key: &SecretKey,
    ) -> Result<Vec<Result<Value, ChainError>>, ChainError> {
        self.chain.lock().await.get_decrypted_block_data(index, secret_key)
    }

    pub async fn get_account_blocks(&self, address: &str) -> Vec<Block> {
        self.chain.lock().await.get_account_blocks(address)
    }

    pub async fn snapshot(&self) -> Vec<Block> {
        self.chain.lock().await.blocks().to_vec()
    }

    pub async fn head(&self) -> Block {
        self.chain.lock().await.head().clone()
    }

    pub async fn len(&self) -> usize {
        self.chain.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::SyncRejection;
    use crate::config::ChainConfig;
    use crate::gas::GasOutcome;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn service_with_difficulty(difficulty: usize) -> ChainService {
        let mut config = Config::default();
        config.consensus.difficulty = difficulty;
        ChainService::with_store(
            config,
            Arc::new(AccountDirectory::new()),
            Arc::new(InMemoryPersistence::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        timeout(Duration::from_secs(30), async {
            let service = service_with_difficulty(1);
            let alice = service.create_account("alice", "alice@example.com").unwrap();

            let block = service
                .create_block(json!({"hello": "world"}), &alice.export_public_key())
                .await
                .unwrap();
            assert_eq!(block.index, 1);
            assert_eq!(service.len().await, 2);
            assert!(!service.is_mining());

            let data = service.get_decrypted_block_data(1, alice.secret_key()).await.unwrap();
            assert_eq!(data, vec![Ok(json!({"hello": "world"}))]);
            assert_eq!(service.get_account_blocks(&alice.export_public_key()).await.len(), 1);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_metered_block_charges_gas_and_moves_price() {
        timeout(Duration::from_secs(30), async {
            let service = service_with_difficulty(1);
            let alice = service.create_account("alice", "alice@example.com").unwrap();
            service
                .directory()
                .credit(alice.fingerprint(), "GAS", Decimal::ONE)
                .unwrap();
            let start_price = service.gas().base_price();

            service
                .submit_metered(
                    &alice.export_public_key(),
                    BlockRequest::Data { payload: json!({"n": 1}) },
                    20_000,
                    Decimal::ZERO,
                )
                .await
                .unwrap();

            // 20_000 * 0.000001
            assert_eq!(
                service.directory().balance(alice.fingerprint(), "GAS").unwrap(),
                Decimal::ONE - Decimal::new(2, 2)
            );
            // one transaction per block is below the 42_000 gas target
            assert_eq!(service.gas().base_price(), start_price * Decimal::new(875, 3));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_metered_block_without_gas_is_rejected() {
        timeout(Duration::from_secs(30), async {
            let service = service_with_difficulty(1);
            let alice = service.create_account("alice", "alice@example.com").unwrap();

            let result = service
                .submit_metered(
                    &alice.export_public_key(),
                    BlockRequest::Private { payload: json!({}) },
                    30_000,
                    Decimal::ZERO,
                )
                .await;
            assert!(matches!(result, Err(ChainError::InsufficientGasFunds(_))));
            assert_eq!(service.len().await, 1);
            assert!(service.gas().ledger().is_empty());
        })
        .await
        .unwrap();
    }

    /// A second manager over the service's directory, grown `extra` blocks past genesis.
    fn longer_candidate(service: &ChainService, signer: &Identity, extra: usize) -> Vec<Block> {
        let shared: Arc<dyn IdentityDirectory> = service.directory().clone();
        let consensus = Arc::new(ConsensusEngine::proof_of_work(1, shared.clone()));
        let mut other = ChainManager::bootstrap(
            consensus,
            shared,
            Arc::new(InMemoryPersistence::new()),
            &ChainConfig::default(),
        )
        .unwrap();
        for i in 0..extra {
            other
                .create_block(&json!({"remote": i}), &signer.export_public_key())
                .unwrap();
        }
        other.blocks().to_vec()
    }

    async fn wait_until_mining(service: &ChainService) {
        while !service.is_mining() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_rejected_sync_leaves_mining_running() {
        timeout(Duration::from_secs(30), async {
            // 64 leading zeros is never found; only cancellation ends the search.
            let service = service_with_difficulty(64);
            let alice = service.create_account("alice", "alice@example.com").unwrap();
            let key = alice.export_public_key();

            let miner = service.clone();
            let job = tokio::spawn(async move {
                miner.create_block(json!({"slow": true}), &key).await
            });
            wait_until_mining(&service).await;

            let outcome = service.synchronize_chain(Vec::new()).await.unwrap();
            assert_eq!(
                outcome,
                SyncOutcome::Rejected(SyncRejection::NotLonger { local: 1, candidate: 0 })
            );
            let outcome = service.synchronize_chain(vec![Block::genesis()]).await.unwrap();
            assert_eq!(
                outcome,
                SyncOutcome::Rejected(SyncRejection::NotLonger { local: 1, candidate: 1 })
            );
            assert!(service.is_mining());
            assert!(service.in_flight.lock().iter().all(|t| !t.is_cancelled()));

            assert_eq!(service.cancel_mining(), 1);
            assert_eq!(job.await.unwrap(), Err(ChainError::MiningCancelled));
            assert!(!service.is_mining());
            assert_eq!(service.len().await, 1);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_sync_keeps_metered_block_at_success_price() {
        timeout(Duration::from_secs(30), async {
            let service = service_with_difficulty(1);
            let alice = service.create_account("alice", "alice@example.com").unwrap();
            service
                .directory()
                .credit(alice.fingerprint(), "GAS", Decimal::ONE)
                .unwrap();
            let key = alice.export_public_key();

            // Holding the lock keeps the metered job queued behind it.
            let guard = service.chain.clone().lock_owned().await;
            let miner = service.clone();
            let job = tokio::spawn(async move {
                let request = BlockRequest::Data { payload: json!({"n": 1}) };
                miner.submit_metered(&key, request, 20_000, Decimal::ZERO).await
            });
            wait_until_mining(&service).await;

            let outcome = service.synchronize_chain(Vec::new()).await.unwrap();
            assert!(matches!(
                outcome,
                SyncOutcome::Rejected(SyncRejection::NotLonger { .. })
            ));

            let mut forged = Block::new(1, Block::genesis().hash, Vec::new());
            forged.validator = alice.export_public_key();
            let outcome = service
                .synchronize_chain(vec![Block::genesis(), forged])
                .await
                .unwrap();
            assert!(matches!(outcome, SyncOutcome::Rejected(SyncRejection::Invalid(_))));
            assert!(service.in_flight.lock().iter().all(|t| !t.is_cancelled()));

            drop(guard);
            let block = job.await.unwrap().unwrap();
            assert_eq!(block.index, 1);
            assert_eq!(service.len().await, 2);
            // Full success price, not the 0.02 failure charge for a cancelled block.
            assert_eq!(
                service.directory().balance(alice.fingerprint(), "GAS").unwrap(),
                Decimal::ONE - Decimal::new(2, 2)
            );
            let ledger = service.gas().ledger();
            assert_eq!(ledger.len(), 1);
            assert_eq!(ledger[0].outcome, GasOutcome::Succeeded);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accepted_sync_preempts_in_flight_mining() {
        timeout(Duration::from_secs(30), async {
            let service = service_with_difficulty(1);
            let alice = service.create_account("alice", "alice@example.com").unwrap();
            let candidate = longer_candidate(&service, &alice, 2);
            let key = alice.export_public_key();

            let guard = service.chain.clone().lock_owned().await;
            let miner = service.clone();
            let job = tokio::spawn(async move {
                miner.create_block(json!({"local": true}), &key).await
            });
            wait_until_mining(&service).await;

            let syncer = service.clone();
            let sync = tokio::spawn(async move { syncer.synchronize_chain(candidate).await });
            while !service.in_flight.lock().iter().all(CancelToken::is_cancelled) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            drop(guard);
            assert_eq!(
                sync.await.unwrap().unwrap(),
                SyncOutcome::Replaced {
                    previous_length: 1,
                    new_length: 3
                }
            );
            assert_eq!(job.await.unwrap(), Err(ChainError::MiningCancelled));
            assert!(!service.is_mining());
            assert_eq!(service.len().await, 3);
        })
        .await
        .unwrap();
    }
}
