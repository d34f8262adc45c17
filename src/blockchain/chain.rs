//! The chain manager: owns the canonical block sequence and is the only code
//! that appends to it or replaces it.

use super::block::Block;
use super::mempool::Mempool;
use crate::accounts::IdentityDirectory;
use crate::config::{ChainConfig, Config};
use crate::consensus::{CancelToken, ConsensusEngine};
use crate::crypto::envelope;
use crate::error::ChainError;
use crate::gas::CongestionSignal;
use crate::identity::Identity;
use crate::persistence::BlockStore;
use crate::transaction::Transaction;
use rayon::prelude::*;
use rust_decimal::Decimal;
use secp256k1::SecretKey;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Replaced {
        previous_length: usize,
        new_length: usize,
    },
    Rejected(SyncRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRejection {
    NotLonger { local: usize, candidate: usize },
    Invalid(String),
}

pub struct ChainManager {
    /// Never empty once bootstrapped: `blocks[0]` is genesis.
    blocks: Vec<Block>,
    consensus: Arc<ConsensusEngine>,
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn BlockStore>,
    mempool: Mempool,
    reward_currency: String,
}

impl ChainManager {
    /// Genesis-or-load: an empty store gets a fresh, persisted genesis block,
    /// otherwise the stored chain is reconstructed.
    pub fn bootstrap(
        consensus: Arc<ConsensusEngine>,
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn BlockStore>,
        config: &ChainConfig,
    ) -> Result<Self, ChainError> {
        let blocks = match store.latest_block()? {
            None => {
                let genesis = Block::genesis();
                store.on_block_appended(&genesis)?;
                info!(hash = %genesis.hash, "created genesis block");
                vec![genesis]
            }
            Some(latest) => {
                let blocks = store.load_blocks()?;
                if blocks.last() != Some(&latest) {
                    return Err(ChainError::InvalidChain(format!(
                        "stored head {} does not match loaded chain",
                        latest.index
                    )));
                }
                if config.verify_on_load {
                    verify_stored_chain(&blocks)?;
                }
                info!(
                    length = blocks.len(),
                    head = %latest.hash,
                    verified = config.verify_on_load,
                    "loaded chain from storage"
                );
                blocks
            }
        };

        Ok(Self {
            blocks,
            consensus,
            directory,
            store,
            mempool: Mempool::new(),
            reward_currency: config.reward_currency.clone(),
        })
    }

    pub fn from_config(
        config: &Config,
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, ChainError> {
        let consensus = Arc::new(ConsensusEngine::from_config(
            &config.consensus,
            directory.clone(),
        ));
        Self::bootstrap(consensus, directory, store, &config.chain)
    }

    pub fn head(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn create_block(
        &mut self,
        payload: &Value,
        signer_public_key: &str,
    ) -> Result<Block, ChainError> {
        self.create_block_cancellable(payload, signer_public_key, &CancelToken::new())
    }

    /// Seals `payload` to the signer, mines a one-transaction block and appends it.
    pub fn create_block_cancellable(
        &mut self,
        payload: &Value,
        signer_public_key: &str,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        let signer = self.resolve(signer_public_key)?;
        let tx = Transaction::seal(&signer, signer.public_key(), "block data", payload)?;
        self.append_mined(vec![tx], &signer, cancel)
    }

    pub fn create_private_block(
        &mut self,
        payload: &Value,
        owner_public_key: &str,
    ) -> Result<Block, ChainError> {
        self.create_private_block_cancellable(payload, owner_public_key, &CancelToken::new())
    }

    pub fn create_private_block_cancellable(
        &mut self,
        payload: &Value,
        owner_public_key: &str,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        let owner = self.resolve(owner_public_key)?;
        let tx = Transaction::seal(&owner, owner.public_key(), "private block data", payload)?
            .into_private();
        self.append_mined(vec![tx], &owner, cancel)
    }

    /// Signed by `sender`, readable only by `recipient`.
    pub fn create_transfer_block(
        &mut self,
        payload: &Value,
        sender_public_key: &str,
        recipient_public_key: &str,
    ) -> Result<Block, ChainError> {
        self.create_transfer_block_cancellable(
            payload,
            sender_public_key,
            recipient_public_key,
            &CancelToken::new(),
        )
    }

    pub fn create_transfer_block_cancellable(
        &mut self,
        payload: &Value,
        sender_public_key: &str,
        recipient_public_key: &str,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        let sender = self.resolve(sender_public_key)?;
        let recipient = self.resolve(recipient_public_key)?;
        let tx = Transaction::seal(&sender, recipient.public_key(), "transfer", payload)?;
        self.append_mined(vec![tx], &sender, cancel)
    }

    /// Same pipeline as [`create_block`](Self::create_block), then pays `reward`
    /// to whoever ended up validating the block.
    pub fn create_block_with_rewards(
        &mut self,
        payload: &Value,
        signer_public_key: &str,
        reward: Decimal,
    ) -> Result<Block, ChainError> {
        self.create_block_with_rewards_cancellable(
            payload,
            signer_public_key,
            reward,
            &CancelToken::new(),
        )
    }

    pub fn create_block_with_rewards_cancellable(
        &mut self,
        payload: &Value,
        signer_public_key: &str,
        reward: Decimal,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        if reward.is_sign_negative() {
            return Err(ChainError::InvalidTransaction(
                "Block reward cannot be negative".to_string(),
            ));
        }
        let block = self.create_block_cancellable(payload, signer_public_key, cancel)?;

        let validator = self.resolve(&block.validator)?;
        let balance = self
            .directory
            .credit(validator.fingerprint(), &self.reward_currency, reward)?;
        info!(
            index = block.index,
            validator = %validator.fingerprint(),
            reward = %reward,
            balance = %balance,
            "block reward credited"
        );
        Ok(block)
    }

    /// Queues a transaction for the next [`mine_pending`](Self::mine_pending).
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        self.mempool.add_transaction(tx)?;
        debug!(pending = self.mempool.len(), "transaction queued");
        Ok(())
    }

    /// Mines every pending transaction into one block. The pool keeps them if
    /// the block is not appended.
    pub fn mine_pending(&mut self, signer_public_key: &str) -> Result<Block, ChainError> {
        self.mine_pending_cancellable(signer_public_key, &CancelToken::new())
    }

    pub fn mine_pending_cancellable(
        &mut self,
        signer_public_key: &str,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        if self.mempool.is_empty() {
            return Err(ChainError::InvalidBlock("No pending transactions".to_string()));
        }
        let signer = self.resolve(signer_public_key)?;
        let transactions = self.mempool.pending().to_vec();
        self.append_mined(transactions, &signer, cancel)
    }

    fn resolve(&self, public_key: &str) -> Result<Identity, ChainError> {
        self.directory
            .find_by_public_key(public_key)
            .ok_or_else(|| ChainError::AccountNotFound(public_key.to_string()))
    }

    /// Mine, validate, persist, append. Any failure leaves the chain exactly as it was.
    fn append_mined(
        &mut self,
        transactions: Vec<Transaction>,
        signer: &Identity,
        cancel: &CancelToken,
    ) -> Result<Block, ChainError> {
        let head = self.head();
        let mut block = Block::new(head.index + 1, head.hash.clone(), transactions);
        block.validator = signer.export_public_key();

        let block = match self.consensus.mine(block, cancel) {
            Ok(block) => block,
            Err(ChainError::MiningCancelled) => {
                info!(index = self.head().index + 1, "mining cancelled, nothing appended");
                return Err(ChainError::MiningCancelled);
            }
            Err(e) => return Err(e),
        };

        if !self.consensus.validate_block(&block) {
            warn!(index = block.index, hash = %block.hash, "mined block failed validation");
            return Err(ChainError::InvalidBlock(format!(
                "Block {} rejected by consensus",
                block.index
            )));
        }

        self.store.on_block_appended(&block)?;
        self.mempool.remove_included(&block.transactions);
        self.blocks.push(block.clone());

        info!(
            index = block.index,
            hash = %block.hash,
            transactions = block.transactions.len(),
            validator = %block.validator,
            "block appended"
        );
        Ok(block)
    }

    /// Opens every transaction of block `index` with `secret_key`. One result per
    /// transaction, in block order; entries sealed to other keys fail individually.
    pub fn get_decrypted_block_data(
        &self,
        index: usize,
        secret_key: &SecretKey,
    ) -> Result<Vec<Result<Value, ChainError>>, ChainError> {
        let block = self.blocks.get(index).ok_or_else(|| {
            ChainError::InvalidBlock(format!(
                "Block index {} out of range (chain length {})",
                index,
                self.blocks.len()
            ))
        })?;

        Ok(block
            .transactions
            .par_iter()
            .map(|tx| envelope::decrypt(&tx.payload, secret_key))
            .collect())
    }

    /// Why `candidate` cannot replace a chain of `local` blocks rooted at
    /// `genesis`, or `None` if it is strictly longer and valid. Needs no access
    /// to the chain itself.
    pub fn assess_candidate(
        consensus: &ConsensusEngine,
        genesis: &Block,
        local: usize,
        candidate: &[Block],
    ) -> Option<SyncRejection> {
        if candidate.len() <= local {
            info!(local, candidate = candidate.len(), "sync rejected: candidate not longer");
            return Some(SyncRejection::NotLonger {
                local,
                candidate: candidate.len(),
            });
        }
        if candidate.first() != Some(genesis) {
            warn!("sync rejected: genesis mismatch");
            return Some(SyncRejection::Invalid("genesis block differs".to_string()));
        }
        if !consensus.validate_chain(candidate) {
            warn!(candidate = candidate.len(), "sync rejected: candidate chain invalid");
            return Some(SyncRejection::Invalid(
                "candidate chain failed validation".to_string(),
            ));
        }
        None
    }

    /// Adopts `candidate` if it is strictly longer and valid.
    pub fn synchronize_chain(&mut self, candidate: Vec<Block>) -> Result<SyncOutcome, ChainError> {
        let local = self.blocks.len();
        if let Some(rejection) =
            Self::assess_candidate(&self.consensus, &self.blocks[0], local, &candidate)
        {
            return Ok(SyncOutcome::Rejected(rejection));
        }

        self.store.on_chain_replaced(&candidate)?;
        for block in &candidate {
            self.mempool.remove_included(&block.transactions);
        }
        let new_length = candidate.len();
        self.blocks = candidate;

        info!(previous_length = local, new_length, head = %self.head().hash, "chain replaced");
        Ok(SyncOutcome::Replaced {
            previous_length: local,
            new_length,
        })
    }

    pub fn get_account_blocks(&self, address: &str) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|block| block.involves(address))
            .cloned()
            .collect()
    }
}

impl CongestionSignal for ChainManager {
    fn recent_transaction_counts(&self, window: usize) -> Vec<usize> {
        self.blocks[..].recent_transaction_counts(window)
    }
}

/// Linkage, index sequence and hash re-derivation of a stored chain. Stake and
/// signatures are taken as stored.
fn verify_stored_chain(blocks: &[Block]) -> Result<(), ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::InvalidChain("stored chain is empty".to_string()))?;
    if !genesis.is_genesis() || !genesis.has_valid_hash() {
        return Err(ChainError::InvalidChain("stored genesis block is malformed".to_string()));
    }

    for pair in blocks.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.index != previous.index + 1 {
            return Err(ChainError::InvalidChain(format!(
                "stored block {} follows block {}",
                current.index, previous.index
            )));
        }
        if current.previous_hash != previous.hash {
            return Err(ChainError::InvalidChain(format!(
                "stored block {} does not link to its predecessor",
                current.index
            )));
        }
        if !current.has_valid_hash() {
            return Err(ChainError::InvalidChain(format!(
                "stored block {} hash does not match its contents",
                current.index
            )));
        }
    }
    Ok(())
}
