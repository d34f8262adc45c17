//! Block production and validation under proof-of-work or stake-weighted proof-of-stake.
//!
//! The algorithm is chosen once when the engine is built. Both strategies share
//! the same `mine` / `validate_block` contract:
//!
//! ```text
//! Unmined --mine--> Mined --validate_block--> Accepted
//!                                         \--> Rejected
//! ```

use crate::accounts::IdentityDirectory;
use crate::blockchain::Block;
use crate::config::{Algorithm, ConsensusConfig};
use crate::crypto;
use crate::error::ChainError;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How many nonces are tried between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Shared flag used to abort an in-flight nonce search.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    ProofOfWork {
        difficulty: usize,
    },
    ProofOfStake {
        min_stake: Decimal,
        staking_currency: String,
    },
}

pub struct ConsensusEngine {
    strategy: Strategy,
    directory: Arc<dyn IdentityDirectory>,
}

impl ConsensusEngine {
    pub fn new(strategy: Strategy, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { strategy, directory }
    }

    pub fn from_config(config: &ConsensusConfig, directory: Arc<dyn IdentityDirectory>) -> Self {
        let strategy = match config.algorithm {
            Algorithm::Pow => Strategy::ProofOfWork {
                difficulty: config.difficulty,
            },
            Algorithm::Pos => Strategy::ProofOfStake {
                min_stake: config.min_stake,
                staking_currency: config.staking_currency.clone(),
            },
        };
        Self::new(strategy, directory)
    }

    pub fn proof_of_work(difficulty: usize, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self::new(Strategy::ProofOfWork { difficulty }, directory)
    }

    pub fn proof_of_stake(
        min_stake: Decimal,
        staking_currency: &str,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self::new(
            Strategy::ProofOfStake {
                min_stake,
                staking_currency: staking_currency.to_string(),
            },
            directory,
        )
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn algorithm(&self) -> Algorithm {
        match self.strategy {
            Strategy::ProofOfWork { .. } => Algorithm::Pow,
            Strategy::ProofOfStake { .. } => Algorithm::Pos,
        }
    }

    /// Turns an unmined block into a mined, signed one.
    ///
    /// Under PoW the caller must have set `validator` to the exported key of the
    /// identity that will sign the block. Under PoS the validator is drawn here.
    /// On any error the caller's chain is untouched; the block is simply dropped.
    pub fn mine(&self, mut block: Block, cancel: &CancelToken) -> Result<Block, ChainError> {
        match &self.strategy {
            Strategy::ProofOfWork { difficulty } => {
                Self::search_nonce(&mut block, *difficulty, cancel)?;
            }
            Strategy::ProofOfStake { .. } => {
                if cancel.is_cancelled() {
                    return Err(ChainError::MiningCancelled);
                }
                block.validator = self.select_validator()?;
                block.refresh_hash();
            }
        }
        self.sign_block(&mut block)?;
        Ok(block)
    }

    fn search_nonce(
        block: &mut Block,
        difficulty: usize,
        cancel: &CancelToken,
    ) -> Result<(), ChainError> {
        let start = std::time::Instant::now();
        block.nonce = 0;
        loop {
            if block.nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                debug!(index = block.index, nonce = block.nonce, "nonce search cancelled");
                return Err(ChainError::MiningCancelled);
            }
            block.refresh_hash();
            if meets_difficulty(&block.hash, difficulty) {
                debug!(
                    index = block.index,
                    nonce = block.nonce,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "nonce found"
                );
                return Ok(());
            }
            block.nonce = block.nonce.wrapping_add(1);
        }
    }

    fn sign_block(&self, block: &mut Block) -> Result<(), ChainError> {
        let signer = self
            .directory
            .find_by_public_key(&block.validator)
            .ok_or_else(|| ChainError::AccountNotFound(format!("validator {}", block.validator)))?;
        block.signature = signer.sign(block.hash.as_bytes())?;
        Ok(())
    }

    /// Identities whose staking balance meets the minimum, with their stake.
    pub fn eligible_validators(&self) -> Vec<(String, Decimal)> {
        match &self.strategy {
            Strategy::ProofOfStake {
                min_stake,
                staking_currency,
            } => self
                .directory
                .stake_holders(staking_currency)
                .into_iter()
                .filter(|(_, stake)| stake >= min_stake && *stake > Decimal::ZERO)
                .collect(),
            Strategy::ProofOfWork { .. } => Vec::new(),
        }
    }

    pub fn select_validator(&self) -> Result<String, ChainError> {
        self.select_validator_with(&mut rand::thread_rng())
    }

    /// Stake-weighted draw: uniform value in `[0, total)`, then walk the
    /// eligible set until the running sum passes it.
    pub fn select_validator_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<String, ChainError> {
        let eligible = self.eligible_validators();
        let total: Decimal = eligible.iter().map(|(_, stake)| *stake).sum();
        if eligible.is_empty() || total <= Decimal::ZERO {
            return Err(ChainError::NoValidatorsAvailable);
        }

        let fraction = Decimal::from_f64(rng.gen::<f64>()).unwrap_or(Decimal::ZERO);
        let draw = total * fraction;

        let mut cumulative = Decimal::ZERO;
        for (address, stake) in &eligible {
            cumulative += *stake;
            if cumulative > draw {
                return Ok(address.clone());
            }
        }
        // Rounding in `draw` can land exactly on `total`.
        eligible
            .last()
            .map(|(address, _)| address.clone())
            .ok_or(ChainError::NoValidatorsAvailable)
    }

    fn validator_meets_stake(&self, validator: &str) -> bool {
        match &self.strategy {
            Strategy::ProofOfStake {
                min_stake,
                staking_currency,
            } => self
                .directory
                .find_by_public_key(validator)
                .map(|identity| identity.balance(staking_currency) >= *min_stake)
                .unwrap_or(false),
            Strategy::ProofOfWork { .. } => true,
        }
    }

    fn signature_matches(block: &Block) -> bool {
        crypto::public_key_from_hex(&block.validator)
            .map(|key| crypto::verify(block.hash.as_bytes(), &block.signature, &key))
            .unwrap_or(false)
    }

    /// Checks a mined block without re-running any search.
    pub fn validate_block(&self, block: &Block) -> bool {
        if !block.has_valid_hash() {
            return false;
        }
        match &self.strategy {
            Strategy::ProofOfWork { difficulty } => {
                if !meets_difficulty(&block.hash, *difficulty) {
                    return false;
                }
            }
            Strategy::ProofOfStake { .. } => {
                if block.validator.is_empty() || !self.validator_meets_stake(&block.validator) {
                    return false;
                }
            }
        }
        Self::signature_matches(block)
    }

    /// Genesis shape, then pairwise linkage plus `validate_block` for every later block.
    pub fn validate_chain(&self, chain: &[Block]) -> bool {
        let Some(genesis) = chain.first() else {
            return false;
        };
        if !genesis.is_genesis() || !genesis.has_valid_hash() {
            return false;
        }

        chain.windows(2).all(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            current.index == previous.index + 1
                && current.previous_hash == previous.hash
                && self.validate_block(current)
        })
    }
}

pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
