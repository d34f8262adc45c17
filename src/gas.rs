//! Gas metering for state-changing operations.
//!
//! Every metered call goes through [`GasMeter::execute_transaction`], which
//! charges exactly once per call: the base cost when the operation succeeds, a
//! capped partial cost when it fails. The base price follows recent block
//! occupancy through [`GasMeter::adjust_base_price`].

use crate::accounts::IdentityDirectory;
use crate::blockchain::Block;
use crate::config::GasConfig;
use crate::error::ChainError;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasOperation {
    Transfer,
    TokenTransfer,
    ContractDeployment,
    StorageRead,
    StorageWrite,
    BlockWithRewards,
    PrivateBlock,
}

impl GasOperation {
    pub const fn gas_units(self) -> u64 {
        match self {
            GasOperation::Transfer => 21_000,
            GasOperation::TokenTransfer => 65_000,
            GasOperation::ContractDeployment => 200_000,
            GasOperation::StorageRead => 800,
            GasOperation::StorageWrite => 20_000,
            GasOperation::BlockWithRewards => 50_000,
            GasOperation::PrivateBlock => 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasQuote {
    pub gas_units: u64,
    pub base_cost: Decimal,
    pub priority_cost: Decimal,
    pub total: Decimal,
    pub max_cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasOutcome {
    Succeeded,
    Failed,
}

/// Append-only audit record of one metered call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasLedgerEntry {
    pub fingerprint: String,
    pub operation: GasOperation,
    pub gas_units: u64,
    /// Base price per gas unit at the time of the call
    pub base_fee: Decimal,
    /// Priority price per gas unit offered by the caller
    pub priority_fee: Decimal,
    /// Amount actually debited
    pub charged: Decimal,
    pub outcome: GasOutcome,
    pub timestamp: u64,
}

/// Source of recent block occupancy for the base price controller.
pub trait CongestionSignal {
    /// Transaction counts of the most recent `window` blocks, oldest first.
    fn recent_transaction_counts(&self, window: usize) -> Vec<usize>;
}

impl CongestionSignal for [Block] {
    fn recent_transaction_counts(&self, window: usize) -> Vec<usize> {
        let start = self.len().saturating_sub(window);
        self[start..].iter().map(|b| b.transactions.len()).collect()
    }
}

pub struct GasMeter {
    directory: Arc<dyn IdentityDirectory>,
    config: GasConfig,
    base_price: Mutex<Decimal>,
    ledger: Mutex<Vec<GasLedgerEntry>>,
}

impl GasMeter {
    pub fn new(config: GasConfig, directory: Arc<dyn IdentityDirectory>) -> Self {
        let base_price = Mutex::new(config.base_price);
        Self {
            directory,
            config,
            base_price,
            ledger: Mutex::new(Vec::new()),
        }
    }

    pub fn base_price(&self) -> Decimal {
        *self.base_price.lock()
    }

    pub fn gas_currency(&self) -> &str {
        &self.config.gas_currency
    }

    pub fn quote(
        &self,
        operation: GasOperation,
        gas_limit: u64,
        priority_fee: Decimal,
    ) -> GasQuote {
        Self::quote_at(self.base_price(), operation, gas_limit, priority_fee)
    }

    fn quote_at(
        base_price: Decimal,
        operation: GasOperation,
        gas_limit: u64,
        priority_fee: Decimal,
    ) -> GasQuote {
        let gas_units = operation.gas_units();
        let units = Decimal::from(gas_units);
        let base_cost = units * base_price;
        let priority_cost = units * priority_fee;
        GasQuote {
            gas_units,
            base_cost,
            priority_cost,
            total: base_cost + priority_cost,
            max_cost: Decimal::from(gas_limit) * (base_price + priority_fee),
        }
    }

    /// Runs `operation` under gas accounting for `fingerprint`.
    ///
    /// The operation's own error is returned unchanged on failure; problems while
    /// charging the partial cost are logged and never replace it. A committed
    /// operation is never reported as failed: if its debit cannot be taken the
    /// entry records a charge of zero.
    pub fn execute_transaction<T, F>(
        &self,
        fingerprint: &str,
        operation: GasOperation,
        gas_limit: u64,
        priority_fee: Decimal,
        run: F,
    ) -> Result<T, ChainError>
    where
        F: FnOnce() -> Result<T, ChainError>,
    {
        if priority_fee.is_sign_negative() {
            return Err(ChainError::InvalidTransaction(
                "Priority fee cannot be negative".to_string(),
            ));
        }

        let base_price = self.base_price();
        let quote = Self::quote_at(base_price, operation, gas_limit, priority_fee);
        let currency = self.config.gas_currency.as_str();

        let balance = self.directory.balance(fingerprint, currency)?;
        if balance < quote.max_cost {
            return Err(ChainError::InsufficientGasFunds(format!(
                "{} holds {} {} but the call may cost up to {}",
                fingerprint, balance, currency, quote.max_cost
            )));
        }

        match run() {
            Ok(value) => {
                let charged = match self.directory.debit(fingerprint, currency, quote.base_cost) {
                    Ok(_) => quote.base_cost,
                    Err(e) => {
                        warn!(
                            fingerprint,
                            ?operation,
                            owed = %quote.base_cost,
                            error = %e,
                            "gas debit failed after the operation committed"
                        );
                        Decimal::ZERO
                    }
                };
                self.record(
                    fingerprint,
                    operation,
                    &quote,
                    base_price,
                    priority_fee,
                    charged,
                    GasOutcome::Succeeded,
                );
                debug!(fingerprint, ?operation, charged = %charged, "gas charged");
                Ok(value)
            }
            Err(err) => {
                let charged_units = Decimal::from(quote.gas_units.min(gas_limit));
                let partial = charged_units * (base_price + priority_fee);
                let charged = self.charge_partial(fingerprint, currency, partial);
                self.record(
                    fingerprint,
                    operation,
                    &quote,
                    base_price,
                    priority_fee,
                    charged,
                    GasOutcome::Failed,
                );
                debug!(
                    fingerprint,
                    ?operation,
                    charged = %charged,
                    error = %err,
                    "partial gas charged"
                );
                Err(err)
            }
        }
    }

    fn charge_partial(&self, fingerprint: &str, currency: &str, partial: Decimal) -> Decimal {
        let available = match self.directory.balance(fingerprint, currency) {
            Ok(balance) => balance,
            Err(e) => {
                warn!(fingerprint, error = %e, "could not read balance for partial gas charge");
                return Decimal::ZERO;
            }
        };
        let charge = partial.min(available);
        if charge <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        match self.directory.debit(fingerprint, currency, charge) {
            Ok(_) => charge,
            Err(e) => {
                warn!(fingerprint, error = %e, "partial gas charge failed");
                Decimal::ZERO
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        fingerprint: &str,
        operation: GasOperation,
        quote: &GasQuote,
        base_fee: Decimal,
        priority_fee: Decimal,
        charged: Decimal,
        outcome: GasOutcome,
    ) {
        self.ledger.lock().push(GasLedgerEntry {
            fingerprint: fingerprint.to_string(),
            operation,
            gas_units: quote.gas_units,
            base_fee,
            priority_fee,
            charged,
            outcome,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        });
    }

    pub fn ledger(&self) -> Vec<GasLedgerEntry> {
        self.ledger.lock().clone()
    }

    /// One step of the EIP-1559 style controller: ±12.5% depending on whether
    /// the sampled window ran above the gas target.
    pub fn adjust_base_price<S: CongestionSignal + ?Sized>(&self, signal: &S) -> Decimal {
        let counts = signal.recent_transaction_counts(self.config.congestion_window);
        let mut price = self.base_price.lock();
        if counts.is_empty() {
            return *price;
        }

        let total_gas: u64 = counts
            .iter()
            .map(|count| *count as u64 * GasOperation::Transfer.gas_units())
            .sum();
        let average = total_gas / counts.len() as u64;

        let factor = if average > self.config.target_gas_per_block {
            Decimal::new(1125, 3)
        } else {
            Decimal::new(875, 3)
        };
        let adjusted = (*price * factor)
            .max(self.config.min_base_price)
            .min(self.config.max_base_price);

        if adjusted != *price {
            info!(
                average_gas = average,
                target = self.config.target_gas_per_block,
                from = %*price,
                to = %adjusted,
                "base gas price adjusted"
            );
        }
        *price = adjusted;
        adjusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountDirectory;
    use crate::identity::Identity;
    use std::cell::Cell;

    fn meter_with_balance(amount: Decimal) -> (GasMeter, Arc<AccountDirectory>, Identity) {
        let directory = Arc::new(AccountDirectory::new());
        let payer = directory.create_account("payer", "payer@example.com").unwrap();
        if amount > Decimal::ZERO {
            directory.credit(payer.fingerprint(), "GAS", amount).unwrap();
        }
        let meter = GasMeter::new(GasConfig::default(), directory.clone());
        (meter, directory, payer)
    }

    #[test]
    fn test_quote() {
        let (meter, _, _) = meter_with_balance(Decimal::ZERO);
        let quote = meter.quote(GasOperation::Transfer, 30_000, Decimal::new(2, 6));
        assert_eq!(quote.gas_units, 21_000);
        assert_eq!(quote.base_cost, Decimal::new(21, 3));
        assert_eq!(quote.priority_cost, Decimal::new(42, 3));
        assert_eq!(quote.total, Decimal::new(63, 3));
        assert_eq!(quote.max_cost, Decimal::new(90, 3));
    }

    #[test]
    fn test_success_debits_exact_base_cost() {
        let (meter, directory, payer) = meter_with_balance(Decimal::ONE);
        let out = meter
            .execute_transaction(
                payer.fingerprint(),
                GasOperation::Transfer,
                21_000,
                Decimal::ZERO,
                || Ok(7),
            )
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(
            directory.balance(payer.fingerprint(), "GAS").unwrap(),
            Decimal::ONE - Decimal::new(21, 3)
        );

        let ledger = meter.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].charged, Decimal::new(21, 3));
        assert_eq!(ledger[0].outcome, GasOutcome::Succeeded);
        assert_eq!(ledger[0].base_fee, Decimal::new(1, 6));
    }

    #[test]
    fn test_insufficient_funds_never_runs_operation() {
        let (meter, directory, payer) = meter_with_balance(Decimal::new(1, 2));
        let ran = Cell::new(false);
        let result: Result<(), ChainError> = meter.execute_transaction(
            payer.fingerprint(),
            GasOperation::Transfer,
            21_000,
            Decimal::ZERO,
            || {
                ran.set(true);
                Ok(())
            },
        );
        assert!(matches!(result, Err(ChainError::InsufficientGasFunds(_))));
        assert!(!ran.get());
        assert_eq!(directory.balance(payer.fingerprint(), "GAS").unwrap(), Decimal::new(1, 2));
        assert!(meter.ledger().is_empty());
    }

    #[test]
    fn test_failure_charges_partial_and_returns_original_error() {
        let (meter, directory, payer) = meter_with_balance(Decimal::ONE);
        let result: Result<(), ChainError> = meter.execute_transaction(
            payer.fingerprint(),
            GasOperation::StorageWrite,
            10_000,
            Decimal::new(1, 6),
            || Err(ChainError::InvalidBlock("boom".to_string())),
        );
        assert_eq!(result, Err(ChainError::InvalidBlock("boom".to_string())));

        // min(20_000, 10_000) * (0.000001 + 0.000001)
        let expected = Decimal::new(2, 2);
        assert_eq!(
            directory.balance(payer.fingerprint(), "GAS").unwrap(),
            Decimal::ONE - expected
        );
        let ledger = meter.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].outcome, GasOutcome::Failed);
        assert_eq!(ledger[0].charged, expected);
    }

    #[test]
    fn test_unknown_payer() {
        let (meter, _, _) = meter_with_balance(Decimal::ZERO);
        let result = meter.execute_transaction(
            "nobody",
            GasOperation::Transfer,
            1,
            Decimal::ZERO,
            || Ok(()),
        );
        assert!(matches!(result, Err(ChainError::AccountNotFound(_))));
    }

    #[test]
    fn test_committed_operation_stays_successful_when_debit_fails() {
        let (meter, directory, payer) = meter_with_balance(Decimal::ONE);
        let result = meter.execute_transaction(
            payer.fingerprint(),
            GasOperation::Transfer,
            21_000,
            Decimal::ZERO,
            || {
                // The operation spends the payer's whole gas balance itself.
                directory.debit(payer.fingerprint(), "GAS", Decimal::ONE)?;
                Ok("committed")
            },
        );
        assert_eq!(result, Ok("committed"));
        assert_eq!(directory.balance(payer.fingerprint(), "GAS").unwrap(), Decimal::ZERO);

        let ledger = meter.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].outcome, GasOutcome::Succeeded);
        assert_eq!(ledger[0].charged, Decimal::ZERO);
    }

    struct FixedSignal(Vec<usize>);

    impl CongestionSignal for FixedSignal {
        fn recent_transaction_counts(&self, window: usize) -> Vec<usize> {
            self.0.iter().rev().take(window).rev().copied().collect()
        }
    }

    #[test]
    fn test_base_price_controller_direction() {
        let (meter, _, _) = meter_with_balance(Decimal::ZERO);
        let start = meter.base_price();

        // 5 transfers per block = 105_000 gas, above the 42_000 target
        let raised = meter.adjust_base_price(&FixedSignal(vec![5; 10]));
        assert_eq!(raised, start * Decimal::new(1125, 3));

        // 2 transfers per block = 42_000 gas, at target, so it comes down
        let lowered = meter.adjust_base_price(&FixedSignal(vec![2; 10]));
        assert_eq!(lowered, raised * Decimal::new(875, 3));

        // no samples, no change
        assert_eq!(meter.adjust_base_price(&FixedSignal(Vec::new())), lowered);
    }

    #[test]
    fn test_base_price_respects_floor() {
        let directory = Arc::new(AccountDirectory::new());
        let config = GasConfig {
            base_price: Decimal::new(1, 9),
            ..GasConfig::default()
        };
        let meter = GasMeter::new(config, directory);
        let price = meter.adjust_base_price(&FixedSignal(vec![0; 3]));
        assert_eq!(price, Decimal::new(1, 9));
    }

    #[test]
    fn test_block_slice_signal() {
        let blocks = vec![Block::genesis(); 4];
        assert_eq!(blocks.recent_transaction_counts(2), vec![0, 0]);
        assert_eq!(blocks[..].recent_transaction_counts(10).len(), 4);
    }
}
