//! Consensus rule checks that need no UTXO access.

use std::collections::HashSet;

use cashd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS_PER_MB, MAX_TX_SIZE, MIN_TX_SIZE, SEQUENCE_FINAL,
};
use cashd_consensus::money::money_range;
use cashd_consensus::{ConsensusParams, Hash256};
use cashd_pow::validation as pow_validation;
use cashd_primitives::block::{Block, BlockHeader};
use cashd_primitives::merkle::block_merkle_root;
use cashd_primitives::script::{legacy_sigop_count, push_int};
use cashd_primitives::transaction::Transaction;

const ONE_MEGABYTE: u64 = 1_000_000;
const MIN_COINBASE_SCRIPT_LEN: usize = 2;
const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// A consensus rule violation. Each variant maps to a stable rule name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    HighHash,
    BadDiffBits,
    TimeTooOld,
    TimeTooNew,
    BadVersion,
    CheckpointMismatch,
    BadPrevBlock,
    DuplicateInvalid,
    MerkleMismatch,
    MutatedMerkle,
    BadLength,
    BadSigops,
    MissingCoinbase,
    MultipleCoinbase,
    BadCoinbaseLength,
    BadCoinbaseHeight,
    BadCoinbaseAmount,
    NonFinal,
    EmptyInputs,
    EmptyOutputs,
    Oversize,
    Undersize,
    NegativeOutput,
    OutputTooLarge,
    OutputTotalTooLarge,
    DuplicateInputs,
    NullPrevout,
    Bip30,
    MissingOrSpent,
    PrematureCoinbaseSpend,
    InputValuesOutOfRange,
    InBelowOut,
    FeeOutOfRange,
    ScriptFailure {
        txid: Hash256,
        input: u32,
        reason: String,
    },
}

impl ValidationError {
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationError::HighHash => "high-hash",
            ValidationError::BadDiffBits => "bad-diffbits",
            ValidationError::TimeTooOld => "time-too-old",
            ValidationError::TimeTooNew => "time-too-new",
            ValidationError::BadVersion => "bad-version",
            ValidationError::CheckpointMismatch => "checkpoint-mismatch",
            ValidationError::BadPrevBlock => "bad-prevblk",
            ValidationError::DuplicateInvalid => "duplicate-invalid",
            ValidationError::MerkleMismatch => "bad-txnmrklroot",
            ValidationError::MutatedMerkle => "bad-txns-duplicate",
            ValidationError::BadLength => "bad-blk-length",
            ValidationError::BadSigops => "bad-blk-sigops",
            ValidationError::MissingCoinbase => "bad-cb-missing",
            ValidationError::MultipleCoinbase => "bad-cb-multiple",
            ValidationError::BadCoinbaseLength => "bad-cb-length",
            ValidationError::BadCoinbaseHeight => "bad-cb-height",
            ValidationError::BadCoinbaseAmount => "bad-cb-amount",
            ValidationError::NonFinal => "bad-txns-nonfinal",
            ValidationError::EmptyInputs => "bad-txns-vin-empty",
            ValidationError::EmptyOutputs => "bad-txns-vout-empty",
            ValidationError::Oversize => "bad-txns-oversize",
            ValidationError::Undersize => "bad-txns-undersize",
            ValidationError::NegativeOutput => "bad-txns-vout-negative",
            ValidationError::OutputTooLarge => "bad-txns-vout-toolarge",
            ValidationError::OutputTotalTooLarge => "bad-txns-txouttotal-toolarge",
            ValidationError::DuplicateInputs => "bad-txns-inputs-duplicate",
            ValidationError::NullPrevout => "bad-txns-prevout-null",
            ValidationError::Bip30 => "bad-txns-BIP30",
            ValidationError::MissingOrSpent => "bad-txns-inputs-missingorspent",
            ValidationError::PrematureCoinbaseSpend => "bad-txns-premature-spend-of-coinbase",
            ValidationError::InputValuesOutOfRange => "bad-txns-inputvalues-outofrange",
            ValidationError::InBelowOut => "bad-txns-in-belowout",
            ValidationError::FeeOutOfRange => "bad-txns-fee-outofrange",
            ValidationError::ScriptFailure { .. } => "blk-bad-inputs",
        }
    }

    /// True when a malleated copy of a valid block could produce this error,
    /// in which case the header must not be marked failed.
    pub fn may_be_corrupted(&self) -> bool {
        matches!(
            self,
            ValidationError::MerkleMismatch | ValidationError::MutatedMerkle
        )
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::ScriptFailure { input, reason, .. } => {
                write!(f, "{} (input {input}: {reason})", self.rule())
            }
            _ => write!(f, "{}", self.rule()),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<pow_validation::PowError> for ValidationError {
    fn from(_: pow_validation::PowError) -> Self {
        ValidationError::HighHash
    }
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<(), ValidationError> {
    if check_pow {
        pow_validation::validate_pow(&header.hash(), header.bits, params)?;
    }
    Ok(())
}

pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::EmptyInputs);
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::EmptyOutputs);
    }
    if tx.serialized_size() as u64 > MAX_TX_SIZE {
        return Err(ValidationError::Oversize);
    }

    let mut total = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::NegativeOutput);
        }
        if !money_range(output.value) {
            return Err(ValidationError::OutputTooLarge);
        }
        total = total
            .checked_add(output.value)
            .filter(|value| money_range(*value))
            .ok_or(ValidationError::OutputTotalTooLarge)?;
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ValidationError::BadCoinbaseLength);
        }
        return Ok(());
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if input.prevout.is_null() {
            return Err(ValidationError::NullPrevout);
        }
        if !seen.insert(&input.prevout) {
            return Err(ValidationError::DuplicateInputs);
        }
    }
    Ok(())
}

/// Upper bound on signature operations for a block of `block_size` bytes.
pub fn max_block_sigops(block_size: u64) -> u64 {
    let megabytes = block_size.div_ceil(ONE_MEGABYTE).max(1);
    megabytes * MAX_BLOCK_SIGOPS_PER_MB
}

pub fn transaction_sigops(tx: &Transaction) -> u64 {
    let inputs: u64 = tx
        .vin
        .iter()
        .map(|input| u64::from(legacy_sigop_count(&input.script_sig)))
        .sum();
    let outputs: u64 = tx
        .vout
        .iter()
        .map(|output| u64::from(legacy_sigop_count(&output.script_pubkey)))
        .sum();
    inputs + outputs
}

/// Checks that depend only on the block itself.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    max_block_size: u64,
    check_pow: bool,
) -> Result<(), ValidationError> {
    check_block_header(&block.header, params, check_pow)?;

    let (merkle_root, mutated) = block_merkle_root(block);
    if merkle_root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }
    if mutated {
        return Err(ValidationError::MutatedMerkle);
    }

    if block.transactions.is_empty() {
        return Err(ValidationError::BadLength);
    }
    let block_size = block.serialized_size() as u64;
    if block_size > max_block_size {
        return Err(ValidationError::BadLength);
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::MissingCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::MultipleCoinbase);
    }

    let sigop_limit = max_block_sigops(block_size);
    let mut sigops = 0u64;
    for tx in &block.transactions {
        check_transaction(tx)?;
        sigops += transaction_sigops(tx);
        if sigops > sigop_limit {
            return Err(ValidationError::BadSigops);
        }
    }
    Ok(())
}

pub fn is_final_tx(tx: &Transaction, height: i32, lock_time_cutoff: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        lock_time_cutoff
    };
    if i64::from(tx.lock_time) < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Rules a block must meet given its position in the chain.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext {
    pub height: i32,
    /// Median-time-past of the parent once CSV is active, else the block time.
    pub lock_time_cutoff: i64,
    pub max_block_size: u64,
    pub bip34_active: bool,
    pub enforce_min_tx_size: bool,
}

pub fn contextual_check_block(block: &Block, context: &BlockContext) -> Result<(), ValidationError> {
    if block.serialized_size() as u64 > context.max_block_size {
        return Err(ValidationError::BadLength);
    }

    for tx in &block.transactions {
        if !is_final_tx(tx, context.height, context.lock_time_cutoff) {
            return Err(ValidationError::NonFinal);
        }
        if context.enforce_min_tx_size && (tx.serialized_size() as u64) < MIN_TX_SIZE {
            return Err(ValidationError::Undersize);
        }
    }

    if context.bip34_active {
        let expected = push_int(i64::from(context.height));
        let coinbase = block
            .transactions
            .first()
            .ok_or(ValidationError::MissingCoinbase)?;
        if !coinbase.vin[0].script_sig.starts_with(&expected) {
            return Err(ValidationError::BadCoinbaseHeight);
        }
    }
    Ok(())
}
