//! Script verification seam. Input checks run in parallel once every spent
//! coin of the block is known.

use cashd_primitives::transaction::Transaction;
use rayon::prelude::*;

use crate::utxo::Coin;
use crate::validation::ValidationError;

pub trait ScriptVerifier: Send + Sync {
    /// Verifies input `input` of `tx` spending `spent` under `flags`.
    fn verify(&self, tx: &Transaction, input: usize, spent: &Coin, flags: u32) -> Result<(), String>;
}

/// Verifier that accepts every script.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(&self, _tx: &Transaction, _input: usize, _spent: &Coin, _flags: u32) -> Result<(), String> {
        Ok(())
    }
}

/// One pending input check. `tx_index` points into the block.
#[derive(Clone, Debug)]
pub struct ScriptCheck {
    pub tx_index: usize,
    pub input: usize,
    pub spent: Coin,
}

/// Runs every check; on failure reports the first failing input in block
/// order.
pub fn verify_scripts(
    verifier: &dyn ScriptVerifier,
    transactions: &[Transaction],
    checks: &[ScriptCheck],
    flags: u32,
) -> Result<(), ValidationError> {
    let failure = checks.par_iter().find_map_first(|check| {
        let tx = &transactions[check.tx_index];
        verifier
            .verify(tx, check.input, &check.spent, flags)
            .err()
            .map(|reason| (check.tx_index, check.input, reason))
    });
    match failure {
        Some((tx_index, input, reason)) => Err(ValidationError::ScriptFailure {
            txid: transactions[tx_index].txid(),
            input: input as u32,
            reason,
        }),
        None => Ok(()),
    }
}
