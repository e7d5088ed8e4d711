//! Applying and reverting a block's transactions against a coin view.
//!
//! Both directions build a [`UtxoDelta`] without touching the store; the
//! caller commits it in one batch, so a block is applied entirely or not at
//! all.

use std::time::{Duration, Instant};

use cashd_consensus::constants::{COINBASE_MATURITY, MAX_SCRIPT_SIZE};
use cashd_consensus::money::{money_range, Amount};
use cashd_consensus::Hash256;
use cashd_primitives::block::Block;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::script::OP_RETURN;

use crate::blockindex::BlockHandle;
use crate::error::ChainStateError;
use crate::index::ChainIndex;
use crate::policy::PolicyOracle;
use crate::script::{verify_scripts, ScriptCheck, ScriptVerifier};
use crate::undo::{BlockUndo, TxUndo};
use crate::utxo::{Coin, CoinView, OverlayView, UtxoDelta};
use crate::validation::{check_block, contextual_check_block, ValidationError};

#[derive(Debug)]
pub struct ConnectedBlock {
    pub delta: UtxoDelta,
    pub undo: BlockUndo,
    pub fees: Amount,
    pub script_checks: usize,
    pub script_time: Duration,
}

#[derive(Debug)]
pub struct DisconnectedBlock {
    pub delta: UtxoDelta,
    /// False when the coin view did not hold exactly what the block created
    /// and spent.
    pub clean: bool,
}

/// Outputs that can never be spent and so never enter the coin set.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

/// Validates `block` as the child of its index parent against `coins`
/// and returns its effect. Nothing is written.
pub fn connect_block<V: CoinView + ?Sized>(
    block: &Block,
    index: &ChainIndex,
    handle: BlockHandle,
    coins: &V,
    policy: &dyn PolicyOracle,
    verifier: &dyn ScriptVerifier,
    check_scripts: bool,
) -> Result<ConnectedBlock, ChainStateError> {
    let node = index.get(handle);
    let (hash, height) = (node.hash, node.height);
    let reject = |error: ValidationError| ChainStateError::invalid(hash, height, error);
    if block.hash() != hash {
        return Err(ChainStateError::corrupt(
            "block data does not match its index entry",
            Some(hash),
            Some(height),
        ));
    }

    check_block(block, policy.params(), policy.max_block_size(index, handle), true)
        .map_err(reject)?;
    contextual_check_block(block, &policy.block_context(index, handle)).map_err(reject)?;

    let enforce_bip30 = policy.enforce_bip30(index, handle);
    let coin_height = height as u32;
    let mut delta = UtxoDelta::new();
    let mut undo = BlockUndo::default();
    let mut checks = Vec::new();
    let mut fees: Amount = 0;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        if enforce_bip30 {
            for vout in 0..tx.vout.len() {
                let outpoint = OutPoint::new(txid, vout as u32);
                if OverlayView::new(coins, &delta).have_coin(&outpoint)? {
                    return Err(reject(ValidationError::Bip30));
                }
            }
        }

        if !tx.is_coinbase() {
            let mut tx_undo = TxUndo::default();
            let mut value_in: Amount = 0;
            for (input_index, input) in tx.vin.iter().enumerate() {
                let coin = OverlayView::new(coins, &delta)
                    .get_coin(&input.prevout)?
                    .ok_or_else(|| reject(ValidationError::MissingOrSpent))?;
                if coin.is_coinbase && height - (coin.height as i32) < COINBASE_MATURITY {
                    return Err(reject(ValidationError::PrematureCoinbaseSpend));
                }
                value_in = value_in
                    .checked_add(coin.value)
                    .filter(|value| money_range(*value))
                    .ok_or_else(|| reject(ValidationError::InputValuesOutOfRange))?;
                delta.spend_coin(&input.prevout);
                if check_scripts {
                    checks.push(ScriptCheck {
                        tx_index,
                        input: input_index,
                        spent: coin.clone(),
                    });
                }
                tx_undo.spent.push(coin);
            }
            let value_out = tx
                .value_out()
                .ok_or_else(|| reject(ValidationError::OutputTotalTooLarge))?;
            if value_in < value_out {
                return Err(reject(ValidationError::InBelowOut));
            }
            fees = fees
                .checked_add(value_in - value_out)
                .filter(|value| money_range(*value))
                .ok_or_else(|| reject(ValidationError::FeeOutOfRange))?;
            undo.txs.push(tx_undo);
        }

        for (vout, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            delta.add_coin(
                &OutPoint::new(txid, vout as u32),
                Coin {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: coin_height,
                    is_coinbase: tx.is_coinbase(),
                },
            );
        }
    }

    let coinbase_out = block.transactions[0]
        .value_out()
        .ok_or_else(|| reject(ValidationError::OutputTotalTooLarge))?;
    if coinbase_out > fees + policy.block_subsidy(height) {
        return Err(reject(ValidationError::BadCoinbaseAmount));
    }

    let mut script_time = Duration::ZERO;
    if check_scripts && !checks.is_empty() {
        let flags = policy.script_flags(index, handle);
        let start = Instant::now();
        verify_scripts(verifier, &block.transactions, &checks, flags).map_err(reject)?;
        script_time = start.elapsed();
    }

    Ok(ConnectedBlock {
        delta,
        undo,
        fees,
        script_checks: checks.len(),
        script_time,
    })
}

/// Reverses `block` using its undo data: transactions back to front, each
/// one removing its outputs and then restoring the coins it spent.
pub fn disconnect_block<V: CoinView + ?Sized>(
    block: &Block,
    undo: &BlockUndo,
    coins: &V,
    hash: Hash256,
    height: i32,
) -> Result<DisconnectedBlock, ChainStateError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ChainStateError::corrupt(
            "undo data does not match block transactions",
            Some(hash),
            Some(height),
        ));
    }

    let mut delta = UtxoDelta::new();
    let mut clean = true;
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, vout as u32);
            let matches = OverlayView::new(coins, &delta)
                .get_coin(&outpoint)?
                .is_some_and(|coin| {
                    coin.value == output.value && coin.script_pubkey == output.script_pubkey
                });
            clean &= matches;
            delta.spend_coin(&outpoint);
        }

        if tx_index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[tx_index - 1];
        if tx_undo.spent.len() != tx.vin.len() {
            return Err(ChainStateError::corrupt(
                "undo data does not match transaction inputs",
                Some(hash),
                Some(height),
            ));
        }
        for (input, coin) in tx.vin.iter().zip(&tx_undo.spent).rev() {
            if OverlayView::new(coins, &delta).have_coin(&input.prevout)? {
                clean = false;
            }
            delta.add_coin(&input.prevout, coin.clone());
        }
    }

    Ok(DisconnectedBlock { delta, clean })
}
