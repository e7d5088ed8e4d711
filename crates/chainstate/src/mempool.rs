//! The mempool as seen from the chain state.

use cashd_primitives::transaction::Transaction;

use crate::utxo::CoinView;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxPoolErrorKind {
    AlreadyInPool,
    ConflictingInput,
    MissingInput,
    PoolFull,
    Invalid,
    Internal,
}

#[derive(Clone, Debug)]
pub struct TxPoolError {
    pub kind: TxPoolErrorKind,
    pub message: String,
}

impl TxPoolError {
    pub fn new(kind: TxPoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TxPoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TxPoolError {}

pub trait TxPool {
    /// Drops transactions confirmed by a newly connected block, along with
    /// anything that conflicts with them.
    fn remove_confirmed(&mut self, txs: &[Transaction]);

    /// Offers a transaction from a disconnected block back to the pool.
    /// `coins` reflects the chain after the disconnect.
    fn try_readmit(&mut self, tx: &Transaction, coins: &dyn CoinView) -> Result<(), TxPoolError>;
}

/// Pool that holds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTxPool;

impl TxPool for NullTxPool {
    fn remove_confirmed(&mut self, _txs: &[Transaction]) {}

    fn try_readmit(&mut self, _tx: &Transaction, _coins: &dyn CoinView) -> Result<(), TxPoolError> {
        Ok(())
    }
}
