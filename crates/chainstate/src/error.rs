use std::fmt;

use cashd_consensus::{hash256_to_hex, Hash256};
use cashd_storage::StoreError;

use crate::flatfiles::FlatFileError;
use crate::validation::ValidationError;

/// A block that broke a consensus rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRejection {
    pub hash: Hash256,
    pub height: i32,
    pub error: ValidationError,
}

/// An internal invariant that no longer holds. Block processing must stop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Corruption {
    pub reason: &'static str,
    pub hash: Option<Hash256>,
    pub height: Option<i32>,
}

#[derive(Debug)]
pub enum ChainStateError {
    Invalid(BlockRejection),
    Corrupt(Corruption),
    Store(StoreError),
    FlatFile(FlatFileError),
    Interrupted,
    UnknownBlock(Hash256),
    OrphanHeader(Hash256),
}

impl ChainStateError {
    pub fn invalid(hash: Hash256, height: i32, error: ValidationError) -> Self {
        ChainStateError::Invalid(BlockRejection {
            hash,
            height,
            error,
        })
    }

    pub fn corrupt(reason: &'static str, hash: Option<Hash256>, height: Option<i32>) -> Self {
        ChainStateError::Corrupt(Corruption {
            reason,
            hash,
            height,
        })
    }

    /// Consensus rule violations; the node keeps running.
    pub fn is_consensus(&self) -> bool {
        matches!(self, ChainStateError::Invalid(_))
    }

    /// Broken invariants; continuing risks a corrupt ledger.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainStateError::Corrupt(_))
    }

    /// Disk and backend failures; the block was not shown to be invalid.
    pub fn is_system(&self) -> bool {
        matches!(self, ChainStateError::Store(_) | ChainStateError::FlatFile(_))
    }

    pub fn rejection(&self) -> Option<&BlockRejection> {
        match self {
            ChainStateError::Invalid(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Invalid(rejection) => write!(
                f,
                "block {} at height {} rejected: {}",
                hash256_to_hex(&rejection.hash),
                rejection.height,
                rejection.error
            ),
            ChainStateError::Corrupt(corruption) => {
                write!(f, "chain state corrupt: {}", corruption.reason)?;
                if let Some(hash) = &corruption.hash {
                    write!(f, " (block {}", hash256_to_hex(hash))?;
                    if let Some(height) = corruption.height {
                        write!(f, " height {height}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Interrupted => write!(f, "interrupted"),
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "unknown block {}", hash256_to_hex(hash))
            }
            ChainStateError::OrphanHeader(hash) => {
                write!(f, "parent of {} not known", hash256_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}
