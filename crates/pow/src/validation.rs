use cashd_consensus::{ConsensusParams, Hash256};

use crate::difficulty::{compact_to_u256, hash_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the target encoded by `bits`, and that the
/// target itself is within the network's limit.
pub fn validate_pow(hash: &Hash256, bits: u32, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }
    if target > hash_to_u256(&params.pow_limit) {
        return Err(PowError::InvalidBits("pow target above limit"));
    }
    if hash_to_u256(hash) > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ConsensusParams) -> bool {
    validate_pow(hash, bits, params).is_ok()
}
