//! Proof-of-work targets, chain work and difficulty adjustment.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, compact_to_u256, get_next_work_required, required_window, u256_to_compact,
    CompactError, DifficultyError, HeaderInfo,
};
pub use validation::{check_proof_of_work, validate_pow, PowError};
