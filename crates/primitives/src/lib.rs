//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod genesis;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockHeader, HEADER_SIZE};
pub use genesis::genesis_block;
pub use hash::{sha256, sha256d};
pub use merkle::{block_merkle_root, merkle_root};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
