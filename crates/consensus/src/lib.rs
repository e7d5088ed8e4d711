//! Consensus constants, parameters, and upgrade schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;
pub mod upgrades;

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint,
    ConsensusParams, HexError, Network,
};
pub use rewards::block_subsidy;
pub use upgrades::{network_upgrade_active, UpgradeIndex};
