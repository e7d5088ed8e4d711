//! Consensus-wide constants shared across validation.

/// Serialized size limit before the UAHF fork.
pub const LEGACY_MAX_BLOCK_SIZE: u64 = 1_000_000;
/// Serialized size limit from UAHF until the monolith upgrade.
pub const UAHF_MAX_BLOCK_SIZE: u64 = 8_000_000;
/// Serialized size limit once the monolith upgrade is active.
pub const MONOLITH_MAX_BLOCK_SIZE: u64 = 32_000_000;
/// Sigop budget for every started megabyte of block size.
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;
/// Transactions larger than this are never valid.
pub const MAX_TX_SIZE: u64 = 1_000_000;
/// Transactions smaller than this are invalid once magnetic anomaly is active.
pub const MIN_TX_SIZE: u64 = 100;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Headers may not be timestamped further than this ahead of adjusted time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks whose median timestamp is the median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock times below this are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Script verification flags handed to the script verifier.
pub mod script_flags {
    pub const VERIFY_NONE: u32 = 0;
    pub const VERIFY_P2SH: u32 = 1 << 0;
    pub const VERIFY_STRICTENC: u32 = 1 << 1;
    pub const VERIFY_DERSIG: u32 = 1 << 2;
    pub const VERIFY_LOW_S: u32 = 1 << 3;
    pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
    pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
    pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
    pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
    pub const VERIFY_NULLFAIL: u32 = 1 << 14;
    pub const ENABLE_SIGHASH_FORKID: u32 = 1 << 16;
    pub const ENABLE_REPLAY_PROTECTION: u32 = 1 << 17;
    pub const ENABLE_MONOLITH_OPCODES: u32 = 1 << 18;
    pub const ENABLE_CHECKDATASIG: u32 = 1 << 19;
}
