//! Consensus parameter definitions.

use crate::upgrades::{Activation, UpgradeIndex, UpgradeSchedule, MAX_NETWORK_UPGRADES};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_nonce: u32,
    pub genesis_bits: u32,
    pub subsidy_halving_interval: i32,
    pub upgrades: UpgradeSchedule,
    /// Median-time-past from which the replay protection sighash rule applies.
    pub replay_protection_time: Option<i64>,
    /// Block at the BIP34 activation height; BIP30 is only skipped on the
    /// chain that contains it.
    pub bip34_hash: Option<Hash256>,
    /// Historical blocks whose duplicate coinbases are allowed.
    pub bip30_exceptions: Vec<Checkpoint>,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub minimum_chain_work: Hash256,
    pub default_assume_valid: Option<Hash256>,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn upgrade(&self, idx: UpgradeIndex) -> Activation {
        self.upgrades[idx.as_usize()]
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Record marker in block import files.
    pub message_start: [u8; 4],
    pub default_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1..=64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }
    let padded = format!("{hex:0>64}");

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    let consensus = consensus_params(network);
    let (message_start, default_port) = match network {
        Network::Mainnet => ([0xe3, 0xe1, 0xf3, 0xe8], 8333),
        Network::Testnet => ([0xf4, 0xe5, 0xf3, 0xf4], 18333),
        Network::Regtest => ([0xda, 0xb5, 0xbf, 0xfa], 18444),
    };
    ChainParams {
        network,
        consensus,
        message_start,
        default_port,
    }
}

// Parameter tables are compile-time constants; a malformed entry is a build defect.
fn hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).expect("consensus parameter hash")
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            hash: hash(hex),
        })
        .collect()
}

const STANDARD_POW_LIMIT: &str = "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
const MONOLITH_ACTIVATION_TIME: i64 = 1_526_400_000;
const MAGNETIC_ANOMALY_ACTIVATION_TIME: i64 = 1_542_300_000;
const REPLAY_PROTECTION_ACTIVATION_TIME: i64 = 1_557_921_600;

fn mainnet_consensus_params() -> ConsensusParams {
    let upgrades: [Activation; MAX_NETWORK_UPGRADES] = [
        Activation::Height(173_805),
        Activation::Height(227_931),
        Activation::Height(363_725),
        Activation::Height(388_381),
        Activation::Height(419_328),
        Activation::Height(478_559),
        Activation::Height(504_032),
        Activation::MedianTime(MONOLITH_ACTIVATION_TIME),
        Activation::MedianTime(MAGNETIC_ANOMALY_ACTIVATION_TIME),
    ];
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        genesis_time: 1_231_006_505,
        genesis_nonce: 2_083_236_893,
        genesis_bits: 0x1d00_ffff,
        subsidy_halving_interval: 210_000,
        upgrades,
        replay_protection_time: Some(REPLAY_PROTECTION_ACTIVATION_TIME),
        bip34_hash: Some(hash(
            "000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8",
        )),
        bip30_exceptions: parse_checkpoints(&[
            (
                91_842,
                "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
            ),
            (
                91_880,
                "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
            ),
        ]),
        pow_limit: hash(STANDARD_POW_LIMIT),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        minimum_chain_work: hash(
            "0000000000000000000000000000000000000000002cb971dd56d1c583c20f90",
        ),
        default_assume_valid: Some(hash(
            "0000000000000000030abc968e1bd635736e880b946085c93152969b9a81a6e2",
        )),
        checkpoints: mainnet_checkpoints(),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    let upgrades: [Activation; MAX_NETWORK_UPGRADES] = [
        Activation::Height(514),
        Activation::Height(21_111),
        Activation::Height(330_776),
        Activation::Height(581_885),
        Activation::Height(770_112),
        Activation::Height(1_155_876),
        Activation::Height(1_188_698),
        Activation::MedianTime(MONOLITH_ACTIVATION_TIME),
        Activation::MedianTime(MAGNETIC_ANOMALY_ACTIVATION_TIME),
    ];
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        genesis_time: 1_296_688_602,
        genesis_nonce: 414_098_458,
        genesis_bits: 0x1d00_ffff,
        subsidy_halving_interval: 210_000,
        upgrades,
        replay_protection_time: Some(REPLAY_PROTECTION_ACTIVATION_TIME),
        bip34_hash: Some(hash(
            "0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8",
        )),
        bip30_exceptions: Vec::new(),
        pow_limit: hash(STANDARD_POW_LIMIT),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        minimum_chain_work: [0u8; 32],
        default_assume_valid: None,
        checkpoints: parse_checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    let upgrades: [Activation; MAX_NETWORK_UPGRADES] = [
        Activation::Height(0),
        Activation::Never,
        Activation::Height(1_251),
        Activation::Height(1_351),
        Activation::Height(576),
        Activation::Height(0),
        Activation::Height(0),
        Activation::MedianTime(MONOLITH_ACTIVATION_TIME),
        Activation::MedianTime(MAGNETIC_ANOMALY_ACTIVATION_TIME),
    ];
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        genesis_time: 1_296_688_602,
        genesis_nonce: 2,
        genesis_bits: 0x207f_ffff,
        subsidy_halving_interval: 150,
        upgrades,
        replay_protection_time: Some(REPLAY_PROTECTION_ACTIVATION_TIME),
        bip34_hash: None,
        bip30_exceptions: Vec::new(),
        pow_limit: hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        minimum_chain_work: [0u8; 32],
        default_assume_valid: None,
        checkpoints: Vec::new(),
    }
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[
        (
            11_111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        (
            33_333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        (
            74_000,
            "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
        ),
        (
            105_000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
        ),
        (
            134_444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
        ),
        (
            168_000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
        ),
        (
            193_000,
            "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
        ),
        (
            210_000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
        ),
        (
            216_116,
            "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e",
        ),
        (
            225_430,
            "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932",
        ),
        (
            250_000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
        ),
        (
            279_000,
            "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40",
        ),
        (
            295_000,
            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
        ),
        (
            478_559,
            "000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_reverses_byte_order() {
        let genesis = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let parsed = hash256_from_hex(genesis).expect("parse");
        assert_eq!(parsed[31], 0x00);
        assert_eq!(parsed[0], 0x6f);
        assert_eq!(hash256_to_hex(&parsed), genesis);
    }

    #[test]
    fn hex_parsing_pads_short_input_and_rejects_junk() {
        let one = hash256_from_hex("0x1").expect("short");
        assert_eq!(one[0], 1);
        assert!(one[1..].iter().all(|byte| *byte == 0));
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex(&"f".repeat(65)), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
    }

    #[test]
    fn every_network_builds_params() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            assert_eq!(params.consensus.network, network);
            assert_eq!(Network::parse(network.as_str()), Some(network));
        }
    }

    #[test]
    fn mainnet_difficulty_interval_and_checkpoints() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.difficulty_adjustment_interval(), 2016);
        assert_eq!(params.last_checkpoint_height(), 478_559);
        assert!(params.checkpoint_at(11_111).is_some());
        assert!(params.checkpoint_at(11_112).is_none());
        assert_eq!(params.bip30_exceptions.len(), 2);
    }
}
