//! Rule activation and difficulty lookups the chain state consults while
//! accepting and connecting blocks.

use cashd_consensus::constants::{
    script_flags, LEGACY_MAX_BLOCK_SIZE, MONOLITH_MAX_BLOCK_SIZE, UAHF_MAX_BLOCK_SIZE,
};
use cashd_consensus::money::Amount;
use cashd_consensus::upgrades::{activation_height, network_upgrade_active, UpgradeIndex};
use cashd_consensus::{block_subsidy, ConsensusParams};
use cashd_pow::difficulty::{get_next_work_required, required_window, DifficultyError};
use cashd_primitives::block::BlockHeader;

use crate::blockindex::BlockHandle;
use crate::index::ChainIndex;
use crate::validation::BlockContext;

/// Answers "which rules apply to this block". Everything except
/// [`PolicyOracle::params`] has a default derived from the consensus
/// parameters; implementations override what they need to.
pub trait PolicyOracle: Send + Sync {
    fn params(&self) -> &ConsensusParams;

    fn upgrade_active(&self, height: i32, prev_median_time: i64, upgrade: UpgradeIndex) -> bool {
        network_upgrade_active(height, prev_median_time, &self.params().upgrades, upgrade)
    }

    fn is_uahf_enabled(&self, height: i32) -> bool {
        self.upgrade_active(height, 0, UpgradeIndex::Uahf)
    }

    fn is_monolith_enabled(&self, height: i32, prev_median_time: i64) -> bool {
        self.upgrade_active(height, prev_median_time, UpgradeIndex::Monolith)
    }

    fn is_replay_protection_enabled(&self, prev_median_time: i64) -> bool {
        self.params()
            .replay_protection_time
            .is_some_and(|activation| prev_median_time >= activation)
    }

    fn block_subsidy(&self, height: i32) -> Amount {
        block_subsidy(height, self.params())
    }

    fn max_block_size_at(&self, height: i32, prev_median_time: i64) -> u64 {
        if self.is_monolith_enabled(height, prev_median_time) {
            MONOLITH_MAX_BLOCK_SIZE
        } else if self.is_uahf_enabled(height) {
            UAHF_MAX_BLOCK_SIZE
        } else {
            LEGACY_MAX_BLOCK_SIZE
        }
    }

    fn script_flags_at(&self, height: i32, prev_median_time: i64) -> u32 {
        let active = |upgrade| self.upgrade_active(height, prev_median_time, upgrade);
        let mut flags = script_flags::VERIFY_NONE;
        if active(UpgradeIndex::Bip16) {
            flags |= script_flags::VERIFY_P2SH;
        }
        if active(UpgradeIndex::Bip66) {
            flags |= script_flags::VERIFY_DERSIG;
        }
        if active(UpgradeIndex::Bip65) {
            flags |= script_flags::VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if active(UpgradeIndex::Csv) {
            flags |= script_flags::VERIFY_CHECKSEQUENCEVERIFY;
        }
        if active(UpgradeIndex::Uahf) {
            flags |= script_flags::VERIFY_STRICTENC | script_flags::ENABLE_SIGHASH_FORKID;
        }
        if active(UpgradeIndex::Daa) {
            flags |= script_flags::VERIFY_LOW_S | script_flags::VERIFY_NULLFAIL;
        }
        if active(UpgradeIndex::Monolith) {
            flags |= script_flags::ENABLE_MONOLITH_OPCODES;
        }
        if active(UpgradeIndex::MagneticAnomaly) {
            flags |= script_flags::ENABLE_CHECKDATASIG
                | script_flags::VERIFY_SIGPUSHONLY
                | script_flags::VERIFY_CLEANSTACK;
        }
        if self.is_replay_protection_enabled(prev_median_time) {
            flags |= script_flags::ENABLE_REPLAY_PROTECTION;
        }
        flags
    }

    /// Script flags for the block at `handle`.
    fn script_flags(&self, index: &ChainIndex, handle: BlockHandle) -> u32 {
        let (height, prev_median_time) = position(index, handle);
        self.script_flags_at(height, prev_median_time)
    }

    /// Size limit for the block at `handle`.
    fn max_block_size(&self, index: &ChainIndex, handle: BlockHandle) -> u64 {
        let (height, prev_median_time) = position(index, handle);
        self.max_block_size_at(height, prev_median_time)
    }

    /// Compact target a child of `prev` carrying `header` must commit to.
    fn next_work_required(
        &self,
        index: &ChainIndex,
        prev: BlockHandle,
        header: &BlockHeader,
    ) -> Result<u32, DifficultyError> {
        let window = index.header_window(prev, required_window(index.get(prev).height, self.params()));
        get_next_work_required(&window, i64::from(header.time), self.params())
    }

    fn bip34_active(&self, index: &ChainIndex, handle: BlockHandle) -> bool {
        let (height, prev_median_time) = position(index, handle);
        self.upgrade_active(height, prev_median_time, UpgradeIndex::Bip34)
    }

    /// Whether outputs of the block at `handle` may not overwrite unspent
    /// coins. Off for the historical exceptions and for any chain that went
    /// through the BIP34 activation block.
    fn enforce_bip30(&self, index: &ChainIndex, handle: BlockHandle) -> bool {
        let params = self.params();
        let node = index.get(handle);
        if params
            .bip30_exceptions
            .iter()
            .any(|exception| exception.height == node.height && exception.hash == node.hash)
        {
            return false;
        }
        match (
            activation_height(&params.upgrades, UpgradeIndex::Bip34),
            params.bip34_hash,
            node.prev,
        ) {
            (Some(bip34_height), Some(bip34_hash), Some(prev)) => index
                .get_ancestor(prev, bip34_height)
                .map_or(true, |ancestor| index.get(ancestor).hash != bip34_hash),
            _ => true,
        }
    }

    /// Contextual block rules for the block at `handle`.
    fn block_context(&self, index: &ChainIndex, handle: BlockHandle) -> BlockContext {
        let (height, prev_median_time) = position(index, handle);
        let lock_time_cutoff = if self.upgrade_active(height, prev_median_time, UpgradeIndex::Csv) {
            prev_median_time
        } else {
            index.get(handle).time()
        };
        BlockContext {
            height,
            lock_time_cutoff,
            max_block_size: self.max_block_size_at(height, prev_median_time),
            bip34_active: self.upgrade_active(height, prev_median_time, UpgradeIndex::Bip34),
            enforce_min_tx_size: self.upgrade_active(
                height,
                prev_median_time,
                UpgradeIndex::MagneticAnomaly,
            ),
        }
    }
}

/// Height of `handle` and the median-time-past of its parent.
fn position(index: &ChainIndex, handle: BlockHandle) -> (i32, i64) {
    let node = index.get(handle);
    let prev_median_time = node
        .prev
        .map(|prev| index.median_time_past(prev))
        .unwrap_or(0);
    (node.height, prev_median_time)
}

/// The network's own rules.
#[derive(Clone, Debug)]
pub struct ConsensusPolicy {
    params: ConsensusParams,
}

impl ConsensusPolicy {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }
}

impl PolicyOracle for ConsensusPolicy {
    fn params(&self) -> &ConsensusParams {
        &self.params
    }
}
