//! Difficulty and compact target utilities.

use cashd_consensus::upgrades::{network_upgrade_active, UpgradeIndex};
use cashd_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    InsufficientHistory { needed: usize, have: usize },
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::InsufficientHistory { needed, have } => {
                write!(f, "difficulty needs {needed} headers, have {have}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of a header's index entry that retargeting looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i32,
    pub time: i64,
    pub bits: u32,
    pub chain_work: U256,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if size <= 3 {
        word >>= 8 * (3 - size);
    }
    if word != 0 && (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }
    if size <= 3 {
        return Ok(U256::from(word));
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(CompactError::Overflow);
    }
    Ok(U256::from(word) << (8 * (size - 3)))
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    // The mantissa is signed; keep the sign bit clear.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash)
}

/// Expected number of hashes needed to find a block at `bits`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    // 2**256 / (target + 1) without leaving 256 bits.
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

/// Number of trailing headers (ending at the parent) that
/// [`get_next_work_required`] needs for a block at `prev_height + 1`.
pub fn required_window(prev_height: i32, params: &ConsensusParams) -> usize {
    let next_height = prev_height + 1;
    let interval = params.difficulty_adjustment_interval();
    let wanted = if params.pow_no_retargeting {
        1
    } else if daa_active(next_height, params) {
        DAA_WINDOW + 3
    } else if i64::from(next_height) % interval == 0 {
        interval as usize
    } else if params.pow_allow_min_difficulty_blocks {
        (i64::from(prev_height) % interval) as usize + 1
    } else {
        EDA_BLOCKS + MEDIAN_SPAN
    };
    wanted.min(next_height.max(0) as usize)
}

/// Compact target required for the block following `chain.last()`.
///
/// `chain` must be contiguous by height and end at the new block's parent;
/// see [`required_window`] for how much history to pass.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = u256_to_compact(hash_to_u256(&params.pow_limit));
    let Some(last) = chain.last() else {
        return Ok(pow_limit_bits);
    };
    ensure_contiguous(chain)?;

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }
    if daa_active(last.height + 1, params) {
        return cash_work_required(chain, next_block_time, params);
    }
    eda_work_required(chain, next_block_time, params)
}

const DAA_WINDOW: usize = 144;
const EDA_BLOCKS: usize = 6;
const MEDIAN_SPAN: usize = 11;

fn daa_active(height: i32, params: &ConsensusParams) -> bool {
    network_upgrade_active(height, 0, &params.upgrades, UpgradeIndex::Daa)
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if i64::from(header.height) != i64::from(base) + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

fn index_of(chain: &[HeaderInfo], height: i32) -> Result<usize, DifficultyError> {
    let offset = i64::from(height) - i64::from(chain[0].height);
    if offset < 0 {
        return Err(DifficultyError::InsufficientHistory {
            needed: (i64::from(chain[chain.len() - 1].height) - i64::from(height) + 1) as usize,
            have: chain.len(),
        });
    }
    Ok(offset as usize)
}

fn median_time_past(chain: &[HeaderInfo], idx: usize) -> i64 {
    let start = (idx + 1).saturating_sub(MEDIAN_SPAN);
    let mut times: Vec<i64> = chain[start..=idx].iter().map(|header| header.time).collect();
    times.sort_unstable();
    times[times.len() / 2]
}

fn pow_limit(params: &ConsensusParams) -> U256 {
    hash_to_u256(&params.pow_limit)
}

/// Original two-week retarget with the emergency adjustment in between.
fn eda_work_required(
    chain: &[HeaderInfo],
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let last_idx = chain.len() - 1;
    let last = chain[last_idx];
    let next_height = last.height + 1;
    let interval = params.difficulty_adjustment_interval();
    let pow_limit_bits = u256_to_compact(pow_limit(params));

    if i64::from(next_height) % interval == 0 {
        let first = chain[index_of(chain, next_height - interval as i32)?];
        return calculate_next_work_required(&last, first.time, params);
    }

    if params.pow_allow_min_difficulty_blocks {
        if next_block_time > last.time + 2 * params.pow_target_spacing {
            return Ok(pow_limit_bits);
        }
        // Last block that was not mined under the min-difficulty exception.
        let mut idx = last_idx;
        while idx > 0
            && i64::from(chain[idx].height) % interval != 0
            && chain[idx].bits == pow_limit_bits
        {
            idx -= 1;
        }
        return Ok(chain[idx].bits);
    }

    if last.bits == pow_limit_bits {
        return Ok(pow_limit_bits);
    }
    if next_height < (EDA_BLOCKS + 1) as i32 {
        return Ok(last.bits);
    }
    let six_back = index_of(chain, next_height - (EDA_BLOCKS + 1) as i32)?;
    let elapsed = median_time_past(chain, last_idx) - median_time_past(chain, six_back);
    if elapsed < 12 * 3600 {
        return Ok(last.bits);
    }

    let mut target = compact_to_u256(last.bits)?;
    target = target.saturating_add(target >> 2);
    Ok(u256_to_compact(target.min(pow_limit(params))))
}

pub fn calculate_next_work_required(
    last: &HeaderInfo,
    first_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }
    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_block_time).clamp(timespan / 4, timespan * 4);

    let target = compact_to_u256(last.bits)?;
    let scaled = target.full_mul(U256::from(actual as u64)) / U512::from(timespan as u64);
    let next = U256::try_from(scaled).unwrap_or(U256::MAX);
    Ok(u256_to_compact(next.min(pow_limit(params))))
}

/// Median-of-three by timestamp among `idx` and its two parents.
fn suitable_block(chain: &[HeaderInfo], idx: usize) -> usize {
    let mut blocks = [idx - 2, idx - 1, idx];
    if chain[blocks[0]].time > chain[blocks[2]].time {
        blocks.swap(0, 2);
    }
    if chain[blocks[0]].time > chain[blocks[1]].time {
        blocks.swap(0, 1);
    }
    if chain[blocks[1]].time > chain[blocks[2]].time {
        blocks.swap(1, 2);
    }
    blocks[1]
}

/// Work-based moving average over the last 144 blocks.
fn cash_work_required(
    chain: &[HeaderInfo],
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let last_idx = chain.len() - 1;
    let last = chain[last_idx];
    let pow_limit = pow_limit(params);

    if params.pow_allow_min_difficulty_blocks
        && next_block_time > last.time + 2 * params.pow_target_spacing
    {
        return Ok(u256_to_compact(pow_limit));
    }
    if chain.len() < DAA_WINDOW + 3 {
        return Err(DifficultyError::InsufficientHistory {
            needed: DAA_WINDOW + 3,
            have: chain.len(),
        });
    }

    let last = chain[suitable_block(chain, last_idx)];
    let first = chain[suitable_block(chain, last_idx - DAA_WINDOW)];

    let spacing = params.pow_target_spacing;
    let actual = (last.time - first.time).clamp(72 * spacing, 288 * spacing);
    let work = last.chain_work.saturating_sub(first.chain_work)
        * U256::from(spacing as u64)
        / U256::from(actual as u64);
    if work.is_zero() {
        return Ok(u256_to_compact(pow_limit));
    }
    // (2**256 - work) / work
    let next = (!work + U256::one()) / work;
    Ok(u256_to_compact(next.min(pow_limit)))
}
