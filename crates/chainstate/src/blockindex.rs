//! Block index entries and their on-disk form.

use cashd_consensus::Hash256;
use cashd_primitives::block::{BlockHeader, HEADER_SIZE};
use cashd_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;

use crate::flatfiles::FileLocation;

const DISK_BLOCK_INDEX_VERSION: u8 = 1;

/// Position of a [`BlockIndex`] inside the index arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockHandle(u32);

impl BlockHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Validity level in the low bits plus independent data/failure flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct BlockStatus(u32);

impl BlockStatus {
    pub const VALID_UNKNOWN: u32 = 0;
    /// Header parses, PoW and timestamp rules hold.
    pub const VALID_HEADER: u32 = 1;
    /// Parent known and header contextually valid.
    pub const VALID_TREE: u32 = 2;
    /// Body received and context-free checks passed.
    pub const VALID_TRANSACTIONS: u32 = 3;
    /// Outputs do not overspend, no double spends, coinbase ok.
    pub const VALID_CHAIN: u32 = 4;
    /// Scripts verified too.
    pub const VALID_SCRIPTS: u32 = 5;
    pub const VALID_MASK: u32 = 0b111;

    pub const HAVE_DATA: u32 = 1 << 3;
    pub const HAVE_UNDO: u32 = 1 << 4;
    pub const FAILED_VALID: u32 = 1 << 5;
    pub const FAILED_CHILD: u32 = 1 << 6;
    pub const FAILED_MASK: u32 = Self::FAILED_VALID | Self::FAILED_CHILD;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn validity(self) -> u32 {
        self.0 & Self::VALID_MASK
    }

    pub fn is_valid(self, level: u32) -> bool {
        !self.is_failed() && self.validity() >= level
    }

    /// Raises the validity level; returns whether anything changed.
    pub fn raise_validity(&mut self, level: u32) -> bool {
        if self.is_failed() || self.validity() >= level {
            return false;
        }
        self.0 = (self.0 & !Self::VALID_MASK) | level;
        true
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    pub fn is_failed(self) -> bool {
        self.has(Self::FAILED_MASK)
    }

    pub fn has_data(self) -> bool {
        self.has(Self::HAVE_DATA)
    }

    pub fn has_undo(self) -> bool {
        self.has(Self::HAVE_UNDO)
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of a block at `height` points to.
pub fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub prev: Option<BlockHandle>,
    pub skip: Option<BlockHandle>,
    pub height: i32,
    pub chain_work: U256,
    pub status: BlockStatus,
    pub tx_count: u32,
    /// Transactions from genesis through this block; 0 while any ancestor
    /// body is missing.
    pub chain_tx_count: u64,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
    pub time_max: u32,
    /// Order in which the block became connectable; 0 when not yet assigned.
    pub sequence_id: u64,
}

impl BlockIndex {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            time_max: header.time,
            header,
            prev: None,
            skip: None,
            height: 0,
            chain_work: U256::zero(),
            status: BlockStatus::from_bits(BlockStatus::VALID_HEADER),
            tx_count: 0,
            chain_tx_count: 0,
            data_pos: None,
            undo_pos: None,
            sequence_id: 0,
        }
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block
    }

    pub fn time(&self) -> i64 {
        i64::from(self.header.time)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block == [0u8; 32]
    }

    pub fn to_disk(&self) -> DiskBlockIndex {
        DiskBlockIndex {
            header: self.header.clone(),
            height: self.height,
            status: self.status.bits(),
            tx_count: self.tx_count,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
        }
    }
}

/// Persisted subset of a [`BlockIndex`]. Linkage, work, cumulative counts and
/// sequence ids are rebuilt on load.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
}

impl DiskBlockIndex {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(1 + HEADER_SIZE + 12 + 2 * 17);
        encoder.write_u8(DISK_BLOCK_INDEX_VERSION);
        encoder.write_bytes(&self.header.to_bytes());
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        write_location(&mut encoder, self.data_pos);
        write_location(&mut encoder, self.undo_pos);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != DISK_BLOCK_INDEX_VERSION {
            return Err(DecodeError::InvalidData("unsupported block index version"));
        }
        let header_bytes = decoder.read_fixed::<HEADER_SIZE>()?;
        let header = BlockHeader::from_bytes(&header_bytes)?;
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let data_pos = read_location(&mut decoder)?;
        let undo_pos = read_location(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            status,
            tx_count,
            data_pos,
            undo_pos,
        })
    }
}

fn write_location(encoder: &mut Encoder, location: Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_u8(1);
            encoder.write_bytes(&location.encode());
        }
        None => encoder.write_u8(0),
    }
}

fn read_location(decoder: &mut Decoder<'_>) -> Result<Option<FileLocation>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => {
            let bytes = decoder.read_fixed::<{ FileLocation::ENCODED_LEN }>()?;
            FileLocation::decode(&bytes)
                .map(Some)
                .ok_or(DecodeError::InvalidData("invalid file location"))
        }
        _ => Err(DecodeError::InvalidData("invalid file location tag")),
    }
}
