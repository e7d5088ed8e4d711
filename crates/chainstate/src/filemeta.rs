//! Per-file bookkeeping for block files, kept in the meta column.

use cashd_primitives::encoding::{Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"flatfiles:blocks:last_file";

const META_BLOCK_FILE_INFO_PREFIX: &[u8] = b"flatfiles:blocks:file:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub undo_size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl FlatFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(36);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u64_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le().ok()?;
        let size = decoder.read_u64_le().ok()?;
        let undo_size = decoder.read_u64_le().ok()?;
        let height_first = decoder.read_i32_le().ok()?;
        let height_last = decoder.read_i32_le().ok()?;
        let time_first = decoder.read_u32_le().ok()?;
        let time_last = decoder.read_u32_le().ok()?;
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            blocks,
            size,
            undo_size,
            height_first,
            height_last,
            time_first,
            time_last,
        })
    }
}

pub fn block_file_info_key(file_id: u32) -> [u8; META_BLOCK_FILE_INFO_PREFIX.len() + 4] {
    let mut key = [0u8; META_BLOCK_FILE_INFO_PREFIX.len() + 4];
    key[0..META_BLOCK_FILE_INFO_PREFIX.len()].copy_from_slice(META_BLOCK_FILE_INFO_PREFIX);
    key[META_BLOCK_FILE_INFO_PREFIX.len()..].copy_from_slice(&file_id.to_le_bytes());
    key
}

pub fn block_file_info_prefix() -> &'static [u8] {
    META_BLOCK_FILE_INFO_PREFIX
}

pub fn parse_block_file_info_key(key: &[u8]) -> Option<u32> {
    if key.len() != META_BLOCK_FILE_INFO_PREFIX.len() + 4 {
        return None;
    }
    if !key.starts_with(META_BLOCK_FILE_INFO_PREFIX) {
        return None;
    }
    let mut id_bytes = [0u8; 4];
    id_bytes.copy_from_slice(&key[META_BLOCK_FILE_INFO_PREFIX.len()..]);
    Some(u32::from_le_bytes(id_bytes))
}
