//! Block and undo records on top of the rotating flat files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use cashd_consensus::Hash256;
use cashd_primitives::block::Block;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;
use crate::filemeta::{
    block_file_info_key, block_file_info_prefix, parse_block_file_info_key, FlatFileInfo,
    META_LAST_BLOCK_FILE_KEY,
};
use crate::flatfiles::{FileLocation, FlatFileStore};
use crate::undo::BlockUndo;

pub const DEFAULT_MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

pub struct BlockStore {
    blocks: FlatFileStore,
    undo: FlatFileStore,
    file_info: BTreeMap<u32, FlatFileInfo>,
    dirty_files: BTreeSet<u32>,
}

impl BlockStore {
    pub fn new(blocks: FlatFileStore, undo: FlatFileStore) -> Self {
        Self {
            blocks,
            undo,
            file_info: BTreeMap::new(),
            dirty_files: BTreeSet::new(),
        }
    }

    /// Opens `blk?????.dat`/`rev?????.dat` under `dir`.
    pub fn open(dir: &Path, max_file_size: u64) -> Result<Self, ChainStateError> {
        let blocks = FlatFileStore::blocks(dir, max_file_size)?;
        let undo = FlatFileStore::undo(dir, max_file_size)?;
        Ok(Self::new(blocks, undo))
    }

    /// Loads per-file bookkeeping written by earlier flushes.
    pub fn load_file_info<S: KeyValueStore>(&mut self, store: &S) -> Result<(), ChainStateError> {
        let mut loaded = BTreeMap::new();
        store.for_each_prefix(Column::Meta, block_file_info_prefix(), &mut |key, value| {
            if let (Some(file_id), Some(info)) =
                (parse_block_file_info_key(key), FlatFileInfo::decode(value))
            {
                loaded.insert(file_id, info);
            }
            Ok(())
        })?;
        self.file_info = loaded;
        self.dirty_files.clear();
        Ok(())
    }

    /// Reserves space for a block of `size` bytes and accounts for it in the
    /// file's bookkeeping.
    pub fn find_block_pos(
        &mut self,
        size: usize,
        height: i32,
        time: u32,
    ) -> Result<FileLocation, ChainStateError> {
        let location = self.blocks.reserve(size)?;
        let info = self.file_info.entry(location.file_id).or_default();
        info.size += location.record_len();
        info.add_block(height, time);
        self.dirty_files.insert(location.file_id);
        Ok(location)
    }

    pub fn write_block(&mut self, block: &Block, height: i32) -> Result<FileLocation, ChainStateError> {
        let bytes = block.to_bytes();
        let location = self.find_block_pos(bytes.len(), height, block.header.time)?;
        self.blocks.write_at(location, &bytes)?;
        Ok(location)
    }

    pub fn read_block(&self, location: FileLocation) -> Result<Block, ChainStateError> {
        let bytes = self.blocks.read(location)?;
        Block::from_bytes(&bytes)
            .map_err(|_| ChainStateError::corrupt("unreadable block data", None, None))
    }

    /// Appends the undo record for a block whose data lives in `block_file`.
    pub fn write_undo(
        &mut self,
        undo: &BlockUndo,
        prev_hash: &Hash256,
        block_file: u32,
    ) -> Result<FileLocation, ChainStateError> {
        let record = undo.to_record(prev_hash);
        let location = self.undo.append(&record)?;
        let info = self.file_info.entry(block_file).or_default();
        info.undo_size += location.record_len();
        self.dirty_files.insert(block_file);
        Ok(location)
    }

    pub fn read_undo(
        &self,
        location: FileLocation,
        prev_hash: &Hash256,
    ) -> Result<BlockUndo, ChainStateError> {
        let record = self.undo.read(location)?;
        BlockUndo::from_record(&record, prev_hash)
            .map_err(|_| ChainStateError::corrupt("undo record failed checksum", None, None))
    }

    pub fn file_info(&self, file_id: u32) -> Option<&FlatFileInfo> {
        self.file_info.get(&file_id)
    }

    pub fn write_file_info(&self, batch: &mut WriteBatch) -> usize {
        for file_id in &self.dirty_files {
            if let Some(info) = self.file_info.get(file_id) {
                batch.put(Column::Meta, block_file_info_key(*file_id), info.encode());
            }
        }
        if let Some(last) = self.file_info.keys().next_back() {
            batch.put(Column::Meta, META_LAST_BLOCK_FILE_KEY, last.to_le_bytes());
        }
        self.dirty_files.len()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_files.clear();
    }

    pub fn has_dirty_files(&self) -> bool {
        !self.dirty_files.is_empty()
    }

    /// Forces block and undo files to disk.
    pub fn sync(&self) -> Result<(), ChainStateError> {
        self.blocks.sync()?;
        self.undo.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::TxUndo;
    use crate::utxo::Coin;
    use cashd_consensus::{consensus_params, Network};
    use cashd_primitives::genesis_block;
    use cashd_storage::memory::MemoryStore;

    #[test]
    fn block_and_undo_round_trip_with_bookkeeping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BlockStore::open(dir.path(), 1 << 20).expect("open");
        let block = genesis_block(&consensus_params(Network::Regtest));

        let location = store.write_block(&block, 0).expect("write block");
        assert_eq!(store.read_block(location).expect("read block"), block);

        let undo = BlockUndo {
            txs: vec![TxUndo {
                spent: vec![Coin {
                    value: 1,
                    script_pubkey: vec![0x51],
                    height: 0,
                    is_coinbase: true,
                }],
            }],
        };
        let undo_pos = store
            .write_undo(&undo, &[7u8; 32], location.file_id)
            .expect("write undo");
        assert_eq!(store.read_undo(undo_pos, &[7u8; 32]).expect("read undo"), undo);
        assert!(store.read_undo(undo_pos, &[8u8; 32]).unwrap_err().is_fatal());

        let info = *store.file_info(location.file_id).expect("info");
        assert_eq!(info.blocks, 1);
        assert_eq!(info.size, location.record_len());
        assert_eq!(info.undo_size, undo_pos.record_len());

        let kv = MemoryStore::new();
        let mut batch = WriteBatch::new();
        assert_eq!(store.write_file_info(&mut batch), 1);
        kv.write_batch(&batch).expect("commit");
        store.clear_dirty();
        store.sync().expect("sync");

        let mut reopened = BlockStore::open(dir.path(), 1 << 20).expect("reopen");
        reopened.load_file_info(&kv).expect("load");
        assert_eq!(reopened.file_info(location.file_id), Some(&info));
        assert!(!reopened.has_dirty_files());
    }
}
