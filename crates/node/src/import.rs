//! Bootstrap import of `magic | len | block` record files.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use cashd_chainstate::{ChainState, ChainStateError};
use cashd_consensus::constants::MONOLITH_MAX_BLOCK_SIZE;
use cashd_consensus::{hash256_to_hex, Hash256};
use cashd_log::{log_debug, log_info, log_warn};
use cashd_primitives::block::{Block, HEADER_SIZE};
use cashd_storage::KeyValueStore;

use crate::mempool::TxMempool;

const PROGRESS_INTERVAL: u64 = 10_000;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportStats {
    pub records: u64,
    pub accepted: u64,
    pub known: u64,
    pub rejected: u64,
    pub undecodable: u64,
    /// Blocks still waiting for their parent when the file ended.
    pub orphans: u64,
    pub skipped_bytes: u64,
}

#[derive(Debug)]
pub enum ImportError {
    Open { path: PathBuf, err: io::Error },
    Read(io::Error),
    Chain(ChainStateError),
    Poisoned,
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Open { path, err } => write!(f, "failed to open {}: {err}", path.display()),
            ImportError::Read(err) => write!(f, "failed to read block records: {err}"),
            ImportError::Chain(err) => write!(f, "{err}"),
            ImportError::Poisoned => write!(f, "chainstate lock poisoned"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<ChainStateError> for ImportError {
    fn from(err: ChainStateError) -> Self {
        ImportError::Chain(err)
    }
}

impl ImportError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ImportError::Chain(ChainStateError::Interrupted))
    }
}

enum Record {
    Block(Vec<u8>),
    End,
}

/// Scans for the next `magic` and returns the payload behind it. Records
/// with an impossible length are skipped and scanning resumes.
fn next_record<R: Read>(
    reader: &mut R,
    magic: [u8; 4],
    stats: &mut ImportStats,
) -> io::Result<Record> {
    let mut window = [0u8; 4];
    let mut filled = 0usize;
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte)? == 0 {
            stats.skipped_bytes += filled as u64;
            return Ok(Record::End);
        }
        if filled < window.len() {
            window[filled] = byte[0];
            filled += 1;
        } else {
            window.rotate_left(1);
            window[3] = byte[0];
            stats.skipped_bytes += 1;
        }
        if filled < window.len() || window != magic {
            continue;
        }

        let mut len = [0u8; 4];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(Record::End),
            Err(err) => return Err(err),
        }
        let len = u32::from_le_bytes(len) as usize;
        if len < HEADER_SIZE || len as u64 > MONOLITH_MAX_BLOCK_SIZE {
            log_debug!("Import: skipping record with length {len}");
            stats.skipped_bytes += 8;
            filled = 0;
            continue;
        }
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => return Ok(Record::Block(payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                log_warn!("Import: truncated record at end of file");
                return Ok(Record::End);
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn import_file<S: KeyValueStore>(
    path: &Path,
    magic: [u8; 4],
    chainstate: &Mutex<ChainState<S>>,
    mempool: &Mutex<TxMempool>,
    interrupt: &AtomicBool,
) -> Result<ImportStats, ImportError> {
    let file = File::open(path).map_err(|err| ImportError::Open {
        path: path.to_path_buf(),
        err,
    })?;
    log_info!("Importing blocks from {}", path.display());
    let stats = import_reader(BufReader::new(file), magic, chainstate, mempool, interrupt)?;
    log_info!(
        "Imported {}: {} records, {} accepted, {} known, {} rejected, {} orphaned",
        path.display(),
        stats.records,
        stats.accepted,
        stats.known,
        stats.rejected,
        stats.orphans
    );
    Ok(stats)
}

/// Feeds every block record of `reader` to the chain state. Blocks whose
/// parent is not known yet are held back until it shows up.
pub fn import_reader<R: Read, S: KeyValueStore>(
    mut reader: R,
    magic: [u8; 4],
    chainstate: &Mutex<ChainState<S>>,
    mempool: &Mutex<TxMempool>,
    interrupt: &AtomicBool,
) -> Result<ImportStats, ImportError> {
    let mut stats = ImportStats::default();
    let mut waiting: HashMap<Hash256, Vec<Block>> = HashMap::new();

    loop {
        if interrupt.load(Ordering::Relaxed) {
            return Err(ImportError::Chain(ChainStateError::Interrupted));
        }
        let payload = match next_record(&mut reader, magic, &mut stats) {
            Ok(Record::Block(payload)) => payload,
            Ok(Record::End) => break,
            Err(err) => return Err(ImportError::Read(err)),
        };
        stats.records += 1;
        if stats.records % PROGRESS_INTERVAL == 0 {
            log_info!("Import: {} records read", stats.records);
        }
        let block = match Block::from_bytes(&payload) {
            Ok(block) => block,
            Err(err) => {
                log_warn!("Import: undecodable block record: {err}");
                stats.undecodable += 1;
                continue;
            }
        };

        let (known, parent_known) = {
            let chain = chainstate.lock().map_err(|_| ImportError::Poisoned)?;
            let known = chain
                .lookup(&block.hash())
                .is_some_and(|handle| chain.index().get(handle).status.has_data());
            (known, chain.lookup(&block.header.prev_block).is_some())
        };
        if known {
            stats.known += 1;
            continue;
        }
        if !parent_known {
            waiting
                .entry(block.header.prev_block)
                .or_default()
                .push(block);
            continue;
        }

        let mut ready = vec![block];
        while let Some(block) = ready.pop() {
            let hash = block.hash();
            process_block(&block, chainstate, mempool, interrupt, &mut stats)?;
            if let Some(children) = waiting.remove(&hash) {
                ready.extend(children);
            }
        }
    }

    stats.orphans = waiting.values().map(|blocks| blocks.len() as u64).sum();
    Ok(stats)
}

fn process_block<S: KeyValueStore>(
    block: &Block,
    chainstate: &Mutex<ChainState<S>>,
    mempool: &Mutex<TxMempool>,
    interrupt: &AtomicBool,
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    let hash = block.hash();
    let mut chain = chainstate.lock().map_err(|_| ImportError::Poisoned)?;
    let known = chain
        .lookup(&hash)
        .is_some_and(|handle| chain.index().get(handle).status.has_data());
    if known {
        stats.known += 1;
        return Ok(());
    }

    let mut pool = mempool.lock().map_err(|_| ImportError::Poisoned)?;
    match chain.process_new_block(block, &mut *pool, Some(interrupt)) {
        Ok(_) => {
            stats.accepted += 1;
            Ok(())
        }
        Err(err) if err.is_consensus() => {
            log_debug!("Import: {} rejected: {err}", hash256_to_hex(&hash));
            stats.rejected += 1;
            Ok(())
        }
        Err(ChainStateError::OrphanHeader(_)) => {
            stats.rejected += 1;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
