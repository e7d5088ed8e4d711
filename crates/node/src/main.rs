use cashd_log as logging;

mod config;
pub mod import;
pub mod mempool;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cashd_chainstate::blockstore::BlockStore;
use cashd_chainstate::policy::ConsensusPolicy;
use cashd_chainstate::script::AcceptAllScripts;
use cashd_chainstate::{ChainState, ChainStateError, FlushMode};
use cashd_consensus::{chain_params, hash256_to_hex};
use cashd_log::{log_error, log_info, log_warn};
use cashd_storage::fjall::{FjallOptions, FjallStore};
use cashd_storage::memory::MemoryStore;
use cashd_storage::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch};
use fs2::FileExt;

pub use config::{parse_args, parse_args_from, usage, AssumeValid, Backend, CliAction, Config};

use crate::mempool::TxMempool;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Fjall(store) => store.persist(),
            Store::Memory(_) => Ok(()),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another cashd instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: config.db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
                ..FjallOptions::default()
            };
            let store = FjallStore::open_with_options(config.db_dir(), options)
                .map_err(|err| err.to_string())?;
            Ok(Store::Fjall(store))
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("cashd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

pub async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(config.log_config());
    let start_time = Instant::now();
    let params = chain_params(config.network);
    log_info!(
        "Startup: network={:?} backend={:?} data_dir={}",
        config.network,
        config.backend,
        config.data_dir.display()
    );

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;

    let store = open_store(&config)?;
    let settings = config.chainstate_settings(&params.consensus);
    let blocks = BlockStore::open(&config.blocks_dir(), settings.max_block_file_size)
        .map_err(|err| err.to_string())?;
    if settings.check_scripts {
        log_info!(
            "Script checks enabled (assume-valid {})",
            settings
                .assume_valid
                .as_ref()
                .map_or_else(|| "none".to_string(), hash256_to_hex)
        );
    }
    let chainstate = ChainState::open(
        store,
        blocks,
        Box::new(ConsensusPolicy::new(params.consensus.clone())),
        Box::new(AcceptAllScripts),
        settings,
    )
    .map_err(|err| err.to_string())?;
    log_info!(
        "Startup: chainstate ready at height {} in {}ms",
        chainstate.height(),
        start_time.elapsed().as_millis()
    );

    let chainstate = Arc::new(Mutex::new(chainstate));
    let mempool = Arc::new(Mutex::new(TxMempool::new(config.mempool_max_bytes())));
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let interrupt = Arc::clone(&interrupt);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_info!("Shutdown requested");
                interrupt.store(true, Ordering::SeqCst);
            }
        });
    }

    let magic = params.message_start;
    let worker = tokio::task::spawn_blocking(move || {
        process_blocks(&config, magic, &chainstate, &mempool, &interrupt)
    });
    worker
        .await
        .map_err(|err| format!("block worker failed: {err}"))??;

    log_info!(
        "Shutdown complete after {}s",
        start_time.elapsed().as_secs()
    );
    Ok(())
}

/// Bootstrap imports, activation, chain verification and the final flush.
/// Runs on a blocking thread.
fn process_blocks(
    config: &Config,
    magic: [u8; 4],
    chainstate: &Mutex<ChainState<Store>>,
    mempool: &Mutex<TxMempool>,
    interrupt: &AtomicBool,
) -> Result<(), String> {
    for path in &config.imports {
        match import::import_file(path, magic, chainstate, mempool, interrupt) {
            Ok(_) => {}
            Err(err) if err.is_interrupted() => {
                log_info!("Import of {} interrupted", path.display());
                break;
            }
            Err(err) => {
                log_error!("Import of {} failed: {err}", path.display());
                return Err(err.to_string());
            }
        }
    }

    let mut chain = chainstate
        .lock()
        .map_err(|_| "chainstate lock poisoned".to_string())?;
    if !interrupt.load(Ordering::SeqCst) {
        let mut pool = mempool.lock().map_err(|_| "mempool lock poisoned".to_string())?;
        match chain.activate_best_chain(None, &mut *pool, Some(interrupt)) {
            Ok(()) | Err(ChainStateError::Interrupted) => {}
            Err(err) => return Err(fatal("chain activation failed", err)),
        }
    }

    if config.verify_blocks > 0 && !interrupt.load(Ordering::SeqCst) {
        let checked = chain
            .verify_chain(config.verify_blocks)
            .map_err(|err| fatal("chain verification failed", err))?;
        log_info!("Verified the last {checked} blocks");
    }

    if let Some(tip) = chain.tip_index() {
        log_info!(
            "Chain tip {} at height {} ({} blocks indexed)",
            hash256_to_hex(&tip.hash),
            tip.height,
            chain.index().len()
        );
    }
    let metrics = chain.metrics().snapshot();
    log_info!(
        "Connected {} blocks in {}ms, disconnected {} in {}ms, {} script checks, {} reorgs (deepest {}), {} invalid blocks",
        metrics.connected_blocks,
        metrics.connect_us / 1000,
        metrics.disconnected_blocks,
        metrics.disconnect_us / 1000,
        metrics.script_checks,
        metrics.reorgs,
        metrics.deepest_reorg,
        metrics.invalid_blocks
    );

    chain
        .flush_state(FlushMode::Always)
        .map_err(|err| fatal("final flush failed", err))?;
    chain.store().persist().map_err(|err| err.to_string())?;
    Ok(())
}

fn fatal(context: &str, err: ChainStateError) -> String {
    if err.is_fatal() {
        log_error!("{context}: {err}; the data directory needs a reindex");
    } else {
        log_warn!("{context}: {err}");
    }
    format!("{context}: {err}")
}
