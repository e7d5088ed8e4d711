//! Chain state: block acceptance, best chain selection and ledger application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cashd_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MONOLITH_MAX_BLOCK_SIZE};
use cashd_consensus::upgrades::UpgradeIndex;
use cashd_consensus::{hash256_to_hex, Hash256};
use cashd_primitives::block::{Block, BlockHeader};
use cashd_primitives::genesis::genesis_block;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

use crate::blockindex::{BlockHandle, BlockIndex, BlockStatus};
use crate::blockstore::{BlockStore, DEFAULT_MAX_BLOCK_FILE_SIZE};
use crate::chain::ActiveChain;
use crate::error::ChainStateError;
use crate::index::ChainIndex;
use crate::ledger::{connect_block, disconnect_block};
use crate::mempool::{NullTxPool, TxPool};
use crate::metrics::ConnectMetrics;
use crate::policy::PolicyOracle;
use crate::script::ScriptVerifier;
use crate::utxo::{OverlayView, UtxoDelta, UtxoSet};
use crate::validation::{check_block, check_block_header, contextual_check_block, ValidationError};

/// Most blocks connected by one activation step before the candidate set is
/// consulted again.
pub const MAX_BLOCKS_PER_STEP: i32 = 32;
pub const DEFAULT_UTXO_CACHE_ENTRIES: usize = 200_000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_DIRTY_FLUSH_THRESHOLD: usize = 2_000;

#[derive(Clone, Debug)]
pub struct ChainStateSettings {
    pub check_scripts: bool,
    /// Blocks at or below this one on its chain skip script checks.
    pub assume_valid: Option<Hash256>,
    pub utxo_cache_entries: usize,
    pub flush_interval: Duration,
    pub max_block_file_size: u64,
    /// Dirty index entries that force a flush in [`FlushMode::IfNeeded`].
    pub dirty_flush_threshold: usize,
}

impl Default for ChainStateSettings {
    fn default() -> Self {
        Self {
            check_scripts: true,
            assume_valid: None,
            utxo_cache_entries: DEFAULT_UTXO_CACHE_ENTRIES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_block_file_size: DEFAULT_MAX_BLOCK_FILE_SIZE,
            dirty_flush_threshold: DEFAULT_DIRTY_FLUSH_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    Always,
    IfNeeded,
    Periodic,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StepOutcome {
    Progress,
    InvalidFound,
}

pub struct ChainState<S> {
    index: ChainIndex,
    chain: ActiveChain,
    utxo: UtxoSet<S>,
    blocks: BlockStore,
    policy: Box<dyn PolicyOracle>,
    verifier: Box<dyn ScriptVerifier>,
    settings: ChainStateSettings,
    metrics: Arc<ConnectMetrics>,
    last_flush: Instant,
}

fn adjusted_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

impl<S: KeyValueStore> ChainState<S> {
    /// Loads the block index and coin set from `store`, connecting the
    /// genesis block on first start.
    pub fn open(
        store: S,
        mut blocks: BlockStore,
        policy: Box<dyn PolicyOracle>,
        verifier: Box<dyn ScriptVerifier>,
        settings: ChainStateSettings,
    ) -> Result<Self, ChainStateError> {
        let utxo = UtxoSet::new(store, settings.utxo_cache_entries);
        let best = utxo.best_block()?;
        let index = ChainIndex::load(utxo.store(), best.as_ref())?;
        blocks.load_file_info(utxo.store())?;

        let mut state = Self {
            index,
            chain: ActiveChain::new(),
            utxo,
            blocks,
            policy,
            verifier,
            settings,
            metrics: Arc::new(ConnectMetrics::default()),
            last_flush: Instant::now(),
        };

        match best {
            Some(hash) => {
                let tip = state.index.lookup(&hash).ok_or_else(|| {
                    ChainStateError::corrupt("best block is missing from the block index", Some(hash), None)
                })?;
                state.chain.set_tip(&state.index, Some(tip));
                state.index.rebuild_candidates(Some(tip));
                let node = state.index.get(tip);
                cashd_log::log_info!(
                    "Loaded block index: {} entries, best={} height={}",
                    state.index.len(),
                    hash256_to_hex(&node.hash),
                    node.height
                );
            }
            None => {
                if state.index.genesis().is_none() {
                    let genesis = genesis_block(state.policy.params());
                    state.accept_block(&genesis)?;
                }
            }
        }

        state.activate_best_chain(None, &mut NullTxPool, None)?;
        state.flush_state(FlushMode::Always)?;
        Ok(state)
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn coins(&self) -> &UtxoSet<S> {
        &self.utxo
    }

    pub fn store(&self) -> &S {
        self.utxo.store()
    }

    pub fn policy(&self) -> &dyn PolicyOracle {
        self.policy.as_ref()
    }

    pub fn settings(&self) -> &ChainStateSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<ConnectMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn tip(&self) -> Option<BlockHandle> {
        self.chain.tip()
    }

    pub fn tip_index(&self) -> Option<&BlockIndex> {
        self.chain.tip().map(|tip| self.index.get(tip))
    }

    /// Height of the active tip, -1 when empty.
    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.tip_index().map(|node| node.hash)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockHandle> {
        self.index.lookup(hash)
    }

    pub fn get_ancestor(&self, handle: BlockHandle, height: i32) -> Option<BlockHandle> {
        self.index.get_ancestor(handle, height)
    }

    /// Locator for the active tip.
    pub fn locator(&self) -> Vec<Hash256> {
        self.chain.locator(&self.index, None)
    }

    pub fn find_fork_point(&self, locator: &[Hash256]) -> Option<BlockHandle> {
        self.chain.find_fork_point(&self.index, locator)
    }

    /// Reads the stored body of a known block.
    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let Some(handle) = self.index.lookup(hash) else {
            return Ok(None);
        };
        match self.index.get(handle).data_pos {
            Some(location) => self.blocks.read_block(location).map(Some),
            None => Ok(None),
        }
    }

    /// Header rules that need the parent: difficulty, timestamps,
    /// checkpoints and the minimum version.
    fn contextual_check_header(&self, handle: BlockHandle) -> Result<(), ValidationError> {
        let node = self.index.get(handle);
        let Some(prev) = node.prev else {
            return Ok(());
        };
        let header = &node.header;
        let expected_bits = self
            .policy
            .next_work_required(&self.index, prev, header)
            .map_err(|_| ValidationError::BadDiffBits)?;
        if header.bits != expected_bits {
            return Err(ValidationError::BadDiffBits);
        }

        let prev_median_time = self.index.median_time_past(prev);
        if node.time() <= prev_median_time {
            return Err(ValidationError::TimeTooOld);
        }
        if node.time() > adjusted_time() + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::TimeTooNew);
        }

        if let Some(checkpoint) = self.policy.params().checkpoint_at(node.height) {
            if checkpoint.hash != node.hash {
                return Err(ValidationError::CheckpointMismatch);
            }
        }

        let active = |upgrade| self.policy.upgrade_active(node.height, prev_median_time, upgrade);
        if (header.version < 2 && active(UpgradeIndex::Bip34))
            || (header.version < 3 && active(UpgradeIndex::Bip66))
            || (header.version < 4 && active(UpgradeIndex::Bip65))
        {
            return Err(ValidationError::BadVersion);
        }
        Ok(())
    }

    /// Validates and records a header. Headers whose parent is unknown are
    /// kept until it arrives.
    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<BlockHandle, ChainStateError> {
        let hash = header.hash();
        if let Some(handle) = self.index.lookup(&hash) {
            let node = self.index.get(handle);
            if node.status.is_failed() {
                return Err(ChainStateError::invalid(
                    hash,
                    node.height,
                    ValidationError::DuplicateInvalid,
                ));
            }
            return Ok(handle);
        }

        let parent = self.index.lookup(&header.prev_block);
        let expected_height = parent.map_or(0, |parent| self.index.get(parent).height + 1);
        check_block_header(header, self.policy.params(), true)
            .map_err(|error| ChainStateError::invalid(hash, expected_height, error))?;

        let bad_parent = match parent {
            Some(parent) => self.index.get(parent).status.is_failed(),
            None => header.prev_block == [0u8; 32] && self.index.genesis().is_some(),
        };
        if bad_parent {
            return Err(ChainStateError::invalid(
                hash,
                expected_height,
                ValidationError::BadPrevBlock,
            ));
        }

        let insert = self
            .index
            .insert_header(header.clone())
            .map_err(|_| {
                ChainStateError::invalid(hash, expected_height, ValidationError::BadDiffBits)
            })?;
        let mut result = Ok(insert.handle);
        for &linked in &insert.linked {
            if self.index.get(linked).status.is_failed() {
                continue;
            }
            if let Err(error) = self.contextual_check_header(linked) {
                let (linked_hash, height) = {
                    let node = self.index.get(linked);
                    (node.hash, node.height)
                };
                cashd_log::log_warn!(
                    "Rejected header {} at height {}: {}",
                    hash256_to_hex(&linked_hash),
                    height,
                    error.rule()
                );
                self.index.mark_failed(linked);
                self.metrics.record_invalid();
                if linked == insert.handle {
                    result = Err(ChainStateError::invalid(linked_hash, height, error));
                }
            }
        }

        if insert.linked.is_empty() {
            cashd_log::log_debug!(
                "Header {} waits for parent {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&header.prev_block)
            );
        } else if result.is_ok() {
            cashd_log::log_debug!(
                "Accepted header {} at height {}",
                hash256_to_hex(&hash),
                self.index.get(insert.handle).height
            );
        }
        result
    }

    /// Validates and stores a block body. Does not change the active chain.
    pub fn accept_block(&mut self, block: &Block) -> Result<BlockHandle, ChainStateError> {
        let handle = self.accept_header(&block.header)?;
        if self.index.get(handle).status.has_data() {
            return Ok(handle);
        }

        let linked = self.index.is_linked(handle);
        let (hash, height) = {
            let node = self.index.get(handle);
            (node.hash, node.height)
        };
        let checked = if linked {
            check_block(
                block,
                self.policy.params(),
                self.policy.max_block_size(&self.index, handle),
                false,
            )
            .and_then(|()| {
                contextual_check_block(block, &self.policy.block_context(&self.index, handle))
            })
        } else {
            // Position-dependent limits are enforced once the block connects.
            check_block(block, self.policy.params(), MONOLITH_MAX_BLOCK_SIZE, false)
        };
        if let Err(error) = checked {
            cashd_log::log_warn!(
                "Rejected block {} at height {}: {}",
                hash256_to_hex(&hash),
                height,
                error.rule()
            );
            if !error.may_be_corrupted() {
                self.index.mark_failed(handle);
                self.metrics.record_invalid();
            }
            return Err(ChainStateError::invalid(hash, height, error));
        }

        let location = self.blocks.write_block(block, height)?;
        let connectable =
            self.index
                .mark_body_received(handle, block.transactions.len() as u32, location);
        cashd_log::log_debug!(
            "AcceptBlock: {} height={} txs={} connectable={}",
            hash256_to_hex(&hash),
            height,
            block.transactions.len(),
            connectable
        );
        Ok(handle)
    }

    /// Accepts `block` and moves the active chain to the best candidate.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        mempool: &mut dyn TxPool,
        interrupt: Option<&AtomicBool>,
    ) -> Result<BlockHandle, ChainStateError> {
        let handle = self.accept_block(block)?;
        self.activate_best_chain(Some(block), mempool, interrupt)?;
        Ok(handle)
    }

    /// Switches the active chain to the most-work valid candidate, one
    /// bounded step at a time.
    pub fn activate_best_chain(
        &mut self,
        hint: Option<&Block>,
        mempool: &mut dyn TxPool,
        interrupt: Option<&AtomicBool>,
    ) -> Result<(), ChainStateError> {
        loop {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                self.flush_state(FlushMode::Periodic)?;
                return Err(ChainStateError::Interrupted);
            }
            let Some(target) = self.index.find_most_work_candidate() else {
                break;
            };
            if let Some(tip) = self.chain.tip() {
                if target == tip || !self.index.better_tip(target, tip) {
                    break;
                }
            }

            match self.activate_step(target, hint, mempool) {
                Ok(StepOutcome::Progress) | Ok(StepOutcome::InvalidFound) => {}
                Err(err) => {
                    if err.is_fatal() {
                        cashd_log::log_error!("ActivateBestChain: {}", err);
                    }
                    return Err(err);
                }
            }
            if let Some(tip) = self.chain.tip() {
                self.index.prune_candidates(tip);
            }
        }
        self.flush_state(FlushMode::Periodic)
    }

    /// Disconnects back to the fork with `target` and connects at most
    /// [`MAX_BLOCKS_PER_STEP`] blocks towards it, returning as soon as the
    /// tip has more work than when the step began.
    fn activate_step(
        &mut self,
        target: BlockHandle,
        hint: Option<&Block>,
        mempool: &mut dyn TxPool,
    ) -> Result<StepOutcome, ChainStateError> {
        let start_work = self.tip_index().map(|node| node.chain_work);
        let fork = self.chain.find_fork(&self.index, target);

        let mut disconnected = 0u64;
        while self.chain.tip() != fork {
            self.disconnect_tip(mempool)?;
            disconnected += 1;
        }
        if disconnected > 0 {
            self.metrics.record_reorg(disconnected);
            cashd_log::log_info!(
                "Reorg: disconnected {} blocks back to height {}",
                disconnected,
                self.chain.height()
            );
        }

        let fork_height = fork.map_or(-1, |fork| self.index.get(fork).height);
        let target_height = self.index.get(target).height;
        let stop_height = target_height.min(fork_height + MAX_BLOCKS_PER_STEP);
        let mut to_connect = Vec::new();
        let mut walk = self.index.get_ancestor(target, stop_height);
        while let Some(handle) = walk {
            let node = self.index.get(handle);
            if node.height <= fork_height {
                break;
            }
            to_connect.push(handle);
            walk = node.prev;
        }
        to_connect.reverse();

        for handle in to_connect {
            match self.connect_tip(handle, hint, mempool) {
                Ok(()) => {}
                Err(err) if err.is_consensus() => {
                    self.invalid_block_found(handle, &err);
                    return Ok(StepOutcome::InvalidFound);
                }
                Err(err) => return Err(err),
            }
            let tip_work = self.index.get(handle).chain_work;
            if start_work.map_or(true, |start| tip_work > start) {
                break;
            }
        }
        Ok(StepOutcome::Progress)
    }

    fn invalid_block_found(&mut self, handle: BlockHandle, err: &ChainStateError) {
        let descendants = self.index.mark_failed(handle);
        self.metrics.record_invalid();
        let node = self.index.get(handle);
        let rule = err
            .rejection()
            .map_or("unknown", |rejection| rejection.error.rule());
        cashd_log::log_warn!(
            "InvalidChainFound: invalid block={} height={} rule={} descendants={}",
            hash256_to_hex(&node.hash),
            node.height,
            rule,
            descendants.len()
        );
    }

    fn is_assumed_valid(&self, handle: BlockHandle) -> bool {
        let Some(hash) = self.settings.assume_valid else {
            return false;
        };
        let Some(assumed) = self.index.lookup(&hash) else {
            return false;
        };
        self.index.is_linked(assumed)
            && self.index.get_ancestor(assumed, self.index.get(handle).height) == Some(handle)
    }

    /// Connects `handle`, which must extend the active tip. The coin set,
    /// its best-block pointer and the block's index entry are committed in
    /// one batch.
    fn connect_tip(
        &mut self,
        handle: BlockHandle,
        hint: Option<&Block>,
        mempool: &mut dyn TxPool,
    ) -> Result<(), ChainStateError> {
        let start = Instant::now();
        let (hash, height, prev, data_pos) = {
            let node = self.index.get(handle);
            (node.hash, node.height, node.prev, node.data_pos)
        };
        if prev != self.chain.tip() {
            return Err(ChainStateError::corrupt(
                "block does not extend the active tip",
                Some(hash),
                Some(height),
            ));
        }

        let stored;
        let block = match hint.filter(|block| block.hash() == hash) {
            Some(block) => block,
            None => {
                let location = data_pos.ok_or_else(|| {
                    ChainStateError::corrupt("block data missing", Some(hash), Some(height))
                })?;
                stored = self.blocks.read_block(location)?;
                &stored
            }
        };

        let prev_hash = prev.map(|prev| self.index.get(prev).hash);
        if self.utxo.best_block()? != prev_hash {
            return Err(ChainStateError::corrupt(
                "coin set is not at the parent of the block being connected",
                Some(hash),
                Some(height),
            ));
        }

        let mut undo_bytes = 0usize;
        let mut record = self.index.get(handle).clone();
        let delta = match prev_hash {
            // Genesis outputs never enter the coin set.
            None => UtxoDelta::new(),
            Some(prev_hash) => {
                let check_scripts = self.settings.check_scripts && !self.is_assumed_valid(handle);
                let connected = connect_block(
                    block,
                    &self.index,
                    handle,
                    &self.utxo,
                    self.policy.as_ref(),
                    self.verifier.as_ref(),
                    check_scripts,
                )?;
                if connected.script_checks > 0 {
                    self.metrics
                        .record_scripts(connected.script_time, connected.script_checks);
                }
                if !record.status.has_undo() {
                    let block_file = data_pos.map_or(0, |location| location.file_id);
                    let location = self.blocks.write_undo(&connected.undo, &prev_hash, block_file)?;
                    undo_bytes = location.len as usize;
                    record.undo_pos = Some(location);
                    record.status.insert(BlockStatus::HAVE_UNDO);
                }
                connected.delta
            }
        };
        record.status.raise_validity(BlockStatus::VALID_SCRIPTS);

        // The in-memory entry only changes once the commit has landed.
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, hash, record.to_disk().encode());
        self.utxo.commit(&delta, &hash, batch)?;
        *self.index.get_mut(handle) = record;

        self.chain.set_tip(&self.index, Some(handle));
        mempool.remove_confirmed(&block.transactions);
        self.metrics.record_connect(start.elapsed(), undo_bytes);

        let node = self.index.get(handle);
        cashd_log::log_info!(
            "UpdateTip: new best={} height={} work={} tx={}",
            hash256_to_hex(&node.hash),
            node.height,
            node.chain_work,
            node.chain_tx_count
        );
        Ok(())
    }

    /// Reverts the active tip using its undo data and offers its
    /// transactions back to the mempool.
    fn disconnect_tip(&mut self, mempool: &mut dyn TxPool) -> Result<(), ChainStateError> {
        let start = Instant::now();
        let tip = self
            .chain
            .tip()
            .ok_or_else(|| ChainStateError::corrupt("active chain is empty", None, None))?;
        let (hash, height, prev, data_pos, undo_pos) = {
            let node = self.index.get(tip);
            (node.hash, node.height, node.prev, node.data_pos, node.undo_pos)
        };
        let prev = prev.ok_or_else(|| {
            ChainStateError::corrupt("cannot disconnect the genesis block", Some(hash), Some(height))
        })?;
        let prev_hash = self.index.get(prev).hash;
        if self.utxo.best_block()? != Some(hash) {
            return Err(ChainStateError::corrupt(
                "coin set is not at the tip being disconnected",
                Some(hash),
                Some(height),
            ));
        }

        let data_pos = data_pos.ok_or_else(|| {
            ChainStateError::corrupt("block data missing", Some(hash), Some(height))
        })?;
        let undo_pos = undo_pos.ok_or_else(|| {
            ChainStateError::corrupt("undo data missing", Some(hash), Some(height))
        })?;
        let block = self.blocks.read_block(data_pos)?;
        let undo = self.blocks.read_undo(undo_pos, &prev_hash)?;

        let disconnected = disconnect_block(&block, &undo, &self.utxo, hash, height)?;
        if !disconnected.clean {
            return Err(ChainStateError::corrupt(
                "coin set inconsistent with the block being disconnected",
                Some(hash),
                Some(height),
            ));
        }
        self.utxo.apply_delta(&disconnected.delta, &prev_hash)?;
        self.chain.set_tip(&self.index, Some(prev));
        self.metrics.record_disconnect(start.elapsed());

        for tx in block.transactions.iter().skip(1) {
            if let Err(err) = mempool.try_readmit(tx, &self.utxo) {
                cashd_log::log_debug!(
                    "Mempool: dropped {} from disconnected block: {}",
                    hash256_to_hex(&tx.txid()),
                    err
                );
            }
        }

        cashd_log::log_info!(
            "DisconnectTip: removed {} height={}, new best={}",
            hash256_to_hex(&hash),
            height,
            hash256_to_hex(&prev_hash)
        );
        Ok(())
    }

    /// Writes dirty index entries and file bookkeeping. The coin set is
    /// already durable after every connect.
    pub fn flush_state(&mut self, mode: FlushMode) -> Result<(), ChainStateError> {
        let over_threshold = self.index.dirty_count() >= self.settings.dirty_flush_threshold;
        let due = match mode {
            FlushMode::Always => true,
            FlushMode::IfNeeded => over_threshold,
            FlushMode::Periodic => {
                over_threshold || self.last_flush.elapsed() >= self.settings.flush_interval
            }
        };
        if !due {
            return Ok(());
        }

        let start = Instant::now();
        self.blocks.sync()?;
        let mut batch = WriteBatch::new();
        let entries = self.index.flush(&mut batch);
        let files = self.blocks.write_file_info(&mut batch);
        if !batch.is_empty() {
            self.utxo.store().write_batch(&batch)?;
        }
        self.index.clear_dirty();
        self.blocks.clear_dirty();
        self.last_flush = Instant::now();
        self.metrics.record_flush(start.elapsed());
        cashd_log::log_debug!(
            "FlushStateToDisk: {} index entries, {} file records",
            entries,
            files
        );
        Ok(())
    }

    /// Marks `hash` and its descendants invalid, rewinding the active chain
    /// below it if needed.
    pub fn invalidate_block(
        &mut self,
        hash: &Hash256,
        mempool: &mut dyn TxPool,
    ) -> Result<(), ChainStateError> {
        let handle = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if !self.index.is_linked(handle) {
            return Err(ChainStateError::OrphanHeader(*hash));
        }
        if self.index.genesis() == Some(handle) {
            cashd_log::log_warn!("InvalidateBlock: the genesis block cannot be invalidated");
            return Ok(());
        }

        while self.chain.contains(&self.index, handle) {
            self.disconnect_tip(mempool)?;
        }
        let descendants = self.index.mark_failed(handle);
        self.index.rebuild_candidates(self.chain.tip());
        cashd_log::log_info!(
            "InvalidateBlock: {} height={} descendants={}",
            hash256_to_hex(hash),
            self.index.get(handle).height,
            descendants.len()
        );
        self.activate_best_chain(None, mempool, None)
    }

    /// Clears failure marks on `hash`, its ancestors and its descendants,
    /// then lets the best candidate win again.
    pub fn reconsider_block(
        &mut self,
        hash: &Hash256,
        mempool: &mut dyn TxPool,
    ) -> Result<(), ChainStateError> {
        let handle = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if !self.index.is_linked(handle) {
            return Err(ChainStateError::OrphanHeader(*hash));
        }
        let cleared = self.index.clear_failure(handle);
        self.index.rebuild_candidates(self.chain.tip());
        cashd_log::log_info!(
            "ReconsiderBlock: {} cleared={}",
            hash256_to_hex(hash),
            cleared.len()
        );
        self.activate_best_chain(None, mempool, None)
    }

    /// Disconnects the top `depth` blocks on an in-memory overlay, then
    /// reconnects them, checking stored data, undo records and every
    /// consensus rule. Returns the number of blocks checked. Nothing is
    /// written.
    pub fn verify_chain(&self, depth: u32) -> Result<usize, ChainStateError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(0);
        };
        let tip_height = self.index.get(tip).height;
        let depth = i32::try_from(depth).unwrap_or(i32::MAX).min(tip_height);
        if depth <= 0 {
            return Ok(0);
        }

        let mut overlay = UtxoDelta::new();
        let mut checked = Vec::new();
        for height in ((tip_height - depth + 1)..=tip_height).rev() {
            let handle = self.chain.at(height).ok_or_else(|| {
                ChainStateError::corrupt("active chain has a gap", None, Some(height))
            })?;
            let node = self.index.get(handle);
            let (hash, prev) = (node.hash, node.prev);
            let prev = prev.ok_or_else(|| {
                ChainStateError::corrupt("non-genesis block without parent", Some(hash), Some(height))
            })?;
            let prev_hash = self.index.get(prev).hash;
            let data_pos = node.data_pos.ok_or_else(|| {
                ChainStateError::corrupt("block data missing", Some(hash), Some(height))
            })?;
            let undo_pos = node.undo_pos.ok_or_else(|| {
                ChainStateError::corrupt("undo data missing", Some(hash), Some(height))
            })?;

            let block = self.blocks.read_block(data_pos)?;
            if block.hash() != hash || block.header.prev_block != prev_hash {
                return Err(ChainStateError::corrupt(
                    "stored block does not match its index entry",
                    Some(hash),
                    Some(height),
                ));
            }
            let undo = self.blocks.read_undo(undo_pos, &prev_hash)?;
            let view = OverlayView::new(&self.utxo, &overlay);
            let disconnected = disconnect_block(&block, &undo, &view, hash, height)?;
            if !disconnected.clean {
                return Err(ChainStateError::corrupt(
                    "coin set inconsistent with stored block",
                    Some(hash),
                    Some(height),
                ));
            }
            overlay.merge(disconnected.delta);
            checked.push((handle, block));
        }

        let mut reached = checked
            .last()
            .and_then(|(handle, _)| self.index.get(*handle).prev);
        for (handle, block) in checked.iter().rev() {
            let view = OverlayView::new(&self.utxo, &overlay);
            let connected = connect_block(
                block,
                &self.index,
                *handle,
                &view,
                self.policy.as_ref(),
                self.verifier.as_ref(),
                self.settings.check_scripts,
            )?;
            overlay.merge(connected.delta);
            reached = Some(*handle);
        }
        if reached != Some(tip) {
            return Err(ChainStateError::corrupt(
                "reconnect did not reach the active tip",
                Some(self.index.get(tip).hash),
                Some(tip_height),
            ));
        }

        cashd_log::log_info!(
            "VerifyChain: {} blocks checked at tip height {}",
            checked.len(),
            tip_height
        );
        Ok(checked.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConsensusPolicy;
    use crate::script::AcceptAllScripts;
    use cashd_consensus::{consensus_params, Network};
    use cashd_storage::memory::MemoryStore;

    fn open(dir: &std::path::Path, store: Arc<MemoryStore>) -> ChainState<Arc<MemoryStore>> {
        let blocks = BlockStore::open(dir, 1 << 20).expect("block store");
        ChainState::open(
            store,
            blocks,
            Box::new(ConsensusPolicy::new(consensus_params(Network::Regtest))),
            Box::new(AcceptAllScripts),
            ChainStateSettings::default(),
        )
        .expect("open")
    }

    #[test]
    fn first_open_connects_genesis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let state = open(dir.path(), Arc::clone(&store));
        let genesis = genesis_block(&consensus_params(Network::Regtest));
        assert_eq!(state.height(), 0);
        assert_eq!(state.best_hash(), Some(genesis.hash()));
        assert_eq!(state.coins().best_block().expect("best"), Some(genesis.hash()));
        assert_eq!(store.len(Column::Utxo).expect("len"), 0);
        assert_eq!(store.len(Column::BlockIndex).expect("len"), 1);
        assert_eq!(state.index().dirty_count(), 0);

        let reopened = open(dir.path(), store);
        assert_eq!(reopened.best_hash(), Some(genesis.hash()));
        assert_eq!(reopened.index().len(), 1);
    }

    #[test]
    fn genesis_cannot_be_invalidated_or_duplicated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = open(dir.path(), Arc::new(MemoryStore::new()));
        let genesis_hash = state.best_hash().expect("tip");
        state
            .invalidate_block(&genesis_hash, &mut NullTxPool)
            .expect("no-op");
        assert_eq!(state.best_hash(), Some(genesis_hash));

        let mut other = genesis_block(state.policy().params());
        other.header.nonce = other.header.nonce.wrapping_add(1);
        assert!(state.accept_header(&other.header).is_err());
        assert!(state.lookup(&other.header.hash()).is_none());
    }

    #[test]
    fn unknown_blocks_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = open(dir.path(), Arc::new(MemoryStore::new()));
        let err = state
            .reconsider_block(&[7u8; 32], &mut NullTxPool)
            .expect_err("unknown");
        assert!(matches!(err, ChainStateError::UnknownBlock(hash) if hash == [7u8; 32]));
        assert_eq!(state.verify_chain(6).expect("verify"), 0);
    }

    #[test]
    fn flush_modes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let mut state = open(dir.path(), Arc::clone(&store));
        let flushes = state.metrics().snapshot().flushes;

        state.flush_state(FlushMode::IfNeeded).expect("flush");
        state.flush_state(FlushMode::Periodic).expect("flush");
        assert_eq!(state.metrics().snapshot().flushes, flushes);

        state.flush_state(FlushMode::Always).expect("flush");
        assert_eq!(state.metrics().snapshot().flushes, flushes + 1);

        state.settings.flush_interval = Duration::ZERO;
        state.flush_state(FlushMode::Periodic).expect("flush");
        assert_eq!(state.metrics().snapshot().flushes, flushes + 2);
    }
}
