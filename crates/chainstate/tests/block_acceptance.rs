mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cashd_chainstate::blockindex::{BlockStatus, DiskBlockIndex};
use cashd_chainstate::mempool::NullTxPool;
use cashd_chainstate::policy::ConsensusPolicy;
use cashd_chainstate::validation::ValidationError;
use cashd_chainstate::{ChainStateError, FlushMode};
use cashd_consensus::constants::{LEGACY_MAX_BLOCK_SIZE, MAX_TX_SIZE};
use cashd_consensus::upgrades::{Activation, UpgradeIndex};
use cashd_consensus::{consensus_params, Checkpoint, Network};
use cashd_primitives::block::Block;
use cashd_primitives::transaction::Transaction;
use cashd_storage::memory::MemoryStore;
use cashd_storage::{Column, KeyValueStore};

use common::{
    coinbase, mine, mine_branch, open_chain, open_chain_with, regrind, tip_header, FreeBitsPolicy,
    EASY_BITS, HARD_BITS,
};

fn rule(err: &ChainStateError) -> Option<ValidationError> {
    err.rejection().map(|rejection| rejection.error.clone())
}

/// A coinbase padded with push-free output bytes to exactly the largest
/// transaction size, so the block holding it passes 1 MB.
fn padded_coinbase(height: i32, salt: u8) -> Transaction {
    let mut tx = coinbase(height, salt);
    tx.vout[0].script_pubkey = vec![0u8; 990_000];
    let missing = MAX_TX_SIZE as usize - tx.serialized_size();
    tx.vout[0].script_pubkey.resize(990_000 + missing, 0);
    assert_eq!(tx.serialized_size() as u64, MAX_TX_SIZE);
    tx
}

fn store_snapshot(store: &MemoryStore) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
    [Column::BlockIndex, Column::Utxo, Column::Meta]
        .into_iter()
        .map(|column| store.dump(column).expect("dump"))
        .collect()
}

#[test]
fn header_context_rules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = ConsensusPolicy::new(consensus_params(Network::Regtest));
    let mut chain = open_chain_with(dir.path(), Arc::new(MemoryStore::new()), Box::new(policy));
    let genesis = tip_header(&chain);

    let wrong_bits = mine(&genesis, HARD_BITS, vec![coinbase(1, 1)]);
    let err = chain.accept_header(&wrong_bits.header).expect_err("bits");
    assert_eq!(rule(&err), Some(ValidationError::BadDiffBits));
    let handle = chain.lookup(&wrong_bits.hash()).expect("recorded");
    assert!(chain.index().get(handle).status.has(BlockStatus::FAILED_VALID));
    let again = chain.accept_block(&wrong_bits).expect_err("duplicate");
    assert_eq!(rule(&again), Some(ValidationError::DuplicateInvalid));

    let mut stale = mine(&genesis, EASY_BITS, vec![coinbase(1, 2)]);
    stale.header.time = genesis.time;
    regrind(&mut stale);
    let err = chain.accept_header(&stale.header).expect_err("time");
    assert_eq!(rule(&err), Some(ValidationError::TimeTooOld));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as u32;
    let mut future = mine(&genesis, EASY_BITS, vec![coinbase(1, 3)]);
    future.header.time = now + 3 * 60 * 60;
    regrind(&mut future);
    let err = chain.accept_header(&future.header).expect_err("time");
    assert_eq!(rule(&err), Some(ValidationError::TimeTooNew));

    let good = mine(&genesis, EASY_BITS, vec![coinbase(1, 4)]);
    chain
        .process_new_block(&good, &mut NullTxPool, None)
        .expect("good block");
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.metrics().snapshot().invalid_blocks, 3);
}

#[test]
fn version_and_checkpoint_rules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut params = consensus_params(Network::Regtest);
    params.upgrades[UpgradeIndex::Bip34.as_usize()] = Activation::Height(1);
    params.checkpoints.push(Checkpoint {
        height: 2,
        hash: [0x42; 32],
    });
    let mut chain = open_chain_with(
        dir.path(),
        Arc::new(MemoryStore::new()),
        Box::new(ConsensusPolicy::new(params)),
    );
    let genesis = tip_header(&chain);

    let mut old = mine(&genesis, EASY_BITS, vec![coinbase(1, 1)]);
    old.header.version = 1;
    regrind(&mut old);
    let err = chain.accept_header(&old.header).expect_err("version");
    assert_eq!(rule(&err), Some(ValidationError::BadVersion));

    let first = mine(&genesis, EASY_BITS, vec![coinbase(1, 1)]);
    chain
        .process_new_block(&first, &mut NullTxPool, None)
        .expect("first");
    let second = mine(&first.header, EASY_BITS, vec![coinbase(2, 1)]);
    let err = chain.accept_block(&second).expect_err("checkpoint");
    assert_eq!(rule(&err), Some(ValidationError::CheckpointMismatch));
    assert_eq!(chain.height(), 1);
}

#[test]
fn headers_and_bodies_arriving_out_of_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut chain = open_chain(dir.path(), Arc::new(MemoryStore::new()));
    let genesis = tip_header(&chain);
    let blocks = mine_branch(&genesis, 1, 3, EASY_BITS, 1);

    let third = chain.accept_header(&blocks[2].header).expect("orphan header");
    assert!(!chain.index().is_linked(third));
    assert_eq!(chain.index().unlinked_header_count(), 1);
    let err = chain
        .invalidate_block(&blocks[2].hash(), &mut NullTxPool)
        .expect_err("unlinked");
    assert!(matches!(err, ChainStateError::OrphanHeader(_)));

    chain
        .process_new_block(&blocks[1], &mut NullTxPool, None)
        .expect("body before parent");
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.index().orphan_count(), 1);

    chain
        .process_new_block(&blocks[0], &mut NullTxPool, None)
        .expect("parent");
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.index().orphan_count(), 0);
    assert_eq!(chain.index().unlinked_header_count(), 0);
    assert_eq!(chain.index().get(third).height, 3);

    chain
        .process_new_block(&blocks[2], &mut NullTxPool, None)
        .expect("last body");
    assert_eq!(chain.best_hash(), Some(blocks[2].hash()));
}

#[test]
fn large_body_before_parent_header_connects_once_linked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut params = consensus_params(Network::Regtest);
    params.upgrades[UpgradeIndex::Uahf.as_usize()] = Activation::Height(2);
    let mut chain = open_chain_with(
        dir.path(),
        Arc::new(MemoryStore::new()),
        Box::new(FreeBitsPolicy(params)),
    );
    let genesis = tip_header(&chain);
    let first = mine(&genesis, EASY_BITS, vec![coinbase(1, 1)]);
    let large = mine(&first.header, EASY_BITS, vec![padded_coinbase(2, 1)]);
    assert!(large.serialized_size() as u64 > LEGACY_MAX_BLOCK_SIZE);

    // Height 2 allows 8 MB, but the position is unknown until the parent shows up.
    let handle = chain
        .process_new_block(&large, &mut NullTxPool, None)
        .expect("large body before parent");
    assert!(!chain.index().is_linked(handle));
    assert!(!chain.index().get(handle).status.is_failed());
    assert_eq!(chain.index().orphan_count(), 1);

    chain
        .process_new_block(&first, &mut NullTxPool, None)
        .expect("parent");
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.best_hash(), Some(large.hash()));
    assert_eq!(chain.metrics().snapshot().invalid_blocks, 0);

    // At height 1 the legacy limit still applies.
    let oversized = mine(&genesis, EASY_BITS, vec![padded_coinbase(1, 2)]);
    let err = chain.accept_block(&oversized).expect_err("too large for height 1");
    assert_eq!(rule(&err), Some(ValidationError::BadLength));
    let rejected = chain.lookup(&oversized.hash()).expect("header recorded");
    assert!(chain.index().get(rejected).status.is_failed());
    assert_eq!(chain.height(), 2);
}

#[test]
fn failed_commit_leaves_store_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), Arc::clone(&store));
    let genesis = tip_header(&chain);
    let blocks = mine_branch(&genesis, 1, 4, EASY_BITS, 1);
    for block in &blocks[..3] {
        chain
            .process_new_block(block, &mut NullTxPool, None)
            .expect("block");
    }
    let before = store_snapshot(&store);

    store.fail_batches_after(0);
    let err = chain
        .process_new_block(&blocks[3], &mut NullTxPool, None)
        .expect_err("store failure");
    assert!(err.is_system());
    assert_eq!(chain.height(), 3);
    assert_eq!(store_snapshot(&store), before);
    let pending = chain.lookup(&blocks[3].hash()).expect("stored");
    assert!(!chain
        .index()
        .get(pending)
        .status
        .is_valid(BlockStatus::VALID_SCRIPTS));

    store.clear_failure();
    chain.flush_state(FlushMode::Always).expect("flush");
    let persisted = store
        .get(Column::BlockIndex, &blocks[3].hash())
        .expect("read")
        .expect("record flushed");
    let persisted = DiskBlockIndex::decode(&persisted).expect("decode record");
    assert!(!BlockStatus::from_bits(persisted.status).is_valid(BlockStatus::VALID_SCRIPTS));

    chain
        .activate_best_chain(None, &mut NullTxPool, None)
        .expect("retry");
    assert_eq!(chain.best_hash(), Some(blocks[3].hash()));
    assert_eq!(
        chain.coins().best_block().expect("best"),
        Some(blocks[3].hash())
    );
}

#[test]
fn failure_mid_reorg_keeps_tip_and_coins_together() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), Arc::clone(&store));
    let genesis = tip_header(&chain);
    let main = mine_branch(&genesis, 1, 6, EASY_BITS, 1);
    for block in &main {
        chain
            .process_new_block(block, &mut NullTxPool, None)
            .expect("main");
    }
    let fork: Vec<Block> = mine_branch(&main[2].header, 4, 2, HARD_BITS, 2);

    store.fail_batches_after(2);
    let err = chain
        .process_new_block(&fork[0], &mut NullTxPool, None)
        .expect_err("third disconnect fails");
    assert!(err.is_system());
    assert_eq!(chain.height(), 4);
    assert_eq!(chain.coins().best_block().expect("best"), chain.best_hash());

    store.clear_failure();
    chain
        .activate_best_chain(None, &mut NullTxPool, None)
        .expect("resume");
    assert_eq!(chain.best_hash(), Some(fork[0].hash()));
    chain
        .process_new_block(&fork[1], &mut NullTxPool, None)
        .expect("extend fork");
    assert_eq!(chain.height(), 5);
    assert_eq!(chain.coins().best_block().expect("best"), Some(fork[1].hash()));
}

#[test]
fn interrupt_stops_activation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut chain = open_chain(dir.path(), Arc::new(MemoryStore::new()));
    let genesis = tip_header(&chain);
    let blocks = mine_branch(&genesis, 1, 3, EASY_BITS, 1);

    let stop = AtomicBool::new(true);
    for block in &blocks {
        let err = chain
            .process_new_block(block, &mut NullTxPool, Some(&stop))
            .expect_err("interrupted");
        assert!(matches!(err, ChainStateError::Interrupted));
    }
    assert_eq!(chain.height(), 0);
    let last = chain.lookup(&blocks[2].hash()).expect("stored");
    assert!(chain.index().get(last).status.has_data());

    chain
        .activate_best_chain(None, &mut NullTxPool, None)
        .expect("resume");
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.verify_chain(100).expect("verify"), 3);
}
