mod common;

use std::sync::Arc;

use cashd_chainstate::blockindex::BlockStatus;
use cashd_chainstate::mempool::NullTxPool;
use cashd_chainstate::validation::ValidationError;
use cashd_chainstate::ChainStateError;
use cashd_consensus::money::COIN;
use cashd_primitives::block::Block;
use cashd_storage::memory::MemoryStore;
use cashd_storage::Column;

use common::{coinbase, hash_at, mine, mine_branch, open_chain, tip_header, TestChain, EASY_BITS, HARD_BITS};

fn process_all(chain: &mut TestChain, blocks: &[Block]) {
    for block in blocks {
        chain
            .process_new_block(block, &mut NullTxPool, None)
            .expect("process block");
    }
}

#[test]
fn heavier_fork_wins_and_original_chain_comes_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), Arc::clone(&store));

    let genesis = tip_header(&chain);
    let main = mine_branch(&genesis, 1, 10, EASY_BITS, 1);
    process_all(&mut chain, &main);
    assert_eq!(chain.height(), 10);
    let original_best = chain.best_hash().expect("tip");
    let original_coins = store.dump(Column::Utxo).expect("dump");
    let shared: Vec<_> = (0..=5).map(|height| hash_at(&chain, height)).collect();

    let fork = mine_branch(&main[4].header, 6, 4, HARD_BITS, 2);
    process_all(&mut chain, &fork);

    assert_eq!(chain.height(), 9);
    assert_eq!(chain.best_hash(), Some(fork[3].hash()));
    for (height, hash) in shared.iter().enumerate() {
        assert_eq!(hash_at(&chain, height as i32), *hash);
    }
    assert_eq!(chain.coins().best_block().expect("best"), Some(fork[3].hash()));
    let metrics = chain.metrics().snapshot();
    assert_eq!(metrics.reorgs, 1);
    assert_eq!(metrics.deepest_reorg, 5);

    chain
        .invalidate_block(&fork[0].hash(), &mut NullTxPool)
        .expect("invalidate fork");
    assert_eq!(chain.height(), 10);
    assert_eq!(chain.best_hash(), Some(original_best));
    assert_eq!(chain.coins().best_block().expect("best"), Some(original_best));
    assert_eq!(store.dump(Column::Utxo).expect("dump"), original_coins);

    let fork_tip = chain.lookup(&fork[3].hash()).expect("known");
    assert!(chain.index().get(fork_tip).status.has(BlockStatus::FAILED_CHILD));

    chain
        .reconsider_block(&fork[0].hash(), &mut NullTxPool)
        .expect("reconsider fork");
    assert_eq!(chain.best_hash(), Some(fork[3].hash()));
}

#[test]
fn equal_work_keeps_first_seen_tip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut chain = open_chain(dir.path(), Arc::new(MemoryStore::new()));

    let genesis = tip_header(&chain);
    let main = mine_branch(&genesis, 1, 5, EASY_BITS, 1);
    process_all(&mut chain, &main);
    let first = chain.best_hash().expect("tip");

    let rival = mine(&main[3].header, EASY_BITS, vec![coinbase(5, 9)]);
    chain
        .process_new_block(&rival, &mut NullTxPool, None)
        .expect("rival");
    assert_eq!(chain.best_hash(), Some(first));
    assert!(chain.index().is_candidate(chain.tip().expect("tip")));

    let extension = mine(&rival.header, EASY_BITS, vec![coinbase(6, 9)]);
    chain
        .process_new_block(&extension, &mut NullTxPool, None)
        .expect("extension");
    assert_eq!(chain.best_hash(), Some(extension.hash()));
    assert_eq!(chain.height(), 6);
}

#[test]
fn find_fork_returns_common_ancestor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut chain = open_chain(dir.path(), Arc::new(MemoryStore::new()));

    let genesis = tip_header(&chain);
    let main = mine_branch(&genesis, 1, 8, EASY_BITS, 1);
    process_all(&mut chain, &main);
    let side = mine_branch(&main[2].header, 4, 3, EASY_BITS, 3);
    process_all(&mut chain, &side);
    assert_eq!(chain.best_hash(), Some(main[7].hash()));

    let side_tip = chain.lookup(&side[2].hash()).expect("side tip");
    let fork = chain.chain().find_fork(chain.index(), side_tip).expect("fork");
    assert_eq!(chain.index().get(fork).hash, main[2].hash());
    assert_eq!(chain.index().get(fork).height, 3);

    let locator = chain.chain().locator(chain.index(), Some(side_tip));
    let point = chain.find_fork_point(&locator).expect("fork point");
    assert_eq!(point, fork);
}

#[test]
fn invalid_block_on_heavier_fork_is_rejected_with_descendants() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), Arc::clone(&store));

    let genesis = tip_header(&chain);
    let main = mine_branch(&genesis, 1, 6, EASY_BITS, 1);
    process_all(&mut chain, &main);
    let coins = store.dump(Column::Utxo).expect("dump");

    let good = mine(&main[2].header, HARD_BITS, vec![coinbase(4, 4)]);
    let mut greedy = coinbase(5, 4);
    greedy.vout[0].value = 51 * COIN;
    let bad = mine(&good.header, HARD_BITS, vec![greedy]);
    let after_bad = mine(&bad.header, HARD_BITS, vec![coinbase(6, 4)]);

    chain
        .process_new_block(&good, &mut NullTxPool, None)
        .expect("good fork block");
    assert_eq!(chain.best_hash(), Some(good.hash()));
    chain
        .accept_block(&bad)
        .expect("context-free checks pass");
    chain
        .accept_block(&after_bad)
        .expect("descendant stored");
    chain
        .activate_best_chain(None, &mut NullTxPool, None)
        .expect("activation survives an invalid block");

    assert_eq!(chain.best_hash(), Some(good.hash()));
    let bad_handle = chain.lookup(&bad.hash()).expect("known");
    let child = chain.lookup(&after_bad.hash()).expect("known");
    assert!(chain.index().get(bad_handle).status.has(BlockStatus::FAILED_VALID));
    assert!(chain.index().get(child).status.has(BlockStatus::FAILED_CHILD));
    assert!(!chain.index().is_candidate(child));
    assert_eq!(chain.metrics().snapshot().invalid_blocks, 1);

    let again = chain.accept_block(&bad).expect_err("known invalid");
    assert_eq!(
        again.rejection().map(|rejection| &rejection.error),
        Some(&ValidationError::DuplicateInvalid)
    );
    let orphan_of_bad = mine(&after_bad.header, HARD_BITS, vec![coinbase(7, 4)]);
    let err = chain.accept_block(&orphan_of_bad).expect_err("failed parent");
    assert!(matches!(
        err,
        ChainStateError::Invalid(ref rejection) if rejection.error == ValidationError::BadPrevBlock
    ));

    chain
        .invalidate_block(&good.hash(), &mut NullTxPool)
        .expect("invalidate");
    assert_eq!(chain.best_hash(), Some(main[5].hash()));
    assert_eq!(store.dump(Column::Utxo).expect("dump"), coins);
}
