#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use cashd_chainstate::blockstore::BlockStore;
use cashd_chainstate::index::ChainIndex;
use cashd_chainstate::blockindex::BlockHandle;
use cashd_chainstate::policy::PolicyOracle;
use cashd_chainstate::script::AcceptAllScripts;
use cashd_chainstate::state::{ChainState, ChainStateSettings};
use cashd_consensus::money::{Amount, COIN};
use cashd_consensus::{consensus_params, ConsensusParams, Hash256, Network};
use cashd_pow::difficulty::DifficultyError;
use cashd_pow::validation::check_proof_of_work;
use cashd_primitives::block::{Block, BlockHeader};
use cashd_primitives::merkle::block_merkle_root;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::script::{push_data, push_int};
use cashd_primitives::transaction::{Transaction, TxIn, TxOut};
use cashd_storage::memory::MemoryStore;

pub const EASY_BITS: u32 = 0x207f_ffff;
pub const HARD_BITS: u32 = 0x2000_ffff;

/// Regtest rules, except that any difficulty the header commits to is
/// accepted so branches can be given different work.
pub struct FreeBitsPolicy(pub ConsensusParams);

impl PolicyOracle for FreeBitsPolicy {
    fn params(&self) -> &ConsensusParams {
        &self.0
    }

    fn next_work_required(
        &self,
        _index: &ChainIndex,
        _prev: BlockHandle,
        header: &BlockHeader,
    ) -> Result<u32, DifficultyError> {
        Ok(header.bits)
    }
}

pub type TestChain = ChainState<Arc<MemoryStore>>;

pub fn open_chain(dir: &Path, store: Arc<MemoryStore>) -> TestChain {
    open_chain_with(
        dir,
        store,
        Box::new(FreeBitsPolicy(consensus_params(Network::Regtest))),
    )
}

pub fn open_chain_with(dir: &Path, store: Arc<MemoryStore>, policy: Box<dyn PolicyOracle>) -> TestChain {
    let blocks = BlockStore::open(dir, 1 << 20).expect("block store");
    ChainState::open(
        store,
        blocks,
        policy,
        Box::new(AcceptAllScripts),
        ChainStateSettings::default(),
    )
    .expect("open chainstate")
}

pub fn coinbase(height: i32, salt: u8) -> Transaction {
    let mut script_sig = push_int(i64::from(height));
    push_data(&mut script_sig, &[salt]);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: Amount, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51, tag],
        }],
        lock_time: 0,
    }
}

/// Builds a block on `parent` and grinds the nonce until it meets `bits`.
pub fn mine(parent: &BlockHeader, bits: u32, transactions: Vec<Transaction>) -> Block {
    let params = consensus_params(Network::Regtest);
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_block: parent.hash(),
            merkle_root: [0u8; 32],
            time: parent.time + 600,
            bits,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    while !check_proof_of_work(&block.header.hash(), block.header.bits, &params) {
        block.header.nonce += 1;
    }
    block
}

/// Mines `count` coinbase-only blocks on `parent`, heights starting at
/// `first_height`.
pub fn mine_branch(
    parent: &BlockHeader,
    first_height: i32,
    count: usize,
    bits: u32,
    salt: u8,
) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for i in 0..count {
        let prev = blocks.last().map_or(parent, |block| &block.header);
        let height = first_height + i as i32;
        blocks.push(mine(prev, bits, vec![coinbase(height, salt)]));
    }
    blocks
}

pub fn tip_header(chain: &TestChain) -> BlockHeader {
    chain.tip_index().expect("tip").header.clone()
}

pub fn hash_at(chain: &TestChain, height: i32) -> Hash256 {
    let handle = chain.chain().at(height).expect("height on active chain");
    chain.index().get(handle).hash
}

/// Recomputes the merkle root and grinds a fresh nonce after the caller
/// edited the block.
pub fn regrind(block: &mut Block) {
    let params = consensus_params(Network::Regtest);
    block.header.merkle_root = block_merkle_root(block).0;
    block.header.nonce = 0;
    while !check_proof_of_work(&block.header.hash(), block.header.bits, &params) {
        block.header.nonce += 1;
    }
}
