//! Transaction merkle tree.

use cashd_consensus::Hash256;

use crate::block::Block;
use crate::hash::hash_pair;

/// Merkle root over `leaves` and whether the tree was malleated.
///
/// A tree is malleated when some level contains two identical adjacent
/// hashes: duplicating the trailing transactions of a block then yields the
/// same root, so such a root cannot prove the block's content.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = leaves.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        if layer.chunks_exact(2).any(|pair| pair[0] == pair[1]) {
            mutated = true;
        }
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }
        layer = layer
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    (layer[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    merkle_root(&txids)
}
