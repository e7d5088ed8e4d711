//! The active chain as a height-indexed vector of index handles.

use cashd_consensus::Hash256;

use crate::blockindex::BlockHandle;
use crate::index::ChainIndex;

#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    blocks: Vec<BlockHandle>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<BlockHandle> {
        self.blocks.first().copied()
    }

    pub fn tip(&self) -> Option<BlockHandle> {
        self.blocks.last().copied()
    }

    /// Tip height, or -1 when the chain is empty.
    pub fn height(&self) -> i32 {
        self.blocks.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<BlockHandle> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.blocks.get(height).copied())
    }

    pub fn contains(&self, index: &ChainIndex, handle: BlockHandle) -> bool {
        self.at(index.get(handle).height) == Some(handle)
    }

    /// Successor of `handle` on this chain.
    pub fn next(&self, index: &ChainIndex, handle: BlockHandle) -> Option<BlockHandle> {
        if self.contains(index, handle) {
            self.at(index.get(handle).height + 1)
        } else {
            None
        }
    }

    /// Makes `tip` the tip, rewriting only the entries that differ.
    pub fn set_tip(&mut self, index: &ChainIndex, tip: Option<BlockHandle>) {
        let Some(tip) = tip else {
            self.blocks.clear();
            return;
        };
        let height = index.get(tip).height as usize;
        self.blocks.resize(height + 1, tip);
        let mut walk = Some(tip);
        while let Some(current) = walk {
            let node = index.get(current);
            let slot = &mut self.blocks[node.height as usize];
            if *slot == current && node.height as usize != height {
                break;
            }
            *slot = current;
            walk = node.prev;
        }
    }

    /// Last block of this chain that is also an ancestor of `handle`.
    pub fn find_fork(&self, index: &ChainIndex, handle: BlockHandle) -> Option<BlockHandle> {
        let mut walk = if index.get(handle).height > self.height() {
            index.get_ancestor(handle, self.height())
        } else {
            Some(handle)
        };
        while let Some(current) = walk {
            if self.contains(index, current) {
                return Some(current);
            }
            walk = index.get(current).prev;
        }
        None
    }

    /// Exponentially spaced hashes from `handle` (or the tip) back to genesis.
    pub fn locator(&self, index: &ChainIndex, handle: Option<BlockHandle>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut walk = handle.or_else(|| self.tip());
        while let Some(current) = walk {
            let node = index.get(current);
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            let height = (node.height - step).max(0);
            walk = if self.contains(index, current) {
                self.at(height)
            } else {
                index.get_ancestor(current, height)
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }

    /// Highest locator entry that is on this chain, else genesis.
    pub fn find_fork_point(&self, index: &ChainIndex, locator: &[Hash256]) -> Option<BlockHandle> {
        for hash in locator {
            if let Some(handle) = index.lookup(hash) {
                if self.contains(index, handle) {
                    return Some(handle);
                }
            }
        }
        self.genesis()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = BlockHandle> + '_ {
        self.blocks.iter().copied()
    }
}
