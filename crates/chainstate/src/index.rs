//! In-memory block tree: every known header, candidate tips and the queues
//! of blocks still waiting on an ancestor.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cashd_consensus::constants::MEDIAN_TIME_SPAN;
use cashd_consensus::Hash256;
use cashd_pow::difficulty::{block_proof, HeaderInfo};
use cashd_primitives::block::BlockHeader;
use cashd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use smallvec::SmallVec;

use crate::blockindex::{get_skip_height, BlockHandle, BlockIndex, BlockStatus, DiskBlockIndex};
use crate::error::ChainStateError;
use crate::flatfiles::FileLocation;

/// Ordering key for candidate tips: more work first, then the earliest
/// sequence id. The greatest key is the best candidate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    chain_work: U256,
    sequence: Reverse<u64>,
    handle: BlockHandle,
}

/// A header that cannot be placed in the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderInsertError {
    /// The compact target is malformed or encodes no work.
    BadBits { hash: Hash256, bits: u32 },
}

impl std::fmt::Display for HeaderInsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderInsertError::BadBits { hash, bits } => write!(
                f,
                "header {} has unusable bits {bits:#010x}",
                cashd_consensus::hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for HeaderInsertError {}

#[derive(Clone, Debug)]
pub struct HeaderInsert {
    pub handle: BlockHandle,
    pub existed: bool,
    /// Headers that became attached to the tree, the inserted one first
    /// followed by any waiting descendants in breadth-first order.
    pub linked: Vec<BlockHandle>,
}

#[derive(Default)]
pub struct ChainIndex {
    nodes: Vec<BlockIndex>,
    by_hash: HashMap<Hash256, BlockHandle>,
    children: Vec<SmallVec<[BlockHandle; 2]>>,
    /// Work contributed by each header on its own.
    proofs: Vec<U256>,
    candidates: BTreeSet<CandidateKey>,
    /// Bodies waiting for an ancestor body, keyed by parent hash.
    orphans: HashMap<Hash256, VecDeque<BlockHandle>>,
    /// Headers waiting for their parent header, keyed by parent hash.
    header_orphans: HashMap<Hash256, Vec<BlockHandle>>,
    genesis: Option<BlockHandle>,
    best_header: Option<BlockHandle>,
    next_sequence_id: u64,
    dirty: HashSet<BlockHandle>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self {
            next_sequence_id: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `handle` did not come from this index.
    pub fn get(&self, handle: BlockHandle) -> &BlockIndex {
        &self.nodes[handle.index()]
    }

    pub(crate) fn get_mut(&mut self, handle: BlockHandle) -> &mut BlockIndex {
        self.dirty.insert(handle);
        &mut self.nodes[handle.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockHandle> {
        self.by_hash.get(hash).copied()
    }

    pub fn genesis(&self) -> Option<BlockHandle> {
        self.genesis
    }

    /// Most-work header that is linked to genesis and not failed.
    pub fn best_header(&self) -> Option<BlockHandle> {
        self.best_header
    }

    pub fn is_linked(&self, handle: BlockHandle) -> bool {
        self.get(handle).prev.is_some() || self.genesis == Some(handle)
    }

    pub fn children(&self, handle: BlockHandle) -> &[BlockHandle] {
        &self.children[handle.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &BlockIndex)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (BlockHandle::new(index), node))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_candidate(&self, handle: BlockHandle) -> bool {
        self.candidates.contains(&self.candidate_key(handle))
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(VecDeque::len).sum()
    }

    pub fn unlinked_header_count(&self) -> usize {
        self.header_orphans.values().map(Vec::len).sum()
    }

    /// Block at `height` on the path from `handle` to genesis.
    ///
    /// # Panics
    ///
    /// Panics when the walk runs out of parents before reaching `height`;
    /// that only happens with a corrupt index.
    pub fn get_ancestor(&self, handle: BlockHandle, height: i32) -> Option<BlockHandle> {
        let start = self.get(handle);
        if height < 0 || height > start.height {
            return None;
        }
        let mut walk = handle;
        let mut walk_height = start.height;
        while walk_height > height {
            let node = self.get(walk);
            let skip_height = get_skip_height(walk_height);
            let skip_height_prev = get_skip_height(walk_height - 1);
            let take_skip = node.skip.is_some()
                && (skip_height == height
                    || (skip_height > height
                        && !(skip_height_prev < skip_height - 2 && skip_height_prev >= height)));
            match (take_skip, node.skip, node.prev) {
                (true, Some(skip), _) => {
                    walk = skip;
                    walk_height = skip_height;
                }
                (_, _, Some(prev)) => {
                    walk = prev;
                    walk_height -= 1;
                }
                _ => panic!(
                    "block index corrupt: no parent below height {walk_height} while seeking {height}"
                ),
            }
        }
        debug_assert_eq!(self.get(walk).height, height);
        Some(walk)
    }

    /// Inserts a header. Returns the existing handle for known hashes.
    /// Headers whose bits encode no work are refused.
    pub fn insert_header(&mut self, header: BlockHeader) -> Result<HeaderInsert, HeaderInsertError> {
        let hash = header.hash();
        if let Some(handle) = self.lookup(&hash) {
            return Ok(HeaderInsert {
                handle,
                existed: true,
                linked: Vec::new(),
            });
        }
        let proof = block_proof(header.bits)
            .ok()
            .filter(|proof| !proof.is_zero())
            .ok_or(HeaderInsertError::BadBits {
                hash,
                bits: header.bits,
            })?;

        let handle = BlockHandle::new(self.nodes.len());
        let prev_hash = header.prev_block;
        self.nodes.push(BlockIndex::new(header));
        self.children.push(SmallVec::new());
        self.proofs.push(proof);
        self.by_hash.insert(hash, handle);
        self.dirty.insert(handle);

        let mut linked = Vec::new();
        if prev_hash == [0u8; 32] {
            if self.genesis.is_none() {
                self.genesis = Some(handle);
                self.attach_root(handle);
                linked.push(handle);
                self.relink_waiting(handle, &mut linked);
            }
        } else {
            match self.lookup(&prev_hash) {
                Some(parent) if self.is_linked(parent) => {
                    self.link(handle, parent);
                    linked.push(handle);
                    self.relink_waiting(handle, &mut linked);
                }
                _ => {
                    self.header_orphans.entry(prev_hash).or_default().push(handle);
                }
            }
        }

        Ok(HeaderInsert {
            handle,
            existed: false,
            linked,
        })
    }

    fn attach_root(&mut self, handle: BlockHandle) {
        let proof = self.proofs[handle.index()];
        let node = &mut self.nodes[handle.index()];
        node.height = 0;
        node.chain_work = proof;
        node.time_max = node.header.time;
        node.status.raise_validity(BlockStatus::VALID_TREE);
        self.consider_best_header(handle);
    }

    fn link(&mut self, handle: BlockHandle, parent: BlockHandle) {
        let (parent_height, parent_work, parent_time_max, parent_failed) = {
            let parent = self.get(parent);
            (
                parent.height,
                parent.chain_work,
                parent.time_max,
                parent.status.is_failed(),
            )
        };
        let height = parent_height + 1;
        let skip = self.get_ancestor(parent, get_skip_height(height));
        let proof = self.proofs[handle.index()];

        let node = &mut self.nodes[handle.index()];
        node.prev = Some(parent);
        node.skip = skip;
        node.height = height;
        node.chain_work = parent_work + proof;
        node.time_max = parent_time_max.max(node.header.time);
        if parent_failed {
            node.status.insert(BlockStatus::FAILED_CHILD);
        } else {
            node.status.raise_validity(BlockStatus::VALID_TREE);
        }
        self.children[parent.index()].push(handle);
        self.dirty.insert(handle);
        self.consider_best_header(handle);
    }

    fn relink_waiting(&mut self, root: BlockHandle, linked: &mut Vec<BlockHandle>) {
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            let hash = self.get(parent).hash;
            let Some(waiting) = self.header_orphans.remove(&hash) else {
                continue;
            };
            for child in waiting {
                self.link(child, parent);
                linked.push(child);
                queue.push_back(child);
            }
        }
        // Bodies that arrived before their headers were linked.
        for &handle in linked.iter() {
            let node = self.get(handle);
            if node.status.has_data() && node.chain_tx_count == 0 && self.parent_connected(handle) {
                let prev_hash = node.header.prev_block;
                self.remove_orphan(&prev_hash, handle);
                self.promote_to_branch(handle);
            }
        }
    }

    fn consider_best_header(&mut self, handle: BlockHandle) {
        let node = self.get(handle);
        if node.status.is_failed() {
            return;
        }
        let better = match self.best_header {
            Some(best) => node.chain_work > self.get(best).chain_work,
            None => true,
        };
        if better {
            self.best_header = Some(handle);
        }
    }

    fn recompute_best_header(&mut self) {
        self.best_header = None;
        for index in 0..self.nodes.len() {
            let handle = BlockHandle::new(index);
            if self.is_linked(handle) {
                self.consider_best_header(handle);
            }
        }
    }

    fn parent_connected(&self, handle: BlockHandle) -> bool {
        match self.get(handle).prev {
            Some(prev) => self.get(prev).chain_tx_count > 0,
            None => self.genesis == Some(handle),
        }
    }

    /// Records that the body of `handle` is stored and passed context-free
    /// checks. Returns whether the block (and possibly queued descendants)
    /// became connectable.
    pub fn mark_body_received(
        &mut self,
        handle: BlockHandle,
        tx_count: u32,
        data_pos: FileLocation,
    ) -> bool {
        {
            let node = self.get_mut(handle);
            node.tx_count = tx_count;
            node.data_pos = Some(data_pos);
            node.status.insert(BlockStatus::HAVE_DATA);
            node.status.raise_validity(BlockStatus::VALID_TRANSACTIONS);
        }
        if self.get(handle).chain_tx_count > 0 {
            return false;
        }
        if self.is_linked(handle) && self.parent_connected(handle) {
            self.promote_to_branch(handle);
            true
        } else {
            let prev_hash = self.get(handle).header.prev_block;
            let queue = self.orphans.entry(prev_hash).or_default();
            if !queue.contains(&handle) {
                queue.push_back(handle);
            }
            false
        }
    }

    /// Makes `handle` a candidate tip and releases any queued descendants,
    /// breadth first.
    pub fn promote_to_branch(&mut self, handle: BlockHandle) {
        let mut queue = VecDeque::from([handle]);
        while let Some(current) = queue.pop_front() {
            let parent_chain_tx = match self.get(current).prev {
                Some(prev) => self.get(prev).chain_tx_count,
                None => 0,
            };
            let sequence_id = self.next_sequence_id;
            self.next_sequence_id += 1;
            let node = &mut self.nodes[current.index()];
            node.chain_tx_count = parent_chain_tx + u64::from(node.tx_count);
            node.sequence_id = sequence_id;
            let hash = node.hash;
            if !node.status.is_failed() {
                let key = self.candidate_key(current);
                self.candidates.insert(key);
            }
            if let Some(children) = self.orphans.remove(&hash) {
                queue.extend(children);
            }
        }
    }

    pub fn find_most_work_candidate(&self) -> Option<BlockHandle> {
        self.candidates.last().map(|key| key.handle)
    }

    /// True when `a` is preferred over `b` as a tip.
    pub fn better_tip(&self, a: BlockHandle, b: BlockHandle) -> bool {
        self.candidate_key(a) > self.candidate_key(b)
    }

    pub fn remove_candidate(&mut self, handle: BlockHandle) {
        let key = self.candidate_key(handle);
        self.candidates.remove(&key);
    }

    pub fn add_candidate(&mut self, handle: BlockHandle) {
        let node = self.get(handle);
        if node.chain_tx_count > 0 && !node.status.is_failed() && node.status.has_data() {
            let key = self.candidate_key(handle);
            self.candidates.insert(key);
        }
    }

    /// Drops every candidate that cannot beat `tip`, keeping `tip` itself.
    pub fn prune_candidates(&mut self, tip: BlockHandle) {
        let key = self.candidate_key(tip);
        self.candidates = self.candidates.split_off(&key);
    }

    /// Rebuilds the candidate set from scratch against `tip`.
    pub fn rebuild_candidates(&mut self, tip: Option<BlockHandle>) {
        self.candidates.clear();
        let tip_key = tip.map(|tip| self.candidate_key(tip));
        for index in 0..self.nodes.len() {
            let handle = BlockHandle::new(index);
            let node = self.get(handle);
            if node.chain_tx_count == 0 || node.status.is_failed() || !node.status.has_data() {
                continue;
            }
            let key = self.candidate_key(handle);
            if tip_key.map_or(true, |tip_key| key >= tip_key) {
                self.candidates.insert(key);
            }
        }
    }

    fn candidate_key(&self, handle: BlockHandle) -> CandidateKey {
        let node = self.get(handle);
        CandidateKey {
            chain_work: node.chain_work,
            sequence: Reverse(node.sequence_id),
            handle,
        }
    }

    /// Marks `handle` failed and every known descendant failed-child, and
    /// drops them from the candidate set and the orphan queues. Returns the
    /// descendants that were newly marked.
    pub fn mark_failed(&mut self, handle: BlockHandle) -> Vec<BlockHandle> {
        self.remove_candidate(handle);
        let prev_hash = self.get(handle).header.prev_block;
        self.remove_orphan(&prev_hash, handle);
        self.get_mut(handle)
            .status
            .insert(BlockStatus::FAILED_VALID);

        let mut marked = Vec::new();
        let mut queue: VecDeque<BlockHandle> = self.children(handle).iter().copied().collect();
        while let Some(child) = queue.pop_front() {
            self.remove_candidate(child);
            let child_prev = self.get(child).header.prev_block;
            self.remove_orphan(&child_prev, child);
            let node = self.get_mut(child);
            if !node.status.has(BlockStatus::FAILED_CHILD) {
                node.status.insert(BlockStatus::FAILED_CHILD);
                marked.push(child);
            }
            queue.extend(self.children(child).iter().copied());
        }

        if self
            .best_header
            .is_some_and(|best| self.get(best).status.is_failed())
        {
            self.recompute_best_header();
        }
        marked
    }

    /// Clears failure flags on `handle`, its ancestors and its descendants.
    pub fn clear_failure(&mut self, handle: BlockHandle) -> Vec<BlockHandle> {
        let mut cleared = Vec::new();
        let mut queue = VecDeque::from([handle]);
        while let Some(current) = queue.pop_front() {
            if self.get(current).status.is_failed() {
                self.get_mut(current)
                    .status
                    .remove(BlockStatus::FAILED_MASK);
                cleared.push(current);
            }
            queue.extend(self.children(current).iter().copied());
        }
        let mut walk = self.get(handle).prev;
        while let Some(current) = walk {
            if self.get(current).status.is_failed() {
                self.get_mut(current)
                    .status
                    .remove(BlockStatus::FAILED_MASK);
                cleared.push(current);
            }
            walk = self.get(current).prev;
        }
        for &current in &cleared {
            self.get_mut(current)
                .status
                .raise_validity(BlockStatus::VALID_TREE);
            self.consider_best_header(current);
        }
        cleared
    }

    fn remove_orphan(&mut self, parent_hash: &Hash256, handle: BlockHandle) {
        if let Some(queue) = self.orphans.get_mut(parent_hash) {
            queue.retain(|queued| *queued != handle);
            if queue.is_empty() {
                self.orphans.remove(parent_hash);
            }
        }
    }

    /// Median of the last 11 block times ending at `handle`.
    pub fn median_time_past(&self, handle: BlockHandle) -> i64 {
        let mut times: SmallVec<[i64; MEDIAN_TIME_SPAN]> = SmallVec::new();
        let mut walk = Some(handle);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.get(current);
            times.push(node.time());
            walk = node.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Up to `len` headers ending at `handle`, oldest first.
    pub fn header_window(&self, handle: BlockHandle, len: usize) -> Vec<HeaderInfo> {
        let mut window = Vec::with_capacity(len);
        let mut walk = Some(handle);
        while let Some(current) = walk {
            if window.len() == len {
                break;
            }
            let node = self.get(current);
            window.push(HeaderInfo {
                height: node.height,
                time: node.time(),
                bits: node.header.bits,
                chain_work: node.chain_work,
            });
            walk = node.prev;
        }
        window.reverse();
        window
    }

    /// Last block shared by the paths from `a` and `b` to genesis.
    pub fn last_common_ancestor(&self, a: BlockHandle, b: BlockHandle) -> Option<BlockHandle> {
        let (mut a, mut b) = (a, b);
        let (height_a, height_b) = (self.get(a).height, self.get(b).height);
        if height_a > height_b {
            a = self.get_ancestor(a, height_b)?;
        } else if height_b > height_a {
            b = self.get_ancestor(b, height_a)?;
        }
        while a != b {
            a = self.get(a).prev?;
            b = self.get(b).prev?;
        }
        Some(a)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every dirty, linked entry into `batch`. Call
    /// [`ChainIndex::clear_dirty`] once the batch has been committed.
    pub fn flush(&self, batch: &mut WriteBatch) -> usize {
        let mut written = 0;
        for &handle in &self.dirty {
            if !self.is_linked(handle) {
                continue;
            }
            let node = self.get(handle);
            batch.put(Column::BlockIndex, node.hash, node.to_disk().encode());
            written += 1;
        }
        written
    }

    pub fn clear_dirty(&mut self) {
        let unlinked: Vec<BlockHandle> = self
            .dirty
            .iter()
            .copied()
            .filter(|handle| !self.is_linked(*handle))
            .collect();
        self.dirty.clear();
        self.dirty.extend(unlinked);
    }

    /// Rebuilds the index from persisted records. Within a height, blocks on
    /// the path to `preferred_tip` get the earliest sequence ids.
    pub fn load<S: KeyValueStore>(
        store: &S,
        preferred_tip: Option<&Hash256>,
    ) -> Result<Self, ChainStateError> {
        let mut records = Vec::new();
        store.for_each_prefix(Column::BlockIndex, &[], &mut |key, value| {
            let record = DiskBlockIndex::decode(value)
                .map_err(|err| StoreError::Backend(format!("invalid block index record: {err}")))?;
            records.push((key.to_vec(), record));
            Ok(())
        })?;
        records.sort_by_key(|(_, record)| record.height);

        let mut index = Self::new();
        for (key, record) in records {
            let hash = record.header.hash();
            if key.as_slice() != hash.as_slice() {
                return Err(ChainStateError::corrupt(
                    "block index key does not match header hash",
                    Some(hash),
                    Some(record.height),
                ));
            }
            let parent = record.header.prev_block;
            if parent != [0u8; 32] && index.lookup(&parent).is_none() {
                return Err(ChainStateError::corrupt(
                    "block index record without parent",
                    Some(hash),
                    Some(record.height),
                ));
            }
            let insert = index.insert_header(record.header.clone()).map_err(|_| {
                ChainStateError::corrupt(
                    "block index record has unusable bits",
                    Some(hash),
                    Some(record.height),
                )
            })?;
            if insert.linked.is_empty() {
                return Err(ChainStateError::corrupt(
                    "block index record could not be linked",
                    Some(hash),
                    Some(record.height),
                ));
            }
            let handle = insert.handle;
            let node = &mut index.nodes[handle.index()];
            if node.height != record.height {
                return Err(ChainStateError::corrupt(
                    "block index height mismatch",
                    Some(hash),
                    Some(record.height),
                ));
            }
            node.status = BlockStatus::from_bits(record.status);
            node.tx_count = record.tx_count;
            node.data_pos = record.data_pos;
            node.undo_pos = record.undo_pos;
        }

        let preferred: HashSet<BlockHandle> = {
            let mut path = HashSet::new();
            let mut walk = preferred_tip.and_then(|hash| index.lookup(hash));
            while let Some(current) = walk {
                path.insert(current);
                walk = index.get(current).prev;
            }
            path
        };
        let mut order: Vec<BlockHandle> = (0..index.nodes.len()).map(BlockHandle::new).collect();
        order.sort_by_key(|handle| {
            let node = index.get(*handle);
            (node.height, !preferred.contains(handle), node.hash)
        });
        for handle in order {
            let node = index.get(handle);
            if !node.status.has_data() || node.chain_tx_count > 0 {
                continue;
            }
            if index.parent_connected(handle) {
                index.promote_to_branch(handle);
            } else {
                let prev_hash = node.header.prev_block;
                index.orphans.entry(prev_hash).or_default().push_back(handle);
            }
        }
        index.recompute_best_header();
        index.dirty.clear();
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashd_storage::memory::MemoryStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const EASY_BITS: u32 = 0x207f_ffff;

    fn header(prev_block: Hash256, tag: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block,
            merkle_root: [0u8; 32],
            time: 1_000 + tag,
            bits,
            nonce: tag,
        }
    }

    fn location(tag: u32) -> FileLocation {
        FileLocation {
            file_id: 0,
            offset: u64::from(tag) * 100,
            len: 10,
        }
    }

    /// Builds a linear chain of `len` headers and returns their handles.
    fn linear_chain(index: &mut ChainIndex, len: u32) -> Vec<BlockHandle> {
        let mut handles = Vec::new();
        let mut prev = [0u8; 32];
        for tag in 0..len {
            let handle = index.insert_header(header(prev, tag, EASY_BITS)).expect("insert header").handle;
            prev = index.get(handle).hash;
            handles.push(handle);
        }
        handles
    }

    #[test]
    fn ancestor_lookup_on_random_tree() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut index = ChainIndex::new();
        let genesis = index
            .insert_header(header([0u8; 32], 0, EASY_BITS))
            .expect("insert header")
            .handle;
        let mut handles = vec![genesis];
        // Each new block extends a random existing block, so skip pointers
        // are built in random order across many branches.
        for tag in 1..30_000u32 {
            let parent = if rng.gen_bool(0.9) {
                *handles.last().expect("handles")
            } else {
                handles[rng.gen_range(0..handles.len())]
            };
            let prev = index.get(parent).hash;
            let handle = index
                .insert_header(header(prev, tag, EASY_BITS))
                .expect("insert header")
                .handle;
            handles.push(handle);
        }

        for _ in 0..2_000 {
            let start = handles[rng.gen_range(0..handles.len())];
            let start_height = index.get(start).height;
            let target = rng.gen_range(0..=start_height);

            let mut expected = start;
            while index.get(expected).height > target {
                expected = index.get(expected).prev.expect("prev");
            }
            assert_eq!(index.get_ancestor(start, target), Some(expected));
        }
    }

    #[test]
    fn ancestor_lookup_on_long_linear_chain() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 30_000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5_000 {
            let high = rng.gen_range(0..handles.len());
            let low = rng.gen_range(0..=high);
            assert_eq!(
                index.get_ancestor(handles[high], low as i32),
                Some(handles[low])
            );
        }
        let tip = *handles.last().expect("tip");
        assert_eq!(index.get_ancestor(tip, 30_000), None);
        assert_eq!(index.get_ancestor(tip, -1), None);
    }

    #[test]
    fn headers_without_work_are_refused() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 3);
        let tip_hash = index.get(handles[2]).hash;
        for bits in [0, 0x0100_0000, 0x0480_0001] {
            let err = index
                .insert_header(header(tip_hash, 42, bits))
                .expect_err("bits without work");
            assert!(matches!(err, HeaderInsertError::BadBits { bits: b, .. } if b == bits));
        }
        assert_eq!(index.len(), 3);
        assert_eq!(index.children(handles[2]).len(), 0);
    }

    #[test]
    fn chain_work_increases_along_every_link() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 50);
        for handle in handles {
            let node = index.get(handle);
            if let Some(prev) = node.prev {
                assert!(node.chain_work > index.get(prev).chain_work);
                assert_eq!(node.height, index.get(prev).height + 1);
            }
        }
    }

    #[test]
    fn late_parent_relinks_waiting_headers() {
        let mut index = ChainIndex::new();
        let genesis_header = header([0u8; 32], 0, EASY_BITS);
        let a = header(genesis_header.hash(), 1, EASY_BITS);
        let b = header(a.hash(), 2, EASY_BITS);
        let c = header(b.hash(), 3, EASY_BITS);

        index.insert_header(genesis_header).expect("insert header");
        let c_insert = index.insert_header(c).expect("insert header");
        let b_insert = index.insert_header(b).expect("insert header");
        assert!(c_insert.linked.is_empty());
        assert!(b_insert.linked.is_empty());
        assert_eq!(index.unlinked_header_count(), 2);

        let a_insert = index.insert_header(a).expect("insert header");
        let handles = [
            a_insert.handle,
            b_insert.handle,
            c_insert.handle,
        ];
        assert_eq!(a_insert.linked, handles.to_vec());
        assert_eq!(index.get(handles[2]).height, 3);
        assert_eq!(index.best_header(), Some(handles[2]));
        assert_eq!(index.unlinked_header_count(), 0);
        assert_eq!(index.get_ancestor(handles[2], 1), Some(handles[0]));
    }

    #[test]
    fn bodies_out_of_order_promote_breadth_first() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 4);
        assert!(!index.mark_body_received(handles[2], 1, location(2)));
        assert!(!index.mark_body_received(handles[3], 1, location(3)));
        assert!(!index.mark_body_received(handles[1], 1, location(1)));
        assert_eq!(index.orphan_count(), 3);
        assert_eq!(index.find_most_work_candidate(), None);

        assert!(index.mark_body_received(handles[0], 1, location(0)));
        assert_eq!(index.orphan_count(), 0);
        assert_eq!(index.find_most_work_candidate(), Some(handles[3]));
        assert_eq!(index.get(handles[3]).chain_tx_count, 4);
        let sequence: Vec<u64> = handles.iter().map(|h| index.get(*h).sequence_id).collect();
        assert!(sequence.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn equal_work_tie_goes_to_first_seen() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 2);
        let parent = index.get(handles[1]).hash;
        let a = index.insert_header(header(parent, 100, EASY_BITS)).expect("insert header").handle;
        let b = index.insert_header(header(parent, 200, EASY_BITS)).expect("insert header").handle;
        index.mark_body_received(handles[0], 1, location(0));
        index.mark_body_received(handles[1], 1, location(1));
        index.mark_body_received(b, 1, location(3));
        index.mark_body_received(a, 1, location(2));
        assert_eq!(index.get(a).chain_work, index.get(b).chain_work);
        assert_eq!(index.find_most_work_candidate(), Some(b));
        assert!(index.better_tip(b, a));
    }

    #[test]
    fn failure_propagates_to_descendants() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 5);
        for (tag, handle) in handles.iter().enumerate() {
            index.mark_body_received(*handle, 1, location(tag as u32));
        }
        let side_parent = index.get(handles[2]).hash;
        let side = index
            .insert_header(header(side_parent, 77, EASY_BITS))
            .expect("insert header")
            .handle;

        let marked = index.mark_failed(handles[2]);
        assert_eq!(marked.len(), 3);
        assert!(index.get(handles[4]).status.has(BlockStatus::FAILED_CHILD));
        assert!(index.get(side).status.has(BlockStatus::FAILED_CHILD));
        assert_eq!(index.find_most_work_candidate(), Some(handles[1]));
        assert_eq!(index.best_header(), Some(handles[1]));

        // A header arriving under a failed block is failed on link.
        let late_parent = index.get(handles[4]).hash;
        let late = index
            .insert_header(header(late_parent, 99, EASY_BITS))
            .expect("insert header")
            .handle;
        assert!(index.get(late).status.is_failed());

        let cleared = index.clear_failure(handles[2]);
        assert!(cleared.contains(&handles[4]));
        index.rebuild_candidates(None);
        assert_eq!(index.find_most_work_candidate(), Some(handles[4]));
    }

    #[test]
    fn failed_body_orphans_are_dropped() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 3);
        index.mark_body_received(handles[2], 1, location(2));
        assert_eq!(index.orphan_count(), 1);
        index.mark_failed(handles[1]);
        assert_eq!(index.orphan_count(), 0);
    }

    #[test]
    fn prune_keeps_only_competitive_candidates() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 4);
        for (tag, handle) in handles.iter().enumerate() {
            index.mark_body_received(*handle, 1, location(tag as u32));
        }
        assert_eq!(index.candidate_count(), 4);
        index.prune_candidates(handles[2]);
        assert_eq!(index.candidate_count(), 2);
        assert!(index.is_candidate(handles[2]));
        assert!(!index.is_candidate(handles[1]));
    }

    #[test]
    fn median_time_and_common_ancestor() {
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 20);
        // Times are 1000 + height; the median of the last 11 ending at 19 is 1014.
        assert_eq!(index.median_time_past(handles[19]), 1_014);
        assert_eq!(index.median_time_past(handles[0]), 1_000);

        let fork_parent = index.get(handles[9]).hash;
        let fork = index
            .insert_header(header(fork_parent, 500, EASY_BITS))
            .expect("insert header")
            .handle;
        assert_eq!(
            index.last_common_ancestor(fork, handles[19]),
            Some(handles[9])
        );
        let window = index.header_window(handles[19], 5);
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].height, 15);
        assert_eq!(window[4].height, 19);
    }

    #[test]
    fn flush_and_load_restore_the_tree() {
        let store = MemoryStore::new();
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 6);
        for (tag, handle) in handles.iter().enumerate().take(4) {
            index.mark_body_received(*handle, 2, location(tag as u32));
        }
        let mut batch = WriteBatch::new();
        assert_eq!(index.flush(&mut batch), 6);
        store.write_batch(&batch).expect("commit");
        index.clear_dirty();
        assert_eq!(index.dirty_count(), 0);

        let tip_hash = index.get(handles[3]).hash;
        let loaded = ChainIndex::load(&store, Some(&tip_hash)).expect("load");
        assert_eq!(loaded.len(), 6);
        let tip = loaded.lookup(&tip_hash).expect("tip");
        assert_eq!(loaded.get(tip).height, 3);
        assert_eq!(loaded.get(tip).chain_tx_count, 8);
        assert_eq!(loaded.get(tip).chain_work, index.get(handles[3]).chain_work);
        assert_eq!(loaded.find_most_work_candidate(), Some(tip));
        let last = loaded.lookup(&index.get(handles[5]).hash).expect("last");
        assert_eq!(loaded.best_header(), Some(last));
    }

    #[test]
    fn load_rejects_record_without_parent() {
        let store = MemoryStore::new();
        let mut index = ChainIndex::new();
        let handles = linear_chain(&mut index, 3);
        let mut batch = WriteBatch::new();
        index.flush(&mut batch);
        store.write_batch(&batch).expect("commit");
        let mut delete = WriteBatch::new();
        delete.delete(Column::BlockIndex, index.get(handles[1]).hash);
        store.write_batch(&delete).expect("delete");

        let err = ChainIndex::load(&store, None).err().expect("corrupt");
        assert!(err.is_fatal());
    }
}
