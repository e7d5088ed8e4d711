//! UTXO set logic backed by the storage trait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cashd_consensus::money::Amount;
use cashd_consensus::Hash256;
use cashd_primitives::encoding::{DecodeError, Decoder, Encoder};
use cashd_primitives::outpoint::OutPoint;
use cashd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

const META_BEST_BLOCK_KEY: &[u8] = b"utxo:best_block";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(18 + self.script_pubkey.len());
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; OUTPOINT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&self.0[32..]);
        OutPoint::new(hash, u32::from_le_bytes(index))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Read access to coins, either the committed set or a layered overlay.
pub trait CoinView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }
}

/// Pending coin changes. `None` marks a spent coin.
#[derive(Clone, Debug, Default)]
pub struct UtxoDelta {
    entries: HashMap<OutPointKey, Option<Coin>>,
}

impl UtxoDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, outpoint: &OutPoint) -> Option<Option<&Coin>> {
        self.entries
            .get(&OutPointKey::new(outpoint))
            .map(Option::as_ref)
    }

    pub fn add_coin(&mut self, outpoint: &OutPoint, coin: Coin) {
        self.entries.insert(OutPointKey::new(outpoint), Some(coin));
    }

    pub fn spend_coin(&mut self, outpoint: &OutPoint) {
        self.entries.insert(OutPointKey::new(outpoint), None);
    }

    /// Layers `other` on top of this delta.
    pub fn merge(&mut self, other: UtxoDelta) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OutPoint, Option<&Coin>)> {
        self.entries
            .iter()
            .map(|(key, coin)| (key.outpoint(), coin.as_ref()))
    }

    pub fn write_to(&self, batch: &mut WriteBatch) {
        batch.reserve(self.entries.len());
        for (key, coin) in &self.entries {
            match coin {
                Some(coin) => batch.put(Column::Utxo, key.as_bytes(), coin.encode()),
                None => batch.delete(Column::Utxo, key.as_bytes()),
            }
        }
    }
}

/// A delta viewed on top of a base view.
pub struct OverlayView<'a, V: ?Sized> {
    base: &'a V,
    delta: &'a UtxoDelta,
}

impl<'a, V: CoinView + ?Sized> OverlayView<'a, V> {
    pub fn new(base: &'a V, delta: &'a UtxoDelta) -> Self {
        Self { base, delta }
    }
}

impl<V: CoinView + ?Sized> CoinView for OverlayView<'_, V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.delta.lookup(outpoint) {
            Some(coin) => Ok(coin.cloned()),
            None => self.base.get_coin(outpoint),
        }
    }
}

struct UtxoCacheEntry {
    coin: Coin,
    stamp: u64,
}

struct UtxoCache {
    entries: HashMap<OutPointKey, UtxoCacheEntry>,
    order: VecDeque<(OutPointKey, u64)>,
    capacity: usize,
    clock: u64,
}

impl UtxoCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            clock: 0,
        }
    }

    fn get(&mut self, key: &OutPointKey) -> Option<Coin> {
        if self.capacity == 0 {
            return None;
        }
        let stamp = self.bump_stamp();
        let entry = self.entries.get_mut(key)?;
        entry.stamp = stamp;
        let coin = entry.coin.clone();
        self.order.push_back((*key, stamp));
        self.compact_order();
        Some(coin)
    }

    fn insert(&mut self, key: OutPointKey, coin: Coin) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.bump_stamp();
        self.entries.insert(key, UtxoCacheEntry { coin, stamp });
        self.order.push_back((key, stamp));
        self.evict();
    }

    fn remove(&mut self, key: &OutPointKey) {
        self.entries.remove(key);
    }

    fn bump_stamp(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.stamp != stamp {
                continue;
            }
            self.entries.remove(&key);
        }
    }

    // Stale stamps pile up on repeated hits.
    fn compact_order(&mut self) {
        if self.order.len() <= self.capacity.saturating_mul(4).max(1024) {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(key, stamp)| entries.get(key).is_some_and(|entry| entry.stamp == *stamp));
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UtxoCacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct UtxoSet<S> {
    store: S,
    cache: Mutex<UtxoCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(UtxoCache::new(cache_capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache_stats(&self) -> UtxoCacheStats {
        UtxoCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid utxo best block record".to_string()))?;
        Ok(Some(hash))
    }

    /// Commits `delta` and the new best-block pointer in one batch.
    pub fn apply_delta(&self, delta: &UtxoDelta, new_best: &Hash256) -> Result<(), StoreError> {
        self.commit(delta, new_best, WriteBatch::new())
    }

    /// Like [`UtxoSet::apply_delta`], also committing the caller's `batch` in
    /// the same atomic write.
    pub fn commit(
        &self,
        delta: &UtxoDelta,
        new_best: &Hash256,
        mut batch: WriteBatch,
    ) -> Result<(), StoreError> {
        delta.write_to(&mut batch);
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *new_best);
        self.store.write_batch(&batch)?;

        if let Ok(mut cache) = self.cache.lock() {
            for (key, coin) in &delta.entries {
                match coin {
                    Some(coin) => cache.insert(*key, coin.clone()),
                    None => cache.remove(key),
                }
            }
        }
        Ok(())
    }

    pub fn for_each_coin(
        &self,
        mut visit: impl FnMut(OutPoint, Coin) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.store
            .for_each_prefix(Column::Utxo, &[], &mut |key, value| {
                let key = OutPointKey::from_slice(key)
                    .ok_or_else(|| StoreError::Backend("invalid utxo key".to_string()))?;
                let coin = Coin::decode(value)
                    .map_err(|err| StoreError::Backend(format!("invalid utxo entry: {err}")))?;
                visit(key.outpoint(), coin)
            })
    }
}

impl<S: KeyValueStore> CoinView for UtxoSet<S> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(coin) = cache.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(coin));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let Some(bytes) = self.store.get(Column::Utxo, key.as_bytes())? else {
            return Ok(None);
        };
        let coin = Coin::decode(&bytes)
            .map_err(|err| StoreError::Backend(format!("invalid utxo entry: {err}")))?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, coin.clone());
        }
        Ok(Some(coin))
    }
}
