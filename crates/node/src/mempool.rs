use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use cashd_chainstate::mempool::{TxPool, TxPoolError, TxPoolErrorKind};
use cashd_chainstate::utxo::CoinView;
use cashd_consensus::money::money_range;
use cashd_consensus::{hash256_to_hex, Hash256};
use cashd_log::{log_debug, log_warn};
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::Transaction;

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    pub fee: i64,
    pub time: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MempoolInsertOutcome {
    pub evicted: u64,
    pub evicted_bytes: u64,
    pub evicted_txids: Vec<Hash256>,
}

struct EvictCandidate {
    txid: Hash256,
    fee: i64,
    size: usize,
    time: u64,
}

/// Unconfirmed transactions keyed by txid, bounded by serialized size.
pub struct TxMempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, HashSet<Hash256>>,
    total_bytes: usize,
    max_bytes: usize,
    revision: u64,
}

impl TxMempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            children: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            revision: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    /// Admits `tx` if every input resolves against `coins` or another pool
    /// entry and none is already spent by the pool.
    pub fn accept(
        &mut self,
        tx: Transaction,
        coins: &dyn CoinView,
    ) -> Result<MempoolInsertOutcome, TxPoolError> {
        if tx.is_coinbase() {
            return Err(TxPoolError::new(TxPoolErrorKind::Invalid, "coinbase"));
        }
        let txid = tx.txid();
        let size = tx.serialized_size();
        if size > self.max_bytes {
            return Err(TxPoolError::new(
                TxPoolErrorKind::PoolFull,
                "transaction exceeds mempool size limit",
            ));
        }
        if self.entries.contains_key(&txid) {
            return Err(TxPoolError::new(
                TxPoolErrorKind::AlreadyInPool,
                "transaction already in mempool",
            ));
        }

        let mut value_in = 0i64;
        let mut parents: HashSet<Hash256> = HashSet::new();
        for input in &tx.vin {
            if self.spent.contains_key(&input.prevout) {
                return Err(TxPoolError::new(
                    TxPoolErrorKind::ConflictingInput,
                    "input already spent by a mempool transaction",
                ));
            }
            let value = match self.entries.get(&input.prevout.hash) {
                Some(parent) => {
                    parents.insert(parent.txid);
                    parent
                        .tx
                        .vout
                        .get(input.prevout.index as usize)
                        .map(|output| output.value)
                }
                None => coins
                    .get_coin(&input.prevout)
                    .map_err(|err| TxPoolError::new(TxPoolErrorKind::Internal, err.to_string()))?
                    .map(|coin| coin.value),
            };
            let value = value.ok_or_else(|| {
                TxPoolError::new(TxPoolErrorKind::MissingInput, "missing inputs")
            })?;
            value_in = value_in
                .checked_add(value)
                .filter(|total| money_range(*total))
                .ok_or_else(|| TxPoolError::new(TxPoolErrorKind::Invalid, "input value out of range"))?;
        }
        let value_out = tx
            .value_out()
            .ok_or_else(|| TxPoolError::new(TxPoolErrorKind::Invalid, "output value out of range"))?;
        let fee = value_in - value_out;
        if fee < 0 {
            return Err(TxPoolError::new(
                TxPoolErrorKind::Invalid,
                "outputs exceed inputs",
            ));
        }

        for input in &tx.vin {
            self.spent.insert(input.prevout.clone(), txid);
        }
        for parent in parents {
            self.children.entry(parent).or_default().insert(txid);
        }
        self.entries.insert(
            txid,
            MempoolEntry {
                txid,
                tx,
                size,
                fee,
                time: now_secs(),
            },
        );
        self.total_bytes = self.total_bytes.saturating_add(size);
        self.revision = self.revision.saturating_add(1);

        Ok(self.evict_to_fit())
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
            if let Some(siblings) = self.children.get_mut(&input.prevout.hash) {
                siblings.remove(txid);
                if siblings.is_empty() {
                    self.children.remove(&input.prevout.hash);
                }
            }
        }
        self.children.remove(txid);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.revision = self.revision.saturating_add(1);
        Some(entry)
    }

    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) || !self.entries.contains_key(&next) {
                continue;
            }
            order.push(next);
            if let Some(children) = self.children.get(&next) {
                queue.extend(children.iter().copied());
            }
        }
        order
            .iter()
            .filter_map(|txid| self.remove(txid))
            .collect()
    }

    fn evict_to_fit(&mut self) -> MempoolInsertOutcome {
        let mut outcome = MempoolInsertOutcome::default();
        if self.total_bytes <= self.max_bytes {
            return outcome;
        }

        let mut candidates: Vec<EvictCandidate> = self
            .entries
            .values()
            .map(|entry| EvictCandidate {
                txid: entry.txid,
                fee: entry.fee,
                size: entry.size.max(1),
                time: entry.time,
            })
            .collect();

        // Lowest fee rate first; older and then smaller txid break ties.
        candidates.sort_by(|a, b| {
            let left = i128::from(a.fee).saturating_mul(b.size as i128);
            let right = i128::from(b.fee).saturating_mul(a.size as i128);
            left.cmp(&right)
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.txid.cmp(&b.txid))
        });

        for candidate in candidates {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            let removed = self.remove_with_descendants(&candidate.txid);
            outcome.evicted = outcome.evicted.saturating_add(removed.len() as u64);
            outcome.evicted_bytes = outcome
                .evicted_bytes
                .saturating_add(removed.iter().map(|entry| entry.size as u64).sum::<u64>());
            outcome
                .evicted_txids
                .extend(removed.iter().map(|entry| entry.txid));
        }
        outcome
    }
}

impl TxPool for TxMempool {
    fn remove_confirmed(&mut self, txs: &[Transaction]) {
        for tx in txs {
            let txid = tx.txid();
            self.remove(&txid);
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let Some(conflict) = self.spent.get(&input.prevout).copied() else {
                    continue;
                };
                let removed = self.remove_with_descendants(&conflict);
                log_debug!(
                    "Mempool: dropped {} transaction(s) conflicting with {}",
                    removed.len(),
                    hash256_to_hex(&txid)
                );
            }
        }
    }

    fn try_readmit(&mut self, tx: &Transaction, coins: &dyn CoinView) -> Result<(), TxPoolError> {
        let txid = tx.txid();
        let outcome = self.accept(tx.clone(), coins)?;
        if outcome.evicted_txids.contains(&txid) {
            return Err(TxPoolError::new(
                TxPoolErrorKind::PoolFull,
                "mempool full",
            ));
        }
        if outcome.evicted > 0 {
            log_warn!(
                "Mempool: evicted {} transaction(s) ({} bytes) to fit readmitted {}",
                outcome.evicted,
                outcome.evicted_bytes,
                hash256_to_hex(&txid)
            );
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
