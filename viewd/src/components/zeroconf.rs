//! The zero-confirmation container.
//!
//! Maintains the mempool's intersection with the tracked address set,
//! surviving new blocks, reorgs, and double-spends. The network thread
//! stages raw transactions; the sync task is the sole writer of the
//! resolved maps, and readers receive snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::warn;

use crate::types::dbkey::{TxKey, TxioKey};
use crate::types::{ScriptHash, Tx, TxHash, TxIoPair};

use super::storage::{StorageError, Store, StoreReader};

/// Per-address TxIO maps, the shape consumed by wallet scans.
pub type TxioByAddr = HashMap<ScriptHash, BTreeMap<TxioKey, TxIoPair>>;

#[derive(Debug, Default)]
struct ZcState {
    tx_map: BTreeMap<TxKey, Tx>,
    hash_to_key: HashMap<TxHash, TxKey>,
    /// The full "mine" view of the mempool.
    txio_map: TxioByAddr,
}

/// The zero-conf container.
pub struct ZeroConfContainer {
    /// Staging buffer written by the network thread.
    staged: Mutex<BTreeMap<TxKey, Tx>>,
    state: RwLock<ZcState>,
    /// Additions since the last consumer take.
    new_txio: Mutex<TxioByAddr>,
    top_id: AtomicU32,
    staged_signal: tokio::sync::Notify,
    with_second_order_multisig: bool,
}

impl Default for ZeroConfContainer {
    fn default() -> Self {
        ZeroConfContainer::new(true)
    }
}

impl ZeroConfContainer {
    pub fn new(with_second_order_multisig: bool) -> Self {
        ZeroConfContainer {
            staged: Mutex::new(BTreeMap::new()),
            state: RwLock::new(ZcState::default()),
            new_txio: Mutex::new(TxioByAddr::new()),
            top_id: AtomicU32::new(0),
            staged_signal: tokio::sync::Notify::new(),
            with_second_order_multisig,
        }
    }

    /// Allocates the next zero-conf key. Strictly increasing for the
    /// lifetime of the container.
    pub fn new_zc_key(&self) -> TxKey {
        TxKey::zero_conf(self.top_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Stages an incoming mempool transaction.
    ///
    /// Called by the network thread; returns immediately. `tx_time` is the
    /// local receive time, the tie-breaker for ordering unconfirmed chains
    /// (the p2p side enforces enough granularity for it to be unique).
    pub fn add_raw_tx(&self, mut tx: Tx, tx_time: u32) {
        tx.tx_time = tx_time;
        let key = self.new_zc_key();
        self.staged
            .lock()
            .expect("not poisoned")
            .insert(key, tx);
        self.staged_signal.notify_one();
    }

    /// Completes when the staging buffer may have new content.
    pub async fn staged_wakeup(&self) {
        self.staged_signal.notified().await;
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.lock().expect("not poisoned").is_empty()
    }

    /// Resolves the staged transactions against the confirmed state and
    /// the known mempool. Runs on the sync task. Returns whether any of
    /// them touched a tracked address.
    ///
    /// Transactions are processed in key (receive) order, so a chain of
    /// unconfirmed spends staged in one batch resolves parent-first. If
    /// the staging buffer grows during a pass, only the added keys are
    /// parsed on the next pass.
    pub fn parse_new_zc(
        &self,
        filter: &dyn Fn(&ScriptHash) -> bool,
        store: &Store,
    ) -> Result<bool, StorageError> {
        let mut zc_is_ours = false;
        let reader = store.reader()?;
        let mut snapshot = self.staged.lock().expect("not poisoned").clone();
        let mut processed: BTreeSet<TxKey> = BTreeSet::new();

        loop {
            for (&zc_key, tx) in &snapshot {
                if !processed.insert(zc_key) {
                    continue;
                }

                let state = self.state.read().expect("not poisoned");
                if state.hash_to_key.contains_key(&tx.hash) {
                    // Already have this one.
                    continue;
                }
                let found = match bulk_filter(
                    &state,
                    tx,
                    zc_key,
                    tx.tx_time,
                    filter,
                    self.with_second_order_multisig,
                    &reader,
                ) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("dropping mempool tx {}: {e}", tx.hash);
                        continue;
                    }
                };
                drop(state);

                if found.is_empty() {
                    continue;
                }

                let mut state = self.state.write().expect("not poisoned");
                state.hash_to_key.insert(tx.hash, zc_key);
                state.tx_map.insert(zc_key, tx.clone());
                let mut new_txio = self.new_txio.lock().expect("not poisoned");
                for (sa, txios) in found {
                    state
                        .txio_map
                        .entry(sa.clone())
                        .or_default()
                        .extend(txios.clone());
                    new_txio.entry(sa).or_default().extend(txios);
                }
                zc_is_ours = true;
            }

            let mut staged = self.staged.lock().expect("not poisoned");
            let added: BTreeMap<TxKey, Tx> = staged
                .iter()
                .filter(|(key, _)| !snapshot.contains_key(key))
                .map(|(key, tx)| (*key, tx.clone()))
                .collect();
            if added.is_empty() {
                staged.clear();
                break;
            }
            drop(staged);
            snapshot.extend(added);
        }

        Ok(zc_is_ours)
    }

    /// Re-resolves the whole container against the post-block store state.
    ///
    /// A new block may mine some of our mempool transactions or double-spend
    /// their inputs, breaking every chain rooted in an invalidated one; only
    /// a full re-parse against the updated confirmed state produces a
    /// correct frontier. Returns, per address, the TxIO keys that did not
    /// survive, for wallets to reverse-apply.
    pub fn purge(
        &self,
        filter: &dyn Fn(&ScriptHash) -> bool,
        store: &Store,
    ) -> Result<HashMap<ScriptHash, Vec<TxioKey>>, StorageError> {
        let reader = store.reader()?;
        let old = self.state.read().expect("not poisoned");

        // Parse the survivors into a candidate state. Chained lookups go
        // through the candidate, so a child whose parent was just mined
        // re-resolves through the store instead, and a child whose parent
        // was invalidated dies with it (processed in receive order, this
        // takes down the whole dependent chain).
        let mut candidate = ZcState::default();
        'txs: for (&zc_key, tx) in &old.tx_map {
            for input in &tx.inputs {
                let txid = &input.prevout.txid;
                let parent_invalidated = old.hash_to_key.contains_key(txid)
                    && !candidate.hash_to_key.contains_key(txid)
                    && reader.tx_key_for_hash(txid)?.is_none();
                if parent_invalidated {
                    continue 'txs;
                }
            }
            let found = match bulk_filter(
                &candidate,
                tx,
                zc_key,
                tx.tx_time,
                filter,
                self.with_second_order_multisig,
                &reader,
            ) {
                Ok(found) => found,
                Err(e) => {
                    warn!("dropping mempool tx {} during purge: {e}", tx.hash);
                    continue;
                }
            };
            if found.is_empty() {
                continue;
            }
            candidate.hash_to_key.insert(tx.hash, zc_key);
            candidate.tx_map.insert(zc_key, tx.clone());
            for (sa, txios) in found {
                candidate.txio_map.entry(sa).or_default().extend(txios);
            }
        }

        // Every key present before and absent after was invalidated.
        let mut invalidated: HashMap<ScriptHash, Vec<TxioKey>> = HashMap::new();
        for (sa, old_txios) in &old.txio_map {
            let surviving = candidate.txio_map.get(sa);
            for key in old_txios.keys() {
                if !surviving.is_some_and(|txios| txios.contains_key(key)) {
                    invalidated.entry(sa.clone()).or_default().push(*key);
                }
            }
        }
        drop(old);

        // Trim the unconsumed additions to what survived, then swap the
        // candidate in.
        let mut new_txio = self.new_txio.lock().expect("not poisoned");
        new_txio.retain(|sa, txios| {
            match candidate.txio_map.get(sa) {
                Some(surviving) => {
                    txios.retain(|key, _| surviving.contains_key(key));
                    !txios.is_empty()
                }
                None => false,
            }
        });
        drop(new_txio);
        *self.state.write().expect("not poisoned") = candidate;

        Ok(invalidated)
    }

    /// The zero-conf key of a mempool transaction, if tracked.
    pub fn zc_key_for_hash(&self, hash: &TxHash) -> Option<TxKey> {
        self.state
            .read()
            .expect("not poisoned")
            .hash_to_key
            .get(hash)
            .copied()
    }

    pub fn tx_by_hash(&self, hash: &TxHash) -> Option<Tx> {
        let state = self.state.read().expect("not poisoned");
        let key = state.hash_to_key.get(hash)?;
        state.tx_map.get(key).cloned()
    }

    /// Drains the additions accumulated since the last call.
    pub fn take_new_txio(&self) -> TxioByAddr {
        std::mem::take(&mut *self.new_txio.lock().expect("not poisoned"))
    }

    /// The current mempool TxIOs of the given addresses.
    pub fn txio_for_addrs<'a>(
        &self,
        addrs: impl Iterator<Item = &'a ScriptHash>,
    ) -> TxioByAddr {
        let state = self.state.read().expect("not poisoned");
        addrs
            .filter_map(|sa| {
                state
                    .txio_map
                    .get(sa)
                    .map(|txios| (sa.clone(), txios.clone()))
            })
            .collect()
    }

    /// Number of resolved mempool transactions.
    pub fn tx_count(&self) -> usize {
        self.state.read().expect("not poisoned").tx_map.len()
    }
}

/// Decides whether a candidate mempool transaction is "ours", synthesizing
/// the TxIO pairs it contributes, grouped by address.
///
/// Inputs are matched first against the known mempool (cheaper than the
/// store, and required for unconfirmed chains), then against the confirmed
/// store. Outputs are matched through the filter predicate; bare multisig
/// outputs are additionally matched through their embedded pubkeys when
/// second-order multisig is enabled.
fn bulk_filter(
    state: &ZcState,
    tx: &Tx,
    zc_key: TxKey,
    tx_time: u32,
    filter: &dyn Fn(&ScriptHash) -> bool,
    with_second_order_multisig: bool,
    reader: &StoreReader<'_>,
) -> Result<TxioByAddr, StorageError> {
    let mut found = TxioByAddr::new();

    // Already mined: invalid as a zero-conf candidate.
    if reader.tx_key_for_hash(&tx.hash)?.is_some() {
        return Ok(found);
    }

    for (in_index, input) in tx.inputs.iter().enumerate() {
        let prevout = input.prevout;
        if prevout.is_null() {
            continue;
        }
        let in_key = zc_key.with_io(in_index as u16);

        // Chained unconfirmed output?
        if let Some(&parent_key) = state.hash_to_key.get(&prevout.txid) {
            let Some(parent) = state.tx_map.get(&parent_key) else {
                continue;
            };
            let Some(parent_out) = parent.outputs.get(prevout.vout as usize) else {
                warn!("mempool tx {} spends missing output {}", tx.hash, prevout.vout);
                continue;
            };
            let sa = ScriptHash::from_script(&parent_out.script_pubkey);
            let mut txio =
                TxIoPair::new_output(parent_key.with_io(prevout.vout as u16), prevout.txid, parent_out.value)
                    .with_tx_time(tx_time);
            txio.set_input(in_key, tx.hash);
            found.entry(sa).or_default().insert(txio.out_key(), txio);
            continue;
        }

        // Confirmed output?
        let Some(out_tx_key) = reader.tx_key_for_hash(&prevout.txid)? else {
            continue;
        };
        let out_key = out_tx_key.with_io(prevout.vout as u16);
        // A confirmed spend of the same outpoint is a conflict: the
        // candidate (and everything chained on it) is invalid.
        if reader
            .spent_by(&out_key)?
            .is_some_and(|in_key| !in_key.is_unconfirmed())
        {
            return Ok(TxioByAddr::new());
        }
        let Some(stxo) = reader.stored_txout(&out_key)? else {
            continue;
        };
        if filter(&stxo.scr_addr) {
            let mut txio = TxIoPair::new_output(out_key, prevout.txid, stxo.value)
                .with_coinbase(stxo.from_coinbase)
                .with_tx_time(tx_time);
            txio.set_input(in_key, tx.hash);
            found
                .entry(stxo.scr_addr)
                .or_default()
                .insert(txio.out_key(), txio);
        }
    }

    for (out_index, output) in tx.outputs.iter().enumerate() {
        let sa = ScriptHash::from_script(&output.script_pubkey);
        let out_key = zc_key.with_io(out_index as u16);
        if filter(&sa) {
            let txio = TxIoPair::new_output(out_key, tx.hash, output.value).with_tx_time(tx_time);
            found.entry(sa).or_default().insert(out_key, txio);
            continue;
        }

        // It could still be a multisig involving one of our addresses,
        // even though we aren't watching the multisig script itself.
        if with_second_order_multisig {
            if let Some((_, _, members)) = sa.multisig_members() {
                if members.iter().any(filter) {
                    let txio = TxIoPair::new_output(out_key, tx.hash, output.value)
                        .with_tx_time(tx_time)
                        .with_multisig(true);
                    found.entry(sa).or_default().insert(out_key, txio);
                }
            }
        }
    }

    Ok(found)
}
