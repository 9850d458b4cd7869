//! Per-wallet projections of the index.
//!
//! A `WalletView` is an ordered collection of `AddressView`s under a
//! client-chosen id, plus an aggregated wallet-scope ledger. Views hold no
//! authority: everything here is rebuilt from the stored script histories
//! and the zero-conf container, against one confirmed-height snapshot.

use std::collections::{BTreeMap, HashMap};

use crate::components::chain::HeaderChain;
use crate::components::storage::Store;
use crate::components::zeroconf::TxioByAddr;
use crate::error::{Error, ErrorKind};
use crate::types::dbkey::{TxKey, TxioKey};
use crate::types::ledger::ZC_BLOCK_NUM;
use crate::types::{LedgerEntry, ScriptHash, TxHash, TxIoPair};

use super::pages::HistoryPages;

/// Blocks before a coinbase output matures.
pub const COINBASE_MATURITY: u32 = 100;

/// Resolves the total output count of a transaction, for the
/// sent-to-self/change-back flags of wallet-scope ledger entries.
pub type TxOutCountFn<'a> = dyn Fn(&TxKey, &TxHash) -> Option<u16> + 'a;

/// One tracked address inside a wallet.
#[derive(Clone, Debug)]
pub struct AddressView {
    scr_addr: ScriptHash,
    /// Relevant TxIO pairs keyed by output key: the scanned confirmed
    /// range plus the current zero-conf additions.
    txios: BTreeMap<TxioKey, TxIoPair>,
    ledger: BTreeMap<TxKey, LedgerEntry>,
    pages: HistoryPages,
    /// Authoritative confirmed pair count, last read from the SSH.
    total_txio_count: u64,
    confirmed_balance: u64,
}

impl AddressView {
    pub fn new(scr_addr: ScriptHash) -> Self {
        AddressView {
            scr_addr,
            txios: BTreeMap::new(),
            ledger: BTreeMap::new(),
            pages: HistoryPages::default(),
            total_txio_count: 0,
            confirmed_balance: 0,
        }
    }

    pub fn scr_addr(&self) -> &ScriptHash {
        &self.scr_addr
    }

    pub fn txios(&self) -> &BTreeMap<TxioKey, TxIoPair> {
        &self.txios
    }

    pub fn ledger(&self) -> &BTreeMap<TxKey, LedgerEntry> {
        &self.ledger
    }

    pub fn total_txio_count(&self) -> u64 {
        self.total_txio_count
    }

    /// Loads the confirmed history for `start..=end` and refreshes the
    /// summary-derived fields.
    fn scan(
        &mut self,
        store: &Store,
        headers: &HeaderChain,
        start: u32,
        end: u32,
        txn_per_page: u32,
    ) -> Result<(), Error> {
        let ssh = store
            .ssh_summary(&self.scr_addr)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        self.total_txio_count = ssh.total_txio_count;
        self.confirmed_balance = ssh.balance;

        let hist = store
            .ssh_history(&self.scr_addr, start, end)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        self.txios.extend(hist);
        // Confirmed pairs whose spend landed in the scanned range are
        // re-fetched above; re-resolve older loaded pairs that the range
        // fetch did not cover but the store now marks spent.
        let reader = store
            .reader()
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        for (key, txio) in self.txios.iter_mut() {
            if txio.is_spent() || key.is_unconfirmed() {
                continue;
            }
            let spent = reader
                .spent_by(key)
                .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
            if let Some(in_key) = spent.filter(|in_key| !in_key.is_unconfirmed()) {
                let spender = reader
                    .tx_record(&in_key.tx_key())
                    .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                if let Some(spender) = spender {
                    txio.set_input(in_key, spender.hash);
                }
            }
        }
        // Release before the next query batch opens its own transaction.
        drop(reader);

        let counts = store
            .ssh_block_counts(&self.scr_addr)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        self.pages = HistoryPages::map_history(&counts, txn_per_page);

        self.rebuild_ledger(headers);
        Ok(())
    }

    /// Merges the container's additions for this address.
    fn scan_zc(&mut self, zc_txios: &BTreeMap<TxioKey, TxIoPair>, headers: &HeaderChain) {
        for (key, txio) in zc_txios {
            self.txios.insert(*key, txio.clone());
        }
        self.rebuild_ledger(headers);
    }

    /// Reverse-applies invalidated zero-conf keys: outputs that were
    /// themselves unconfirmed disappear; confirmed outputs whose
    /// unconfirmed spend vanished become unspent again. Returns the
    /// mempool transactions that dropped out of this address's view.
    fn purge_zc(&mut self, invalidated: &[TxioKey], headers: &HeaderChain) -> Vec<(TxKey, TxHash)> {
        let mut removed = Vec::new();
        for key in invalidated {
            let Some(txio) = self.txios.get_mut(key) else {
                continue;
            };
            if txio.has_zc_in() {
                if let (Some(in_key), Some(in_hash)) = (txio.in_key(), txio.in_hash()) {
                    removed.push((in_key.tx_key(), in_hash));
                }
                txio.clear_input();
            }
            if txio.has_zc_out() {
                removed.push((key.tx_key(), txio.out_hash()));
                self.txios.remove(key);
            }
        }
        self.rebuild_ledger(headers);
        removed
    }

    /// Drops state above the last valid height after a reorg.
    fn update_after_reorg(&mut self, last_valid: u32, headers: &HeaderChain) {
        self.txios.retain(|key, _| match key.height() {
            Some(height) => height <= last_valid,
            // Unconfirmed chains are handled by the purge.
            None => true,
        });
        for txio in self.txios.values_mut() {
            let spent_above = txio
                .in_key()
                .and_then(|in_key| in_key.height())
                .is_some_and(|height| height > last_valid);
            if spent_above {
                txio.clear_input();
            }
        }
        self.rebuild_ledger(headers);
    }

    fn rebuild_ledger(&mut self, headers: &HeaderChain) {
        self.ledger = build_ledger(
            self.scr_addr.as_bytes(),
            self.txios.values(),
            headers,
            0,
            // Change does not apply at address scope.
            &|_, _| None,
        );
    }

    /// Confirmed balance plus the net unconfirmed delta.
    pub fn unconfirmed_delta(&self) -> i64 {
        let mut delta = 0i64;
        for txio in self.txios.values() {
            match (txio.has_zc_out(), txio.has_zc_in()) {
                // Received and spent within the mempool: nets out.
                (true, true) => {}
                (true, false) => delta += txio.value() as i64,
                (false, true) => delta -= txio.value() as i64,
                (false, false) => {}
            }
        }
        delta
    }

    pub fn confirmed_balance(&self) -> u64 {
        self.confirmed_balance
    }

    /// Value of confirmed outputs that count toward the full balance but
    /// cannot be spent right now: immature coinbases and outputs consumed
    /// by a pending unconfirmed spend.
    pub fn unspendable_value(&self, current_height: u32) -> u64 {
        self.txios
            .values()
            .filter(|txio| !txio.has_zc_out())
            .filter(|txio| {
                txio.has_zc_in()
                    || (!txio.is_spent() && !txio.is_spendable(current_height, COINBASE_MATURITY))
            })
            .map(TxIoPair::value)
            .sum()
    }

    /// Count of unconfirmed additions not yet reflected in the SSH count.
    fn zc_txio_count(&self) -> u64 {
        self.txios
            .values()
            .filter(|txio| txio.has_zc_out())
            .count() as u64
    }

    /// Unspent outputs, optionally restricted to currently-spendable ones.
    pub fn utxos(&self, current_height: u32, spendable_only: bool) -> Vec<&TxIoPair> {
        self.txios
            .values()
            .filter(|txio| !txio.is_spent())
            .filter(|txio| {
                if spendable_only {
                    txio.is_spendable(current_height, COINBASE_MATURITY)
                } else {
                    true
                }
            })
            .collect()
    }
}

/// Balance summary returned by `getBalancesAndCount`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    pub full: u64,
    pub spendable: u64,
    pub unconfirmed: i64,
    pub txio_count: u64,
}

/// An ordered collection of addresses under a client-chosen id.
#[derive(Clone, Debug)]
pub struct WalletView {
    id: String,
    addrs: BTreeMap<ScriptHash, AddressView>,
    ledger: BTreeMap<TxKey, LedgerEntry>,
    pages: HistoryPages,
    last_scanned: u32,
    scanned_once: bool,
    is_lockbox: bool,
}

impl WalletView {
    pub fn new(id: String, scr_addrs: Vec<ScriptHash>, is_lockbox: bool) -> Self {
        let addrs = scr_addrs
            .into_iter()
            .map(|sa| (sa.clone(), AddressView::new(sa)))
            .collect();
        WalletView {
            id,
            addrs,
            ledger: BTreeMap::new(),
            pages: HistoryPages::default(),
            last_scanned: 0,
            scanned_once: false,
            is_lockbox,
        }
    }

    /// Where the next incremental scan starts.
    pub fn next_scan_height(&self) -> u32 {
        if self.scanned_once {
            self.last_scanned + 1
        } else {
            0
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_lockbox(&self) -> bool {
        self.is_lockbox
    }

    pub fn scr_addrs(&self) -> impl Iterator<Item = &ScriptHash> {
        self.addrs.keys()
    }

    pub fn address(&self, scr_addr: &ScriptHash) -> Option<&AddressView> {
        self.addrs.get(scr_addr)
    }

    pub fn last_scanned(&self) -> u32 {
        self.last_scanned
    }

    pub fn ledger(&self) -> &BTreeMap<TxKey, LedgerEntry> {
        &self.ledger
    }

    /// Scans all addresses over `start..=end` against one store snapshot
    /// and rebuilds the aggregated ledger.
    pub fn scan(
        &mut self,
        store: &Store,
        headers: &HeaderChain,
        start: u32,
        end: u32,
        txn_per_page: u32,
        n_outputs_of: &TxOutCountFn<'_>,
    ) -> Result<(), Error> {
        if start > end {
            return Ok(());
        }
        for addr in self.addrs.values_mut() {
            addr.scan(store, headers, start, end, txn_per_page)?;
        }
        self.last_scanned = end;
        self.scanned_once = true;
        self.rebuild(headers, txn_per_page, n_outputs_of);
        Ok(())
    }

    /// Applies the container's new TxIO snapshot. Returns the wallet-scope
    /// ledger entries of the touched transactions.
    pub fn scan_zc(
        &mut self,
        zc_txio: &TxioByAddr,
        headers: &HeaderChain,
        txn_per_page: u32,
        n_outputs_of: &TxOutCountFn<'_>,
    ) -> Vec<LedgerEntry> {
        let mut touched: Vec<TxKey> = Vec::new();
        for (sa, addr) in self.addrs.iter_mut() {
            if let Some(txios) = zc_txio.get(sa) {
                addr.scan_zc(txios, headers);
                touched.extend(txios.values().flat_map(|txio| {
                    txio.in_key()
                        .map(|in_key| in_key.tx_key())
                        .into_iter()
                        .chain([txio.out_key().tx_key()])
                }));
            }
        }
        if touched.is_empty() {
            return Vec::new();
        }
        self.rebuild(headers, txn_per_page, n_outputs_of);
        touched.sort();
        touched.dedup();
        touched
            .into_iter()
            .filter_map(|key| self.ledger.get(&key).cloned())
            .collect()
    }

    /// Reverse-applies a purge delta. Returns the dropped mempool
    /// transactions, for the invalidation callback.
    pub fn purge_zc(
        &mut self,
        invalidated: &HashMap<ScriptHash, Vec<TxioKey>>,
        headers: &HeaderChain,
        txn_per_page: u32,
        n_outputs_of: &TxOutCountFn<'_>,
    ) -> Vec<(TxKey, TxHash)> {
        let mut removed = Vec::new();
        for (sa, addr) in self.addrs.iter_mut() {
            if let Some(keys) = invalidated.get(sa) {
                removed.extend(addr.purge_zc(keys, headers));
            }
        }
        if !removed.is_empty() {
            self.rebuild(headers, txn_per_page, n_outputs_of);
            removed.sort();
            removed.dedup();
        }
        removed
    }

    /// Wallet-side reorg processing.
    pub fn update_after_reorg(
        &mut self,
        last_valid: u32,
        headers: &HeaderChain,
        txn_per_page: u32,
        n_outputs_of: &TxOutCountFn<'_>,
    ) {
        for addr in self.addrs.values_mut() {
            addr.update_after_reorg(last_valid, headers);
        }
        self.last_scanned = self.last_scanned.min(last_valid);
        self.rebuild(headers, txn_per_page, n_outputs_of);
    }

    fn rebuild(&mut self, headers: &HeaderChain, txn_per_page: u32, n_outputs_of: &TxOutCountFn<'_>) {
        self.ledger = build_ledger(
            self.id.as_bytes(),
            self.addrs.values().flat_map(|addr| addr.txios.values()),
            headers,
            0,
            n_outputs_of,
        );

        // Wallet-level paging sums the per-address summaries per height.
        let mut summary: BTreeMap<u32, u32> = BTreeMap::new();
        for addr in self.addrs.values() {
            for txio in addr.txios.values() {
                if let Some(height) = txio.out_key().height() {
                    *summary.entry(height).or_default() += 1;
                }
            }
        }
        self.pages = HistoryPages::map_history(&summary, txn_per_page);
    }

    /// Balances and pair count against one confirmed-height snapshot.
    pub fn balances(&self, current_height: u32) -> Balances {
        let mut balances = Balances::default();
        for addr in self.addrs.values() {
            balances.full += addr.confirmed_balance();
            balances.unconfirmed += addr.unconfirmed_delta();
            balances.txio_count += addr.total_txio_count() + addr.zc_txio_count();
            balances.spendable += addr
                .confirmed_balance()
                .saturating_sub(addr.unspendable_value(current_height));
        }
        balances
    }

    pub fn utxos(&self, current_height: u32, spendable_only: bool) -> Vec<(&ScriptHash, &TxIoPair)> {
        self.addrs
            .values()
            .flat_map(|addr| {
                addr.utxos(current_height, spendable_only)
                    .into_iter()
                    .map(move |txio| (addr.scr_addr(), txio))
            })
            .collect()
    }

    /// A page of the wallet-scope ledger, most recent page first.
    pub fn history_page(
        &mut self,
        page_id: usize,
        headers: &HeaderChain,
        store: &Store,
        n_outputs_of: &TxOutCountFn<'_>,
    ) -> Result<Vec<LedgerEntry>, Error> {
        let id = self.id.clone();
        let addrs = &self.addrs;
        let ledgers = self.pages.page_ledger_map(page_id, |start, end| {
            let mut txios: Vec<TxIoPair> = Vec::new();
            for sa in addrs.keys() {
                let hist = store
                    .ssh_history(sa, start, end)
                    .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                txios.extend(hist.into_values());
            }
            Ok(build_ledger(
                id.as_bytes(),
                txios.iter(),
                headers,
                start,
                n_outputs_of,
            ))
        })?;
        let mut entries: Vec<LedgerEntry> = ledgers.values().cloned().collect();
        entries.sort();
        Ok(entries)
    }

    /// Invalidate cached pages after a refresh.
    pub fn invalidate_pages(&mut self) {
        self.pages.invalidate();
    }

    /// The wallet-scope ledger entry of one transaction, if present.
    pub fn ledger_entry_for_tx(&self, tx_key: &TxKey) -> Option<&LedgerEntry> {
        self.ledger.get(tx_key)
    }
}

/// Folds TxIO pairs into per-transaction ledger entries.
///
/// Each output side contributes `+value` to its transaction's entry, each
/// input side `-value`. Height and index derive from the db keys; the
/// timestamp comes from the pair or, failing that, the block header.
/// Entries below `start_block` are skipped (their page owns them).
pub fn build_ledger<'a>(
    scope: &[u8],
    txios: impl Iterator<Item = &'a TxIoPair>,
    headers: &HeaderChain,
    start_block: u32,
    n_outputs_of: &TxOutCountFn<'_>,
) -> BTreeMap<TxKey, LedgerEntry> {
    struct Event {
        value: i64,
        hash: TxHash,
        tx_time: u32,
        coinbase: bool,
        received: u16,
        spent: bool,
    }

    let mut events: BTreeMap<TxKey, Event> = BTreeMap::new();
    let mut record = |tx_key: TxKey, hash: TxHash, value: i64, tx_time: u32, coinbase: bool| {
        let event = events.entry(tx_key).or_insert(Event {
            value: 0,
            hash,
            tx_time,
            coinbase: false,
            received: 0,
            spent: false,
        });
        event.value += value;
        event.coinbase |= coinbase;
        if value >= 0 {
            event.received += 1;
        } else {
            event.spent = true;
        }
    };

    for txio in txios {
        record(
            txio.out_key().tx_key(),
            txio.out_hash(),
            txio.value() as i64,
            txio.tx_time(),
            txio.from_coinbase(),
        );
        if let (Some(in_key), Some(in_hash)) = (txio.in_key(), txio.in_hash()) {
            record(in_key.tx_key(), in_hash, -(txio.value() as i64), txio.tx_time(), false);
        }
    }

    let mut ledger = BTreeMap::new();
    for (tx_key, event) in events {
        let (block_num, index) = match tx_key.height() {
            Some(height) => (height, u32::from(tx_key.tx_index().expect("confirmed"))),
            None => (ZC_BLOCK_NUM, tx_key.zc_counter().expect("unconfirmed")),
        };
        if block_num < start_block {
            continue;
        }
        let tx_time = if event.tx_time != 0 {
            event.tx_time
        } else {
            headers.timestamp_at(block_num).unwrap_or(0)
        };
        let mut entry = LedgerEntry::new(
            scope.to_vec(),
            event.value,
            block_num,
            event.hash,
            index,
            tx_time,
        );
        entry.coinbase = event.coinbase;
        if event.spent && event.received > 0 {
            entry.change_back = true;
            entry.sent_to_self =
                n_outputs_of(&tx_key, &event.hash).is_some_and(|n_outputs| event.received == n_outputs);
        }
        ledger.insert(tx_key, entry);
    }
    ledger
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> ScriptHash {
        ScriptHash::from_hash160([tag; 20])
    }

    fn headers() -> HeaderChain {
        let mut chain = HeaderChain::new();
        for height in 0u8..5 {
            chain.push(
                u32::from(height),
                crate::types::BlockHeader {
                    hash: crate::types::BlockHash([height + 1; 32]),
                    prev_hash: crate::types::BlockHash([height; 32]),
                    timestamp: 1_000 + u32::from(height),
                },
            );
        }
        chain
    }

    #[test]
    fn ledger_nets_outputs_and_inputs_per_tx() {
        let receive = TxKey::confirmed(1, 0, 0);
        let spend = TxKey::confirmed(3, 0, 2);
        let mut txio = TxIoPair::new_output(receive.with_io(0), TxHash([1; 32]), 700);
        txio.set_input(spend.with_io(0), TxHash([2; 32]));
        let other = TxIoPair::new_output(spend.with_io(1), TxHash([2; 32]), 250);

        let ledger = build_ledger(
            b"w",
            [txio, other].iter(),
            &headers(),
            0,
            &|_, _| Some(2),
        );
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[&receive].value, 700);
        // The spend nets -700 against the 250 change-back output.
        let spend_entry = &ledger[&spend];
        assert_eq!(spend_entry.value, -450);
        assert!(spend_entry.change_back);
        assert!(!spend_entry.sent_to_self);
        assert_eq!(spend_entry.tx_time, 1_003);
    }

    #[test]
    fn sent_to_self_requires_owning_every_output() {
        let receive = TxKey::confirmed(1, 0, 0);
        let spend = TxKey::confirmed(2, 0, 0);
        let mut spent = TxIoPair::new_output(receive.with_io(0), TxHash([1; 32]), 500);
        spent.set_input(spend.with_io(0), TxHash([2; 32]));
        let back = TxIoPair::new_output(spend.with_io(0), TxHash([2; 32]), 490);

        let ledger = build_ledger(b"w", [spent, back].iter(), &headers(), 0, &|_, _| Some(1));
        assert!(ledger[&spend].sent_to_self);
    }

    #[test]
    fn zc_entries_sort_last_and_carry_the_sentinel_block() {
        let zc = TxKey::zero_conf(4);
        let txio = TxIoPair::new_output(zc.with_io(0), TxHash([9; 32]), 100).with_tx_time(123);
        let ledger = build_ledger(b"a", [txio].iter(), &headers(), 0, &|_, _| None);
        let entry = &ledger[&zc];
        assert_eq!(entry.block_num, ZC_BLOCK_NUM);
        assert_eq!(entry.index, 4);
        assert_eq!(entry.tx_time, 123);
    }

    #[test]
    fn unconfirmed_delta_nets_chained_pairs() {
        let mut view = AddressView::new(addr(1));
        // Confirmed output spent by a pending tx: -500.
        let mut pending_spend =
            TxIoPair::new_output(TxKey::confirmed(1, 0, 0).with_io(0), TxHash([1; 32]), 500);
        pending_spend.set_input(TxKey::zero_conf(0).with_io(0), TxHash([2; 32]));
        // Unconfirmed change output: +450.
        let change = TxIoPair::new_output(TxKey::zero_conf(0).with_io(1), TxHash([2; 32]), 450);
        // Received and re-spent inside the mempool: nets zero.
        let mut churn = TxIoPair::new_output(TxKey::zero_conf(1).with_io(0), TxHash([3; 32]), 70);
        churn.set_input(TxKey::zero_conf(2).with_io(0), TxHash([4; 32]));

        for txio in [pending_spend, change, churn] {
            view.txios.insert(txio.out_key(), txio);
        }
        assert_eq!(view.unconfirmed_delta(), -50);
    }

    #[test]
    fn purge_restores_spent_outputs_and_drops_zc_outputs() {
        let chain = headers();
        let mut view = AddressView::new(addr(1));
        let conf_key = TxKey::confirmed(1, 0, 0).with_io(0);
        let mut spent = TxIoPair::new_output(conf_key, TxHash([1; 32]), 500);
        spent.set_input(TxKey::zero_conf(0).with_io(0), TxHash([2; 32]));
        let zc_out = TxKey::zero_conf(0).with_io(1);
        let change = TxIoPair::new_output(zc_out, TxHash([2; 32]), 450);
        view.txios.insert(conf_key, spent);
        view.txios.insert(zc_out, change);

        view.purge_zc(&[conf_key, zc_out], &chain);
        assert_eq!(view.txios.len(), 1);
        assert!(!view.txios[&conf_key].is_spent());
        assert_eq!(view.unconfirmed_delta(), 0);
    }

    #[test]
    fn reorg_drops_txios_above_the_fork_and_unspends_inputs() {
        let chain = headers();
        let mut view = AddressView::new(addr(1));
        let old = TxKey::confirmed(1, 0, 0).with_io(0);
        let mut spent_late = TxIoPair::new_output(old, TxHash([1; 32]), 300);
        spent_late.set_input(TxKey::confirmed(4, 0, 0).with_io(0), TxHash([4; 32]));
        let gone = TxKey::confirmed(4, 0, 1).with_io(0);
        view.txios.insert(old, spent_late);
        view.txios
            .insert(gone, TxIoPair::new_output(gone, TxHash([5; 32]), 900));

        view.update_after_reorg(2, &chain);
        assert_eq!(view.txios.len(), 1);
        assert!(!view.txios[&old].is_spent());
        assert_eq!(view.ledger.len(), 1);
    }
}
