//! The script-address filter and side-scan coordinator.
//!
//! The filter decides which outputs the index tracks. In `Super` mode every
//! script hash passes; in `Selective` mode only the registered set does.
//! Addresses registered while the index is already at the chain tip cannot
//! be inserted directly (their history predates the watermark), so they are
//! queued as side-scan jobs. A side scan runs detached from the main
//! indexer, collects its results in memory, and hands them back as a
//! [`MergeReport`]; the sync task integrates reports at a safe point
//! between blocks and rescans the trailing reorg window before accepting
//! the addresses live.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::config::DbMode;
use crate::error::{Error, ErrorKind};
use crate::types::dbkey::TxioKey;
use crate::types::{ScriptHash, TxIoPair};

use super::storage::{StorageError, Store};

/// Number of trailing blocks re-scanned when a merge is integrated, to
/// absorb blocks and reorgs that landed while the side scan ran.
pub const MERGE_RESCAN_WINDOW: u32 = 100;

/// Outcome of a registration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The addresses are live; the caller may proceed.
    Immediate,
    /// A side scan was queued; wait for the refresh notification.
    Deferred,
}

/// Registration state of one tracked address.
#[derive(Clone, Debug)]
pub struct AddrState {
    pub last_scanned: u32,
    /// Wallet that registered the address, for refresh routing.
    pub wallet_id: String,
}

/// A queued background rescan for late-registered addresses.
#[derive(Clone, Debug)]
pub struct SideScanJob {
    pub addrs: Vec<(ScriptHash, u32)>,
    pub wallet_id: String,
    /// Fresh addresses have no history by definition; the block sweep is
    /// skipped and only the registration is merged.
    pub fresh: bool,
}

impl SideScanJob {
    /// The lowest `last_scanned` among the job's addresses: where the side
    /// scan starts.
    pub fn scan_from(&self) -> u32 {
        self.addrs
            .iter()
            .map(|(_, last_scanned)| *last_scanned)
            .min()
            .unwrap_or(0)
    }

    /// The highest `last_scanned`: collected UTXOs at or below this height
    /// are already in the main index and must be discarded on merge.
    pub fn cutoff(&self) -> u32 {
        self.addrs
            .iter()
            .map(|(_, last_scanned)| *last_scanned)
            .max()
            .unwrap_or(0)
    }
}

/// The result of a completed side scan, pending integration.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub addrs: Vec<(ScriptHash, u32)>,
    pub wallet_id: String,
    /// Collected history, to be written by the sync task.
    pub txios: HashMap<ScriptHash, Vec<TxIoPair>>,
    /// Unspent keys above the cutoff height.
    pub utxos: BTreeSet<TxioKey>,
    pub cutoff: u32,
    pub scanned_to: u32,
}

/// The script-address filter.
pub struct ScrAddrFilter {
    mode: DbMode,
    addrs: RwLock<HashMap<ScriptHash, AddrState>>,
    /// Live unspent keys of tracked addresses; the selective scan's
    /// spend fast-path and the merge-safety invariant live here.
    utxos: Mutex<BTreeSet<TxioKey>>,
    pending_jobs: Mutex<VecDeque<SideScanJob>>,
    is_scanning: AtomicBool,
    merge_flag: AtomicBool,
    merges: Mutex<Vec<MergeReport>>,
    /// Wakes the sync loop when a scan job or merge report is waiting.
    signal: tokio::sync::Notify,
}

/// The tri-state answer of the spend fast-path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UtxoHint {
    Ours,
    NotOurs,
    /// Below the merge cutoff; the store must be consulted.
    Unknown,
}

impl ScrAddrFilter {
    pub fn new(mode: DbMode) -> Self {
        ScrAddrFilter {
            mode,
            addrs: RwLock::new(HashMap::new()),
            utxos: Mutex::new(BTreeSet::new()),
            pending_jobs: Mutex::new(VecDeque::new()),
            is_scanning: AtomicBool::new(false),
            merge_flag: AtomicBool::new(false),
            merges: Mutex::new(Vec::new()),
            signal: tokio::sync::Notify::new(),
        }
    }

    /// Completes when a queued job or merge report needs the sync task.
    pub async fn scan_wakeup(&self) {
        self.signal.notified().await;
    }

    pub fn mode(&self) -> DbMode {
        self.mode
    }

    /// The filter predicate: is this script hash tracked?
    pub fn contains(&self, scr_addr: &ScriptHash) -> bool {
        match self.mode {
            DbMode::Super => true,
            DbMode::Selective => self
                .addrs
                .read()
                .expect("not poisoned")
                .contains_key(scr_addr),
        }
    }

    /// Registers `new_addrs` for `wallet_id`.
    ///
    /// Before the index reaches the chain tip the addresses are inserted
    /// directly and the caller may proceed. Afterwards, a side-scan job is
    /// queued and the caller must wait for the refresh notification. In
    /// `Super` mode every address is already tracked, so registration is
    /// always immediate.
    pub fn register_addresses(
        &self,
        new_addrs: &[ScriptHash],
        wallet_id: &str,
        is_new: bool,
        at_tip: bool,
        store: &Store,
    ) -> Result<Registration, Error> {
        if self.mode == DbMode::Super {
            return Ok(Registration::Immediate);
        }

        if !at_tip {
            let mut addrs = self.addrs.write().expect("not poisoned");
            for sa in new_addrs {
                addrs.entry(sa.clone()).or_insert_with(|| AddrState {
                    last_scanned: 0,
                    wallet_id: wallet_id.to_owned(),
                });
            }
            return Ok(Registration::Immediate);
        }

        let mut job = SideScanJob {
            addrs: Vec::with_capacity(new_addrs.len()),
            wallet_id: wallet_id.to_owned(),
            fresh: is_new,
        };
        for sa in new_addrs {
            let last_scanned = if is_new {
                0
            } else {
                store
                    .ssh_summary(sa)
                    .map_err(|e| ErrorKind::StorageCorrupt.context(e))?
                    .scanned_up_to
            };
            job.addrs.push((sa.clone(), last_scanned));
        }
        self.pending_jobs
            .lock()
            .expect("not poisoned")
            .push_back(job);
        self.signal.notify_one();
        Ok(Registration::Deferred)
    }

    /// Claims the next queued side-scan job, if no scan is running.
    ///
    /// At most one side scan runs per filter at any time; the claim flips
    /// `is_scanning` and [`Self::submit_merge`] hands it back.
    pub fn take_scan_job(&self) -> Option<SideScanJob> {
        let mut pending = self.pending_jobs.lock().expect("not poisoned");
        if pending.is_empty() {
            return None;
        }
        if self
            .is_scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let job = pending.pop_front();
        if job.is_none() {
            self.is_scanning.store(false, Ordering::Release);
        }
        job
    }

    /// Called by a finished side scan: parks the report for the sync task
    /// and releases the scan slot.
    pub fn submit_merge(&self, report: MergeReport) {
        self.merges.lock().expect("not poisoned").push(report);
        self.merge_flag.store(true, Ordering::Release);
        self.is_scanning.store(false, Ordering::Release);
        self.signal.notify_one();
    }

    /// Takes the pending merge reports, if any. Checked by the sync task
    /// between blocks.
    pub fn take_merges(&self) -> Vec<MergeReport> {
        if !self.merge_flag.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        std::mem::take(&mut *self.merges.lock().expect("not poisoned"))
    }

    /// Integrates a merge report's registration state: the address set and
    /// the post-cutoff UTXO keys. (The collected history is written by the
    /// sync task, which owns the store's write side.)
    pub fn apply_merge(&self, report: &MergeReport) {
        let mut addrs = self.addrs.write().expect("not poisoned");
        for (sa, _) in &report.addrs {
            addrs.insert(
                sa.clone(),
                AddrState {
                    last_scanned: report.scanned_to,
                    wallet_id: report.wallet_id.clone(),
                },
            );
        }
        drop(addrs);
        let mut utxos = self.utxos.lock().expect("not poisoned");
        utxos.extend(report.utxos.iter().copied());
    }

    pub fn add_utxo(&self, key: TxioKey) {
        self.utxos.lock().expect("not poisoned").insert(key);
    }

    pub fn remove_utxo(&self, key: &TxioKey) {
        self.utxos.lock().expect("not poisoned").remove(key);
    }

    /// The spend fast-path: does `key` pay one of our addresses?
    pub fn has_utxo(&self, key: &TxioKey, cutoff: u32) -> UtxoHint {
        if self.utxos.lock().expect("not poisoned").contains(key) {
            return UtxoHint::Ours;
        }
        match key.height() {
            Some(height) if height < cutoff => UtxoHint::Unknown,
            _ => UtxoHint::NotOurs,
        }
    }

    /// Snapshot of the current UTXO keys; test and merge-invariant surface.
    pub fn utxo_keys(&self) -> BTreeSet<TxioKey> {
        self.utxos.lock().expect("not poisoned").clone()
    }

    /// All registered addresses.
    pub fn registered(&self) -> Vec<ScriptHash> {
        self.addrs
            .read()
            .expect("not poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Marks every registered address as scanned to `height`.
    pub fn mark_scanned(&self, height: u32) {
        let mut addrs = self.addrs.write().expect("not poisoned");
        for state in addrs.values_mut() {
            state.last_scanned = height;
        }
    }

    /// Writes the SSH watermark for the given addresses only. Side-scan
    /// integration calls this over the merged set; it never touches
    /// histories the scan did not own.
    pub fn set_ssh_last_scanned(
        addrs: &[(ScriptHash, u32)],
        height: u32,
        store: &Store,
    ) -> Result<(), StorageError> {
        let mut writer = store.writer()?;
        for (sa, _) in addrs {
            let mut ssh = writer.ssh_summary(sa)?;
            ssh.initialized = true;
            ssh.scanned_up_to = height;
            writer.put_ssh(sa, &ssh)?;
        }
        writer.commit()
    }
}

#[cfg(test)]
mod tests {
    use crate::types::dbkey::TxKey;

    use super::*;

    fn addr(tag: u8) -> ScriptHash {
        ScriptHash::from_hash160([tag; 20])
    }

    #[test]
    fn supernode_tracks_everything_immediately() {
        let filter = ScrAddrFilter::new(DbMode::Super);
        let store = Store::in_memory();
        assert!(filter.contains(&addr(1)));
        let reg = filter
            .register_addresses(&[addr(1)], "w1", false, true, &store)
            .unwrap();
        assert_eq!(reg, Registration::Immediate);
        assert!(filter.take_scan_job().is_none());
    }

    #[test]
    fn selective_registration_before_tip_is_immediate() {
        let filter = ScrAddrFilter::new(DbMode::Selective);
        let store = Store::in_memory();
        assert!(!filter.contains(&addr(1)));
        let reg = filter
            .register_addresses(&[addr(1)], "w1", false, false, &store)
            .unwrap();
        assert_eq!(reg, Registration::Immediate);
        assert!(filter.contains(&addr(1)));
    }

    #[test]
    fn late_registration_queues_one_scan_at_a_time() {
        let filter = ScrAddrFilter::new(DbMode::Selective);
        let store = Store::in_memory();
        for (tag, wallet) in [(1u8, "w1"), (2, "w2")] {
            let reg = filter
                .register_addresses(&[addr(tag)], wallet, false, true, &store)
                .unwrap();
            assert_eq!(reg, Registration::Deferred);
        }
        assert!(!filter.contains(&addr(1)));

        let job = filter.take_scan_job().expect("job queued");
        assert_eq!(job.wallet_id, "w1");
        // Second job stays queued while the first is running.
        assert!(filter.take_scan_job().is_none());

        filter.submit_merge(MergeReport {
            addrs: job.addrs.clone(),
            wallet_id: job.wallet_id.clone(),
            scanned_to: 10,
            ..MergeReport::default()
        });
        assert!(filter.take_scan_job().is_some());

        for report in filter.take_merges() {
            filter.apply_merge(&report);
        }
        assert!(filter.contains(&addr(1)));
    }

    #[test]
    fn merge_keeps_only_post_cutoff_utxos() {
        let filter = ScrAddrFilter::new(DbMode::Selective);
        let below = TxKey::confirmed(5, 0, 0).with_io(0);
        let above = TxKey::confirmed(50, 0, 0).with_io(0);

        // The side scan itself discards keys at or below the cutoff; the
        // report carries only the rest.
        let mut report = MergeReport {
            cutoff: 10,
            scanned_to: 60,
            ..MergeReport::default()
        };
        report.utxos.insert(above);
        filter.apply_merge(&report);

        let utxos = filter.utxo_keys();
        assert!(utxos.contains(&above));
        assert!(!utxos.contains(&below));
        assert!(utxos.iter().all(|key| key.height().unwrap_or(u32::MAX) > 10));
    }

    #[test]
    fn utxo_hint_is_tristate() {
        let filter = ScrAddrFilter::new(DbMode::Selective);
        let key = TxKey::confirmed(20, 0, 0).with_io(0);
        assert_eq!(filter.has_utxo(&key, 0), UtxoHint::NotOurs);
        filter.add_utxo(key);
        assert_eq!(filter.has_utxo(&key, 0), UtxoHint::Ours);

        let old = TxKey::confirmed(3, 0, 0).with_io(0);
        assert_eq!(filter.has_utxo(&old, 10), UtxoHint::Unknown);
    }
}
