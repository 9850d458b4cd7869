//! The chain-sync engine.
//!
//! A single task advances the confirmed index: it pulls parsed blocks from
//! the [`BlockSource`], detects reorgs by parent-hash mismatch, applies
//! blocks to the store under one write transaction each, drives the
//! zero-conf container's purge/parse cycle, integrates side-scan merges at
//! safe points between blocks, and broadcasts [`ChainEvent`]s for the
//! clients-maintenance fan-out. It is the sole writer of the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::DbMode;
use crate::error::{Error, ErrorKind};
use crate::types::dbkey::{TxKey, TxioKey, height_to_hgtx};
use crate::types::{Block, ScriptHash, TxIoPair};
use crate::wire::{ProgressData, ProgressPhase};

use super::TaskHandle;
use super::chain::{BlockSource, SharedHeaders};
use super::filter::{MERGE_RESCAN_WINDOW, MergeReport, ScrAddrFilter, SideScanJob};
use super::storage::{Store, StoreWriter, StoredTxOut, TxRecord};
use super::zeroconf::{TxioByAddr, ZeroConfContainer};

/// Depth of the event broadcast channel.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Chain-wide state shared with the views.
#[derive(Debug)]
pub struct ChainStatus {
    top: AtomicU32,
    has_blocks: AtomicBool,
    caught_up_tx: watch::Sender<bool>,
}

impl Default for ChainStatus {
    fn default() -> Self {
        ChainStatus {
            top: AtomicU32::new(0),
            has_blocks: AtomicBool::new(false),
            caught_up_tx: watch::channel(false).0,
        }
    }
}

impl ChainStatus {
    pub fn new() -> Self {
        ChainStatus::default()
    }

    /// Height of the last durably absorbed block, or `None` before any.
    pub fn top_height(&self) -> Option<u32> {
        self.has_blocks
            .load(Ordering::Acquire)
            .then(|| self.top.load(Ordering::Acquire))
    }

    fn set_top(&self, height: u32) {
        self.top.store(height, Ordering::Release);
        self.has_blocks.store(true, Ordering::Release);
    }

    /// Whether the initial catch-up to the source tip has completed.
    pub fn is_caught_up(&self) -> bool {
        *self.caught_up_tx.borrow()
    }

    pub fn caught_up(&self) -> watch::Receiver<bool> {
        self.caught_up_tx.subscribe()
    }

    fn mark_caught_up(&self) {
        self.caught_up_tx.send_replace(true);
    }
}

/// Events broadcast by the sync task and fanned out to every view.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    NewBlock {
        height: u32,
        /// Set when this tip replaced blocks above the fork height.
        reorged_from: Option<u32>,
    },
    /// Late-registered addresses went live for these wallets.
    Refresh {
        wallet_ids: Vec<String>,
    },
    ZcReceived {
        txio: Arc<TxioByAddr>,
    },
    ZcPurged {
        invalidated: Arc<HashMap<ScriptHash, Vec<TxioKey>>>,
    },
    Progress(ProgressData),
}

/// Handles shared by the sync task and its consumers.
#[derive(Clone)]
pub struct SyncHandles {
    pub store: Store,
    pub source: Arc<dyn BlockSource>,
    pub filter: Arc<ScrAddrFilter>,
    pub zc: Arc<ZeroConfContainer>,
    pub headers: SharedHeaders,
    pub status: Arc<ChainStatus>,
    pub events: broadcast::Sender<ChainEvent>,
}

#[derive(Debug)]
pub struct ChainSync {}

impl ChainSync {
    /// Spawns the sync task. `shutdown` flipping to `true` quiesces it.
    pub fn spawn(
        handles: SyncHandles,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<TaskHandle, Error> {
        // Rebuild the in-memory header chain from the store.
        {
            let stored = handles
                .store
                .headers()
                .map_err(|e| ErrorKind::Init.context(e))?;
            let mut headers = handles.headers.write().expect("not poisoned");
            for (height, header) in stored {
                headers.push(height, header);
            }
            if let Some((height, _)) = headers.tip() {
                handles.status.set_top(height);
            }
        }

        Ok(crate::spawn!("chain-sync", async move {
            let result = run(&handles, &mut shutdown).await;
            if let Err(e) = &result {
                warn!("chain sync exited with error: {e}");
            }
            result
        }))
    }
}

async fn run(handles: &SyncHandles, shutdown: &mut watch::Receiver<bool>) -> Result<(), Error> {
    info!("Starting chain sync");
    catch_up(handles, shutdown).await?;
    handles.status.mark_caught_up();
    info!(
        top = ?handles.status.top_height(),
        "Initial scan complete; entering steady state",
    );

    loop {
        // Safe point between blocks: integrate pending merges and start a
        // queued side scan.
        integrate_merges(handles).await?;
        maybe_start_side_scan(handles);

        let next_height = handles.status.top_height().map_or(0, |top| top + 1);
        tokio::select! {
            block = handles.source.next_block(next_height) => {
                let block = block.map_err(|e| ErrorKind::Fatal.context(e))?;
                absorb_block(handles, next_height, block).await?;
            }
            _ = handles.zc.staged_wakeup() => {
                parse_zc(handles)?;
            }
            // A registration queued a side scan, or one just finished;
            // loop back to the safe point.
            _ = handles.filter.scan_wakeup() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Chain sync terminating");
                    return Ok(());
                }
            }
        }
    }
}

/// Scans from the stored watermark to the source tip, emitting progress.
async fn catch_up(
    handles: &SyncHandles,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    let tip = handles
        .source
        .tip_height()
        .await
        .map_err(|e| ErrorKind::Fatal.context(e))?;
    let Some(tip) = tip else {
        return Ok(());
    };

    let mut next = handles.status.top_height().map_or(0, |top| top + 1);
    let total = (tip + 1).saturating_sub(next).max(1);
    while next <= tip {
        if *shutdown.borrow() {
            return Ok(());
        }
        let block = handles
            .source
            .read_block(next)
            .await
            .map_err(|e| ErrorKind::Fatal.context(e))?;
        let Some(block) = block else {
            // The source shrank beneath us; the steady state will resolve
            // the reorg.
            break;
        };
        absorb_block(handles, next, block).await?;
        if next % 1000 == 0 {
            let scanned = total - (tip - next);
            let _ = handles.events.send(ChainEvent::Progress(ProgressData {
                phase: ProgressPhase::Scan,
                progress: f64::from(scanned) / f64::from(total),
                time: 0,
                numeric: next,
            }));
        }
        next += 1;
    }
    Ok(())
}

/// Integrates one block at `height`: reorg check, store apply, zero-conf
/// purge/parse, event broadcast.
async fn absorb_block(handles: &SyncHandles, height: u32, block: Block) -> Result<(), Error> {
    let expected_parent = {
        let headers = handles.headers.read().expect("not poisoned");
        headers.tip().map(|(_, header)| header.hash)
    };
    if let Some(parent) = expected_parent {
        if block.header.prev_hash != parent {
            return handle_reorg(handles, height, block).await;
        }
    }

    apply_block(handles, height, &block)?;
    finish_block(handles, height, None)
}

/// Post-apply bookkeeping shared by the normal and reorg paths.
fn finish_block(
    handles: &SyncHandles,
    height: u32,
    reorged_from: Option<u32>,
) -> Result<(), Error> {
    // Mempool entries consumed or conflicted by the block drop out.
    let is_mine = mine_filter(handles);
    let invalidated = handles
        .zc
        .purge(&is_mine, &handles.store)
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    if !invalidated.is_empty() {
        let _ = handles.events.send(ChainEvent::ZcPurged {
            invalidated: Arc::new(invalidated),
        });
    }

    parse_zc(handles)?;

    let _ = handles.events.send(ChainEvent::NewBlock {
        height,
        reorged_from,
    });
    Ok(())
}

fn parse_zc(handles: &SyncHandles) -> Result<(), Error> {
    let is_mine = mine_filter(handles);
    let zc_is_ours = handles
        .zc
        .parse_new_zc(&is_mine, &handles.store)
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    if zc_is_ours {
        let txio = handles.zc.take_new_txio();
        let _ = handles.events.send(ChainEvent::ZcReceived {
            txio: Arc::new(txio),
        });
    }
    Ok(())
}

fn mine_filter(handles: &SyncHandles) -> impl Fn(&ScriptHash) -> bool + '_ {
    let filter = handles.filter.clone();
    move |sa: &ScriptHash| filter.contains(sa)
}

/// Walks back to the fork point, unwinds the store, and replays the
/// replacement branch.
async fn handle_reorg(handles: &SyncHandles, height: u32, block: Block) -> Result<(), Error> {
    let mut branch = vec![block];
    // Read down the new branch until its parent is on our chain.
    loop {
        let lowest = &branch.last().expect("non-empty").header;
        let known = {
            let headers = handles.headers.read().expect("not poisoned");
            headers.height_of(&lowest.prev_hash)
        };
        match known {
            Some(_) => break,
            None => {
                let parent_height = height
                    .checked_sub(branch.len() as u32)
                    .ok_or_else(|| {
                        ErrorKind::Fatal.context("reorg reaches below genesis; wrong network?")
                    })?;
                let parent = handles
                    .source
                    .read_block(parent_height)
                    .await
                    .map_err(|e| ErrorKind::Fatal.context(e))?
                    .ok_or_else(|| {
                        ErrorKind::Fatal.context("reorg branch vanished under the scanner")
                    })?;
                branch.push(parent);
            }
        }
    }

    let fork_height = {
        let headers = handles.headers.read().expect("not poisoned");
        headers
            .height_of(&branch.last().expect("non-empty").header.prev_hash)
            .expect("checked above")
    };
    info!(fork_height, new_tip = height, "Reorg detected; unwinding");

    unwind_to(handles, fork_height)?;

    // Replay the replacement branch, lowest first.
    branch.reverse();
    let mut replay_height = fork_height + 1;
    for block in branch {
        apply_block(handles, replay_height, &block)?;
        replay_height += 1;
    }
    finish_block(handles, height, Some(fork_height))
}

/// Removes every trace of the blocks above `fork_height`.
fn unwind_to(handles: &SyncHandles, fork_height: u32) -> Result<(), Error> {
    let top = handles
        .status
        .top_height()
        .expect("reorg implies a non-empty chain");
    let mut writer = handles
        .store
        .writer()
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;

    // Spends recorded above the fork are reversed first: the spent output
    // (wherever it lives) becomes unspent again.
    for (out_key, in_key) in writer
        .spentness()
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?
    {
        let spent_above = in_key.height().is_some_and(|h| h > fork_height);
        if !spent_above {
            continue;
        }
        writer
            .delete_spentness(&out_key)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        let stxo = writer
            .stored_txout(&out_key)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        if let Some(stxo) = stxo {
            if handles.filter.contains(&stxo.scr_addr) {
                unspend_txio(&mut writer, &stxo.scr_addr, &out_key, stxo.value)?;
                handles.filter.add_utxo(out_key);
            }
        }
    }

    // Then the blocks themselves, top down.
    for height in ((fork_height + 1)..=top).rev() {
        unwind_block(handles, &mut writer, height)?;
    }

    let top_hash = {
        let headers = handles.headers.read().expect("not poisoned");
        headers
            .header_at(fork_height)
            .map(|header| header.hash)
            .unwrap_or_default()
    };
    let mut sdbi = writer
        .sdbi()
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    sdbi.top_height = fork_height;
    sdbi.top_hash = top_hash;
    writer
        .put_sdbi(&sdbi)
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    writer
        .commit()
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;

    handles
        .headers
        .write()
        .expect("not poisoned")
        .unwind_to(fork_height);
    handles.status.set_top(fork_height);
    Ok(())
}

/// Marks a stored txio unspent again and restores the SSH balance.
fn unspend_txio(
    writer: &mut StoreWriter<'_>,
    scr_addr: &ScriptHash,
    out_key: &TxioKey,
    value: u64,
) -> Result<(), Error> {
    let out_height = out_key.height().expect("confirmed output");
    let hgtx = height_to_hgtx(out_height, 0);
    let mut sub = writer
        .sub_ssh(scr_addr, &hgtx)
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?
        .unwrap_or_default();
    if let Some(txio) = sub.txios.get_mut(out_key) {
        if txio.is_spent() {
            txio.clear_input();
            let mut ssh = writer
                .ssh_summary(scr_addr)
                .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
            ssh.balance += value;
            writer
                .put_ssh(scr_addr, &ssh)
                .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
        }
    }
    writer
        .put_sub_ssh(scr_addr, &hgtx, &sub)
        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    Ok(())
}

/// Deletes one unwound block's records.
fn unwind_block(
    handles: &SyncHandles,
    writer: &mut StoreWriter<'_>,
    height: u32,
) -> Result<(), Error> {
    let corrupt = |e| ErrorKind::StorageCorrupt.context(e);
    let header = handles
        .headers
        .read()
        .expect("not poisoned")
        .header_at(height)
        .copied();
    if let Some(header) = header {
        writer.delete_header(height, &header.hash).map_err(corrupt)?;
    }

    // Every transaction of the block is reachable through its BLKDATA
    // records under the height prefix.
    let hgtx = height_to_hgtx(height, 0);
    let records = writer.tx_records_at(&hgtx).map_err(corrupt)?;
    for (tx_key, record) in records {
        writer.delete_tx_hint(&record.hash).map_err(corrupt)?;
        writer.delete_tx_record(&tx_key).map_err(corrupt)?;
        for out_index in 0..record.n_outputs {
            let out_key = tx_key.with_io(out_index);
            let Some(stxo) = writer.stored_txout(&out_key).map_err(corrupt)? else {
                continue;
            };
            writer.delete_stored_txout(&out_key).map_err(corrupt)?;
            writer.delete_spentness(&out_key).map_err(corrupt)?;
            if !handles.filter.contains(&stxo.scr_addr) {
                continue;
            }
            handles.filter.remove_utxo(&out_key);
            let mut sub = writer
                .sub_ssh(&stxo.scr_addr, &hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            if let Some(txio) = sub.txios.remove(&out_key) {
                let mut ssh = writer.ssh_summary(&stxo.scr_addr).map_err(corrupt)?;
                ssh.total_txio_count = ssh.total_txio_count.saturating_sub(1);
                if !txio.is_spent() {
                    ssh.balance = ssh.balance.saturating_sub(txio.value());
                }
                ssh.scanned_up_to = ssh.scanned_up_to.min(height.saturating_sub(1));
                writer.put_ssh(&stxo.scr_addr, &ssh).map_err(corrupt)?;
            }
            writer
                .put_sub_ssh(&stxo.scr_addr, &hgtx, &sub)
                .map_err(corrupt)?;
        }
    }
    Ok(())
}

/// Applies one block under a single write transaction.
fn apply_block(handles: &SyncHandles, height: u32, block: &Block) -> Result<(), Error> {
    let corrupt = |e| ErrorKind::StorageCorrupt.context(e);
    let mut writer = handles.store.writer().map_err(corrupt)?;
    let hgtx = height_to_hgtx(height, 0);
    let supernode = handles.filter.mode() == DbMode::Super;

    writer.put_header(height, &block.header).map_err(corrupt)?;

    for (tx_index, tx) in block.txs.iter().enumerate() {
        let tx_key = TxKey::confirmed(height, 0, tx_index as u16);
        writer.put_tx_hint(&tx.hash, &tx_key).map_err(corrupt)?;
        writer
            .put_tx_record(
                &tx_key,
                &TxRecord {
                    hash: tx.hash,
                    n_outputs: tx.outputs.len() as u16,
                },
            )
            .map_err(corrupt)?;

        let coinbase = tx.is_coinbase();
        for (out_index, output) in tx.outputs.iter().enumerate() {
            let out_key = tx_key.with_io(out_index as u16);
            let scr_addr = ScriptHash::from_script(&output.script_pubkey);
            let tracked = supernode || handles.filter.contains(&scr_addr);
            if !tracked {
                continue;
            }
            writer
                .put_stored_txout(
                    &out_key,
                    &StoredTxOut {
                        scr_addr: scr_addr.clone(),
                        value: output.value,
                        from_coinbase: coinbase,
                    },
                )
                .map_err(corrupt)?;

            let mut sub = writer
                .sub_ssh(&scr_addr, &hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            // Insert-by-key keeps a re-applied block a no-op.
            if !sub.txios.contains_key(&out_key) {
                let txio = TxIoPair::new_output(out_key, tx.hash, output.value)
                    .with_coinbase(coinbase);
                sub.txios.insert(out_key, txio);
                writer.put_sub_ssh(&scr_addr, &hgtx, &sub).map_err(corrupt)?;

                let mut ssh = writer.ssh_summary(&scr_addr).map_err(corrupt)?;
                ssh.initialized = true;
                ssh.total_txio_count += 1;
                ssh.balance += output.value;
                ssh.scanned_up_to = ssh.scanned_up_to.max(height);
                writer.put_ssh(&scr_addr, &ssh).map_err(corrupt)?;
                handles.filter.add_utxo(out_key);
            }
        }

        if coinbase {
            continue;
        }
        for (in_index, input) in tx.inputs.iter().enumerate() {
            let prevout = input.prevout;
            let Some(out_tx_key) = writer.tx_key_for_hash(&prevout.txid).map_err(corrupt)? else {
                continue;
            };
            let out_key = out_tx_key.with_io(prevout.vout as u16);
            let in_key = tx_key.with_io(in_index as u16);

            // Recorded for every resolvable outpoint, tracked or not: the
            // mempool purge uses this as its conflict oracle.
            writer.put_spentness(&out_key, &in_key).map_err(corrupt)?;

            let Some(stxo) = writer.stored_txout(&out_key).map_err(corrupt)? else {
                continue;
            };
            if !handles.filter.contains(&stxo.scr_addr) {
                continue;
            }
            let out_height = out_key.height().expect("confirmed output");
            let out_hgtx = height_to_hgtx(out_height, 0);
            let mut sub = writer
                .sub_ssh(&stxo.scr_addr, &out_hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            if let Some(txio) = sub.txios.get_mut(&out_key) {
                if !txio.is_spent() {
                    txio.set_input(in_key, tx.hash);
                    writer
                        .put_sub_ssh(&stxo.scr_addr, &out_hgtx, &sub)
                        .map_err(corrupt)?;
                    let mut ssh = writer.ssh_summary(&stxo.scr_addr).map_err(corrupt)?;
                    ssh.balance = ssh.balance.saturating_sub(stxo.value);
                    writer.put_ssh(&stxo.scr_addr, &ssh).map_err(corrupt)?;
                    handles.filter.remove_utxo(&out_key);
                }
            }
        }
    }

    let mut sdbi = writer.sdbi().map_err(corrupt)?;
    sdbi.top_height = height;
    sdbi.top_hash = block.header.hash;
    writer.put_sdbi(&sdbi).map_err(corrupt)?;
    writer.commit().map_err(corrupt)?;

    handles
        .headers
        .write()
        .expect("not poisoned")
        .push(height, block.header);
    handles.status.set_top(height);
    handles.filter.mark_scanned(height);
    debug!(height, "absorbed block");
    Ok(())
}

/// Applies the TxIO pairs a side scan collected. The main-chain apply path
/// may have landed some of them already; insert-by-key makes that a no-op.
fn write_merge_report(handles: &SyncHandles, report: &MergeReport) -> Result<(), Error> {
    let corrupt = |e| ErrorKind::StorageCorrupt.context(e);
    let mut writer = handles.store.writer().map_err(corrupt)?;
    for (scr_addr, txios) in &report.txios {
        for txio in txios {
            let Some(out_height) = txio.out_key().height() else {
                continue;
            };
            let hgtx = height_to_hgtx(out_height, 0);
            let mut sub = writer
                .sub_ssh(scr_addr, &hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            if sub.txios.contains_key(&txio.out_key()) {
                continue;
            }
            sub.txios.insert(txio.out_key(), txio.clone());
            writer.put_sub_ssh(scr_addr, &hgtx, &sub).map_err(corrupt)?;

            let mut ssh = writer.ssh_summary(scr_addr).map_err(corrupt)?;
            ssh.initialized = true;
            ssh.total_txio_count += 1;
            if !txio.is_spent() {
                ssh.balance += txio.value();
            }
            writer.put_ssh(scr_addr, &ssh).map_err(corrupt)?;
        }
    }
    writer.commit().map_err(corrupt)?;
    Ok(())
}

/// Integrates finished side scans: write their history, accept the
/// addresses live, rescan the trailing reorg window, stamp watermarks.
async fn integrate_merges(handles: &SyncHandles) -> Result<(), Error> {
    let reports = handles.filter.take_merges();
    if reports.is_empty() {
        return Ok(());
    }

    let top = handles.status.top_height().unwrap_or(0);
    let mut wallet_ids = Vec::new();
    for report in &reports {
        write_merge_report(handles, report)?;
        handles.filter.apply_merge(report);
        wallet_ids.push(report.wallet_id.clone());
    }

    // Rescan the trailing window over the now-live addresses to absorb
    // blocks and reorgs that landed while the scan ran. Applies are
    // keyed, so overlap with the main scan is harmless.
    let rescan_from = top.saturating_sub(MERGE_RESCAN_WINDOW);
    for height in rescan_from..=top {
        let block = handles
            .source
            .read_block(height)
            .await
            .map_err(|e| ErrorKind::Fatal.context(e))?;
        if let Some(block) = block {
            reapply_for_merge(handles, height, &block)?;
        }
    }

    for report in &reports {
        ScrAddrFilter::set_ssh_last_scanned(&report.addrs, top, &handles.store)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
    }

    wallet_ids.sort();
    wallet_ids.dedup();
    info!(?wallet_ids, "side-scan merge integrated");
    let _ = handles.events.send(ChainEvent::Refresh { wallet_ids });
    Ok(())
}

/// Re-applies one already-indexed block; used by the merge rescan window.
fn reapply_for_merge(handles: &SyncHandles, height: u32, block: &Block) -> Result<(), Error> {
    // The header and global records are already present; the keyed apply
    // only adds what the merged addresses were missing.
    let already_tip = {
        let headers = handles.headers.read().expect("not poisoned");
        headers.height_of(&block.header.hash).is_some()
    };
    if !already_tip {
        // The window crossed a reorg; the steady-state loop handles it.
        return Ok(());
    }
    apply_block_records(handles, height, block)
}

/// The SSH/BLKDATA portion of [`apply_block`], without header/SDBI motion.
fn apply_block_records(handles: &SyncHandles, height: u32, block: &Block) -> Result<(), Error> {
    let corrupt = |e| ErrorKind::StorageCorrupt.context(e);
    let mut writer = handles.store.writer().map_err(corrupt)?;
    let hgtx = height_to_hgtx(height, 0);

    for (tx_index, tx) in block.txs.iter().enumerate() {
        let tx_key = TxKey::confirmed(height, 0, tx_index as u16);
        let coinbase = tx.is_coinbase();
        for (out_index, output) in tx.outputs.iter().enumerate() {
            let out_key = tx_key.with_io(out_index as u16);
            let scr_addr = ScriptHash::from_script(&output.script_pubkey);
            if !handles.filter.contains(&scr_addr) {
                continue;
            }
            writer
                .put_stored_txout(
                    &out_key,
                    &StoredTxOut {
                        scr_addr: scr_addr.clone(),
                        value: output.value,
                        from_coinbase: coinbase,
                    },
                )
                .map_err(corrupt)?;
            let mut sub = writer
                .sub_ssh(&scr_addr, &hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            if !sub.txios.contains_key(&out_key) {
                let txio = TxIoPair::new_output(out_key, tx.hash, output.value)
                    .with_coinbase(coinbase);
                sub.txios.insert(out_key, txio);
                writer.put_sub_ssh(&scr_addr, &hgtx, &sub).map_err(corrupt)?;
                let mut ssh = writer.ssh_summary(&scr_addr).map_err(corrupt)?;
                ssh.initialized = true;
                ssh.total_txio_count += 1;
                ssh.balance += output.value;
                writer.put_ssh(&scr_addr, &ssh).map_err(corrupt)?;
                handles.filter.add_utxo(out_key);
            }
        }

        if coinbase {
            continue;
        }
        for (in_index, input) in tx.inputs.iter().enumerate() {
            let prevout = input.prevout;
            let Some(out_tx_key) = writer.tx_key_for_hash(&prevout.txid).map_err(corrupt)? else {
                continue;
            };
            let out_key = out_tx_key.with_io(prevout.vout as u16);
            let Some(stxo) = writer.stored_txout(&out_key).map_err(corrupt)? else {
                continue;
            };
            if !handles.filter.contains(&stxo.scr_addr) {
                continue;
            }
            let in_key = tx_key.with_io(in_index as u16);
            writer.put_spentness(&out_key, &in_key).map_err(corrupt)?;
            let out_height = out_key.height().expect("confirmed output");
            let out_hgtx = height_to_hgtx(out_height, 0);
            let mut sub = writer
                .sub_ssh(&stxo.scr_addr, &out_hgtx)
                .map_err(corrupt)?
                .unwrap_or_default();
            if let Some(txio) = sub.txios.get_mut(&out_key) {
                if !txio.is_spent() {
                    txio.set_input(in_key, tx.hash);
                    writer
                        .put_sub_ssh(&stxo.scr_addr, &out_hgtx, &sub)
                        .map_err(corrupt)?;
                    let mut ssh = writer.ssh_summary(&stxo.scr_addr).map_err(corrupt)?;
                    ssh.balance = ssh.balance.saturating_sub(stxo.value);
                    writer.put_ssh(&stxo.scr_addr, &ssh).map_err(corrupt)?;
                    handles.filter.remove_utxo(&out_key);
                }
            }
        }
    }
    writer.commit().map_err(corrupt)?;
    Ok(())
}

/// Starts the next queued side scan, if the slot is free.
fn maybe_start_side_scan(handles: &SyncHandles) {
    let Some(job) = handles.filter.take_scan_job() else {
        return;
    };
    let handles = handles.clone();
    crate::spawn!("side-scan", async move {
        if let Err(e) = side_scan(&handles, job).await {
            warn!("side scan failed: {e}");
        }
    });
}

/// Background rescan for late-registered addresses. Reads only; all its
/// results return through the merge report.
async fn side_scan(handles: &SyncHandles, job: SideScanJob) -> Result<(), Error> {
    let top = handles.status.top_height().unwrap_or(0);
    let cutoff = job.cutoff();
    let start = job.scan_from();
    let addr_set: std::collections::HashSet<&ScriptHash> =
        job.addrs.iter().map(|(sa, _)| sa).collect();

    let mut report = MergeReport {
        addrs: job.addrs.clone(),
        wallet_id: job.wallet_id.clone(),
        cutoff,
        scanned_to: top,
        ..MergeReport::default()
    };

    if !job.fresh {
        // Outpoints of collected outputs, for resolving spends in-scan.
        let mut collected: HashMap<(crate::types::TxHash, u32), TxioKey> = HashMap::new();
        for height in start..=top {
            let block = handles
                .source
                .read_block(height)
                .await
                .map_err(|e| ErrorKind::Fatal.context(e))?;
            let Some(block) = block else { break };
            scan_block_for_addrs(&block, height, &addr_set, &mut collected, &mut report);
            if height % 1000 == 0 {
                let _ = handles.events.send(ChainEvent::Progress(ProgressData {
                    phase: ProgressPhase::SideScan,
                    progress: f64::from(height - start + 1)
                        / f64::from(top.saturating_sub(start) + 1),
                    time: 0,
                    numeric: height,
                }));
            }
        }
    }

    handles.filter.submit_merge(report);
    Ok(())
}

/// One block of the side sweep: collect outputs paying the subset and
/// spends of already-collected outputs.
fn scan_block_for_addrs(
    block: &Block,
    height: u32,
    addr_set: &std::collections::HashSet<&ScriptHash>,
    collected: &mut HashMap<(crate::types::TxHash, u32), TxioKey>,
    report: &mut MergeReport,
) {
    let cutoff = report.cutoff;
    for (tx_index, tx) in block.txs.iter().enumerate() {
        let tx_key = TxKey::confirmed(height, 0, tx_index as u16);
        let coinbase = tx.is_coinbase();

        if !coinbase {
            for (in_index, input) in tx.inputs.iter().enumerate() {
                let prevout = input.prevout;
                let Some(&out_key) = collected.get(&(prevout.txid, prevout.vout)) else {
                    continue;
                };
                for txios in report.txios.values_mut() {
                    if let Some(txio) = txios.iter_mut().find(|txio| txio.out_key() == out_key) {
                        txio.set_input(tx_key.with_io(in_index as u16), tx.hash);
                    }
                }
                report.utxos.remove(&out_key);
            }
        }

        for (out_index, output) in tx.outputs.iter().enumerate() {
            let scr_addr = ScriptHash::from_script(&output.script_pubkey);
            if !addr_set.contains(&scr_addr) {
                continue;
            }
            let out_key = tx_key.with_io(out_index as u16);
            let txio =
                TxIoPair::new_output(out_key, tx.hash, output.value).with_coinbase(coinbase);
            collected.insert((tx.hash, out_index as u32), out_key);
            report.txios.entry(scr_addr).or_default().push(txio);
            // UTXOs at or below the cutoff are already in the main index.
            if height > cutoff {
                report.utxos.insert(out_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use crate::config::DbMode;

    use super::super::chain::{HeaderChain, MemorySource};
    use super::super::testing::{base_chain, fixture_addr};
    use super::*;

    fn handles_for(mode: DbMode, blocks: Vec<Block>) -> SyncHandles {
        let source = Arc::new(MemorySource::new());
        for block in blocks {
            source.push_block(block);
        }
        SyncHandles {
            store: Store::in_memory(),
            source,
            filter: Arc::new(ScrAddrFilter::new(mode)),
            zc: Arc::new(ZeroConfContainer::default()),
            headers: Arc::new(std::sync::RwLock::new(HeaderChain::new())),
            status: Arc::new(ChainStatus::new()),
            events: broadcast::channel(EVENT_CHANNEL_DEPTH).0,
        }
    }

    async fn absorb_all(handles: &SyncHandles) {
        let mut height = 0;
        while let Some(block) = handles.source.read_block(height).await.unwrap() {
            absorb_block(handles, height, block).await.unwrap();
            height += 1;
        }
    }

    #[tokio::test]
    async fn scan_indexes_registered_addresses() {
        let handles = handles_for(DbMode::Selective, base_chain());
        let a1 = fixture_addr(0xA1);
        handles
            .filter
            .register_addresses(&[a1.clone()], "w1", false, false, &handles.store)
            .unwrap();
        absorb_all(&handles).await;

        let ssh = handles.store.ssh_summary(&a1).unwrap();
        assert!(ssh.is_initialized());
        assert_eq!(ssh.balance, 50_0000_0000);
        assert_eq!(ssh.total_txio_count, 1);
        assert_eq!(handles.status.top_height(), Some(2));
        // The untracked miner address was never materialized.
        let miner = fixture_addr(0x6D);
        assert!(!handles.store.ssh_summary(&miner).unwrap().is_initialized());
    }

    #[tokio::test]
    async fn supernode_indexes_everything() {
        let handles = handles_for(DbMode::Super, base_chain());
        absorb_all(&handles).await;
        let miner = fixture_addr(0x6D);
        let ssh = handles.store.ssh_summary(&miner).unwrap();
        // Three coinbases minus the two spent funding payments.
        assert_eq!(ssh.total_txio_count, 4);
        assert_eq!(ssh.balance, 75_0000_0000);
    }

    #[tokio::test]
    async fn reapplying_block_records_is_idempotent() {
        let handles = handles_for(DbMode::Selective, base_chain());
        let a1 = fixture_addr(0xA1);
        handles
            .filter
            .register_addresses(&[a1.clone()], "w1", false, false, &handles.store)
            .unwrap();
        absorb_all(&handles).await;

        let before_summary = handles.store.ssh_summary(&a1).unwrap();
        let before_hist = handles.store.ssh_history(&a1, 0, u32::MAX).unwrap();

        let block1 = handles.source.read_block(1).await.unwrap().unwrap();
        apply_block_records(&handles, 1, &block1).unwrap();

        assert_eq!(handles.store.ssh_summary(&a1).unwrap(), before_summary);
        assert_eq!(handles.store.ssh_history(&a1, 0, u32::MAX).unwrap(), before_hist);
    }

    #[tokio::test]
    async fn unwind_reverses_balances_and_spentness() {
        let handles = handles_for(DbMode::Super, base_chain());
        absorb_all(&handles).await;
        let miner = fixture_addr(0x6D);

        // Dropping blocks 1 and 2 restores the block-0 coinbase and
        // removes the later history.
        unwind_to(&handles, 0).unwrap();
        assert_eq!(handles.status.top_height(), Some(0));
        let ssh = handles.store.ssh_summary(&miner).unwrap();
        assert_eq!(ssh.total_txio_count, 1);
        assert_eq!(ssh.balance, 50_0000_0000);
        let hist = handles.store.ssh_history(&miner, 0, u32::MAX).unwrap();
        assert_eq!(hist.len(), 1);
        assert!(hist.values().all(|txio| !txio.is_spent()));
    }

    #[tokio::test]
    async fn side_scan_merge_goes_live_with_watermarks() {
        let handles = handles_for(DbMode::Selective, base_chain());
        absorb_all(&handles).await;
        handles.status.mark_caught_up();

        let a3 = fixture_addr(0xA3);
        let registration = handles
            .filter
            .register_addresses(&[a3.clone()], "w2", false, true, &handles.store)
            .unwrap();
        assert_eq!(registration, crate::components::filter::Registration::Deferred);

        let job = handles.filter.take_scan_job().expect("queued");
        side_scan(&handles, job).await.unwrap();
        let mut events = handles.events.subscribe();
        integrate_merges(&handles).await.unwrap();

        assert!(handles.filter.contains(&a3));
        let ssh = handles.store.ssh_summary(&a3).unwrap();
        assert_eq!(ssh.balance, 25_0000_0000);
        assert_eq!(ssh.scanned_up_to, 2);

        // The merge-safety invariant: no UTXO keys at or below the cutoff.
        let cutoff = 0;
        assert!(
            handles
                .filter
                .utxo_keys()
                .iter()
                .all(|key| key.height().unwrap_or(u32::MAX) > cutoff)
        );

        match events.try_recv().unwrap() {
            ChainEvent::Refresh { wallet_ids } => assert_eq!(wallet_ids, ["w2"]),
            other => panic!("expected refresh, got {other:?}"),
        }
    }
}
