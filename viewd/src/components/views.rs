//! The per-client view object (BDV) and its command surface.
//!
//! A `Bdv` is one client session: registered wallets and lockboxes, ledger
//! delegates for paged history, a notification queue drained by a
//! dedicated maintenance task, and the command dispatch consumed by the
//! framing transports through the clients registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info};

use crate::error::{Error, ErrorKind};
use crate::types::dbkey::TxKey;
use crate::types::ledger::ZC_BLOCK_NUM;
use crate::types::{LedgerEntry, ScriptHash, TxHash};
use crate::wire::{Argument, Arguments, Writer};

use super::chain::{BlockSource, SharedHeaders, TxCursor};
use super::filter::{Registration, ScrAddrFilter};
use super::storage::Store;
use super::sync::ChainStatus;
use super::zeroconf::ZeroConfContainer;

pub mod notify;
pub mod pages;
pub mod wallet;

use self::notify::{BdvAction, Callback, CallbackEvent};
use self::pages::HistoryPages;
use self::wallet::WalletView;

/// Shared collaborators injected into every view.
#[derive(Clone)]
pub struct ViewContext {
    pub store: Store,
    pub source: Arc<dyn BlockSource>,
    pub headers: SharedHeaders,
    pub filter: Arc<ScrAddrFilter>,
    pub zc: Arc<ZeroConfContainer>,
    pub status: Arc<ChainStatus>,
    pub txn_per_page: u32,
}

/// What a ledger delegate pages over.
#[derive(Clone, Debug)]
enum DelegateScope {
    Wallets,
    Lockboxes,
    ScrAddr { wallet_id: String, scr_addr: ScriptHash },
}

struct Delegate {
    scope: DelegateScope,
    pages: HistoryPages,
    /// Top height the page table was built against.
    built_for: Option<u32>,
}

#[derive(Default)]
struct BdvState {
    wallets: BTreeMap<String, WalletView>,
    lockboxes: BTreeMap<String, WalletView>,
    delegates: HashMap<String, Delegate>,
    delegate_counter: u32,
}

impl BdvState {
    fn wallet_mut(&mut self, id: &str) -> Result<&mut WalletView, Error> {
        self.wallets
            .get_mut(id)
            .or_else(|| self.lockboxes.get_mut(id))
            .ok_or_else(|| ErrorKind::UnknownId.context(format!("wallet {id}")))
    }

    fn all_wallets_mut(&mut self) -> impl Iterator<Item = &mut WalletView> {
        self.wallets
            .values_mut()
            .chain(self.lockboxes.values_mut())
    }
}

/// One client session.
pub struct Bdv {
    id: String,
    ctx: ViewContext,
    state: Mutex<BdvState>,
    queue: mpsc::Sender<BdvAction>,
    callback: Arc<dyn Callback>,
    ready_tx: watch::Sender<bool>,
    last_activity: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

impl Bdv {
    /// Builds a view; the caller spawns [`maintenance`] with the returned
    /// receiver.
    pub fn new(
        id: String,
        ctx: ViewContext,
        callback: Arc<dyn Callback>,
    ) -> (Arc<Self>, mpsc::Receiver<BdvAction>) {
        let (queue, rx) = mpsc::channel(notify::NOTIFICATION_QUEUE_DEPTH);
        let bdv = Arc::new(Bdv {
            id,
            ctx,
            state: Mutex::new(BdvState::default()),
            queue,
            callback,
            ready_tx: watch::channel(false).0,
            last_activity: AtomicU64::new(now_secs()),
        });
        (bdv, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Seconds since the last client command.
    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity.load(Ordering::Acquire))
    }

    pub fn callback(&self) -> &Arc<dyn Callback> {
        &self.callback
    }

    /// Enqueues an action for the maintenance task; drops it if the view
    /// is being torn down.
    pub async fn notify(&self, action: BdvAction) {
        let _ = self.queue.send(action).await;
    }

    fn require_ready(&self) -> Result<(), Error> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ErrorKind::NotReady.into())
        }
    }

    fn top_height(&self) -> u32 {
        self.ctx.status.top_height().unwrap_or(0)
    }

    fn n_outputs_fn(&self) -> impl Fn(&TxKey, &TxHash) -> Option<u16> + '_ {
        move |tx_key, hash| {
            if tx_key.is_unconfirmed() {
                self.ctx
                    .zc
                    .tx_by_hash(hash)
                    .map(|tx| tx.outputs.len() as u16)
            } else {
                self.ctx
                    .store
                    .reader()
                    .ok()?
                    .tx_record(tx_key)
                    .ok()
                    .flatten()
                    .map(|record| record.n_outputs)
            }
        }
    }

    /// The command table. Method names are the table keys; unknown names
    /// fail with `InvalidArgument`.
    pub async fn execute_command(
        &self,
        method: &str,
        ids: &[String],
        args: &Arguments,
    ) -> Result<Arguments, Error> {
        self.last_activity.store(now_secs(), Ordering::Release);
        debug!(bdv = %self.id, method, "command");
        match method {
            "goOnline" => self.go_online().await,
            "registerWallet" => self.register_wallet(args, false).await,
            "registerLockbox" => self.register_wallet(args, true).await,
            "getLedgerDelegateForWallets" => {
                self.require_ready()?;
                self.new_delegate(DelegateScope::Wallets).await
            }
            "getLedgerDelegateForLockboxes" => {
                self.require_ready()?;
                self.new_delegate(DelegateScope::Lockboxes).await
            }
            "getLedgerDelegateForScrAddr" => {
                self.require_ready()?;
                let wallet_id = string_arg(args, 0)?;
                let scr_addr = ScriptHash::from_bytes(binary_arg(args, 1)?.to_vec());
                self.new_delegate(DelegateScope::ScrAddr { wallet_id, scr_addr })
                    .await
            }
            "getHistoryPage" => {
                self.require_ready()?;
                let delegate_id = ids
                    .get(1)
                    .ok_or_else(|| ErrorKind::InvalidArgument.context("missing delegate id"))?;
                let page_id = int_arg(args, 0)? as usize;
                self.history_page(delegate_id, page_id).await
            }
            "getBalancesAndCount" => {
                self.require_ready()?;
                let wallet_id = string_arg(args, 0)?;
                let height = args.get_int(1).map(|h| h as u32).unwrap_or_else(|| self.top_height());
                self.balances_and_count(&wallet_id, height).await
            }
            "getTxOutList" => {
                self.require_ready()?;
                let wallet_id = string_arg(args, 0)?;
                let spendable_only = args.get_int(1).unwrap_or(0) != 0;
                self.txout_list(&wallet_id, spendable_only).await
            }
            "getTxByHash" => self.tx_by_hash(args).await,
            "hasHeaderWithHash" => {
                let hash = crate::types::BlockHash(array_arg::<32>(args, 0)?);
                let known = self
                    .ctx
                    .headers
                    .read()
                    .expect("not poisoned")
                    .contains(&hash);
                Ok(int_response(i64::from(known)))
            }
            "getTopBlockHeight" => Ok(int_response(i64::from(self.top_height()))),
            "getStatus" => Ok(self.status_response()),
            "waitOnBDV" => {
                let mut ready = self.ready_tx.subscribe();
                while !*ready.borrow_and_update() {
                    ready
                        .changed()
                        .await
                        .map_err(|_| ErrorKind::TransportClosed)?;
                }
                Ok(self.status_response())
            }
            "registerCallback" => {
                let mode = string_arg(args, 0)?;
                match mode.as_str() {
                    "waitOnBDV" => {
                        let events = self.callback.respond().await?;
                        let mut response = Arguments::new();
                        for event in events {
                            event.append_to(&mut response);
                        }
                        Ok(response)
                    }
                    "getStatus" => Ok(self.status_response()),
                    _ => Err(ErrorKind::InvalidArgument.context(format!("callback mode {mode}"))),
                }
            }
            _ => Err(ErrorKind::InvalidArgument.context(format!("unknown method {method}"))),
        }
    }

    fn status_response(&self) -> Arguments {
        [
            Argument::Int(i64::from(self.is_ready())),
            Argument::Int(i64::from(self.top_height())),
        ]
        .into_iter()
        .collect()
    }

    /// Triggers the initial scan; `BDM_Ready` arrives through the
    /// callback when it completes.
    async fn go_online(&self) -> Result<Arguments, Error> {
        if self.is_ready() {
            return Ok(int_response(1));
        }
        let queue = self.queue.clone();
        let mut caught_up = self.ctx.status.caught_up();
        let status = self.ctx.status.clone();
        crate::spawn!("bdv-go-online", async move {
            while !*caught_up.borrow_and_update() {
                if caught_up.changed().await.is_err() {
                    return;
                }
            }
            let height = status.top_height().unwrap_or(0);
            let _ = queue.send(BdvAction::Ready { height }).await;
        });
        Ok(int_response(1))
    }

    /// `registerWallet` / `registerLockbox`: create the view-side wallet
    /// and register its addresses with the filter.
    async fn register_wallet(&self, args: &Arguments, is_lockbox: bool) -> Result<Arguments, Error> {
        let wallet_id = string_arg(args, 0)?;
        let addr_bytes = args
            .get_binary_vec(1)
            .ok_or_else(|| ErrorKind::InvalidArgument.context("missing address vector"))?;
        let is_new = args.get_int(2).unwrap_or(0) != 0;
        let scr_addrs: Vec<ScriptHash> = addr_bytes
            .iter()
            .map(|bytes| ScriptHash::from_bytes(bytes.clone()))
            .collect();

        let registration = self.ctx.filter.register_addresses(
            &scr_addrs,
            &wallet_id,
            is_new,
            self.ctx.status.is_caught_up(),
            &self.ctx.store,
        )?;

        {
            let mut state = self.state.lock().await;
            let book = if is_lockbox {
                &mut state.lockboxes
            } else {
                &mut state.wallets
            };
            book.insert(
                wallet_id.clone(),
                WalletView::new(wallet_id.clone(), scr_addrs, is_lockbox),
            );
        }
        info!(bdv = %self.id, wallet = %wallet_id, ?registration, "wallet registered");

        // First argument: success. Second: whether the registration is
        // live now, or the client should wait for the refresh event.
        let immediate = match registration {
            Registration::Immediate => {
                // Live immediately; if the view is already online the
                // refresh pass fills it in and notifies the client.
                if self.is_ready() {
                    self.notify(BdvAction::Refresh {
                        wallet_ids: vec![wallet_id],
                    })
                    .await;
                }
                1
            }
            Registration::Deferred => 0,
        };
        Ok([Argument::Int(1), Argument::Int(immediate)]
            .into_iter()
            .collect())
    }

    async fn new_delegate(&self, scope: DelegateScope) -> Result<Arguments, Error> {
        let mut state = self.state.lock().await;
        state.delegate_counter += 1;
        let delegate_id = format!("{}-ld-{}", self.id, state.delegate_counter);
        state.delegates.insert(
            delegate_id.clone(),
            Delegate {
                scope,
                pages: HistoryPages::default(),
                built_for: None,
            },
        );
        Ok([Argument::Binary(delegate_id.into_bytes())]
            .into_iter()
            .collect())
    }

    /// Loads one delegate page: confirmed entries from the store, plus the
    /// current unconfirmed entries on page 0.
    async fn history_page(&self, delegate_id: &str, page_id: usize) -> Result<Arguments, Error> {
        let top = self.top_height();
        let n_outputs = self.n_outputs_fn();
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let delegate = state
            .delegates
            .get_mut(delegate_id)
            .ok_or_else(|| ErrorKind::UnknownId.context(format!("delegate {delegate_id}")))?;

        // Which wallets feed this delegate.
        let wallet_ids: Vec<String> = match &delegate.scope {
            DelegateScope::Wallets => state.wallets.keys().cloned().collect(),
            DelegateScope::Lockboxes => state.lockboxes.keys().cloned().collect(),
            DelegateScope::ScrAddr { wallet_id, .. } => vec![wallet_id.clone()],
        };
        let books = [&state.wallets, &state.lockboxes];
        let wallet = |id: &String| books.iter().find_map(|book| book.get(id));

        if delegate.built_for != Some(top) {
            let mut summary: BTreeMap<u32, u32> = BTreeMap::new();
            match &delegate.scope {
                DelegateScope::ScrAddr { scr_addr, .. } => {
                    summary = self
                        .ctx
                        .store
                        .ssh_block_counts(scr_addr)
                        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                }
                _ => {
                    for id in &wallet_ids {
                        let Some(view) = wallet(id) else { continue };
                        for sa in view.scr_addrs() {
                            let counts = self
                                .ctx
                                .store
                                .ssh_block_counts(sa)
                                .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                            for (height, count) in counts {
                                *summary.entry(height).or_default() += count;
                            }
                        }
                    }
                }
            }
            delegate.pages = HistoryPages::map_history(&summary, self.ctx.txn_per_page);
            delegate.built_for = Some(top);
        }

        let headers = self.ctx.headers.read().expect("not poisoned");
        let store = &self.ctx.store;
        let scope = delegate.scope.clone();
        let ledgers = delegate.pages.page_ledger_map(page_id, |start, end| {
            let mut merged: BTreeMap<TxKey, LedgerEntry> = BTreeMap::new();
            match &scope {
                DelegateScope::ScrAddr { scr_addr, .. } => {
                    let hist = store
                        .ssh_history(scr_addr, start, end)
                        .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                    merged = wallet::build_ledger(
                        scr_addr.as_bytes(),
                        hist.values(),
                        &headers,
                        start,
                        &|_, _| None,
                    );
                }
                _ => {
                    for id in &wallet_ids {
                        let Some(view) = wallet(id) else { continue };
                        let mut txios = Vec::new();
                        for sa in view.scr_addrs() {
                            let hist = store
                                .ssh_history(sa, start, end)
                                .map_err(|e| ErrorKind::StorageCorrupt.context(e))?;
                            txios.extend(hist.into_values());
                        }
                        let ledger = wallet::build_ledger(
                            id.as_bytes(),
                            txios.iter(),
                            &headers,
                            start,
                            &n_outputs,
                        );
                        merged.extend(ledger);
                    }
                }
            }
            Ok(merged)
        })?;

        let mut entries: Vec<LedgerEntry> = ledgers.values().cloned().collect();

        // Unconfirmed entries ride on the most recent page.
        if page_id == 0 {
            match &delegate.scope {
                DelegateScope::ScrAddr { wallet_id, scr_addr } => {
                    if let Some(view) = wallet(wallet_id) {
                        if let Some(addr) = view.address(scr_addr) {
                            entries.extend(
                                addr.ledger()
                                    .values()
                                    .filter(|entry| entry.block_num == ZC_BLOCK_NUM)
                                    .cloned(),
                            );
                        }
                    }
                }
                _ => {
                    for id in &wallet_ids {
                        let Some(view) = wallet(id) else { continue };
                        entries.extend(
                            view.ledger()
                                .values()
                                .filter(|entry| entry.block_num == ZC_BLOCK_NUM)
                                .cloned(),
                        );
                    }
                }
            }
        }

        entries.sort();
        Ok([Argument::Ledgers(entries)].into_iter().collect())
    }

    async fn balances_and_count(&self, wallet_id: &str, height: u32) -> Result<Arguments, Error> {
        let mut state = self.state.lock().await;
        let wallet = state.wallet_mut(wallet_id)?;
        let balances = wallet.balances(height);
        Ok([
            Argument::Int(balances.full as i64),
            Argument::Int(balances.spendable as i64),
            Argument::Int(balances.unconfirmed),
            Argument::Int(balances.txio_count as i64),
        ]
        .into_iter()
        .collect())
    }

    async fn txout_list(&self, wallet_id: &str, spendable_only: bool) -> Result<Arguments, Error> {
        let height = self.top_height();
        let mut state = self.state.lock().await;
        let wallet = state.wallet_mut(wallet_id)?;
        let utxos = wallet.utxos(height, spendable_only);
        let mut items = Vec::with_capacity(utxos.len());
        for (scr_addr, txio) in utxos {
            let mut w = Writer::new();
            w.put_bytes(txio.out_key().as_bytes());
            w.put_u64_be(txio.value());
            w.put_var_bytes(scr_addr.as_bytes());
            items.push(w.into_bytes());
        }
        Ok([Argument::BinaryVec(items)].into_iter().collect())
    }

    async fn tx_by_hash(&self, args: &Arguments) -> Result<Arguments, Error> {
        let hash = TxHash(array_arg::<32>(args, 0)?);
        if let Some(tx) = self.ctx.zc.tx_by_hash(&hash) {
            return Ok([Argument::Binary(tx.serialize())].into_iter().collect());
        }
        let key = self
            .ctx
            .store
            .tx_key_for_hash(&hash)
            .map_err(|e| ErrorKind::StorageCorrupt.context(e))?
            .ok_or_else(|| ErrorKind::UnknownId.context(format!("tx {hash}")))?;
        let height = key.height().expect("confirmed key from the store");
        let cursor = TxCursor {
            height,
            tx_index: key.tx_index().expect("confirmed key from the store"),
        };
        let tx = self
            .ctx
            .source
            .read_tx(cursor)
            .await
            .map_err(|e| ErrorKind::Generic.context(e))?
            .ok_or_else(|| ErrorKind::StorageCorrupt.context("tx cursor out of range"))?;
        Ok([Argument::Binary(tx.serialize())].into_iter().collect())
    }
}

fn int_response(value: i64) -> Arguments {
    [Argument::Int(value)].into_iter().collect()
}

fn int_arg(args: &Arguments, index: usize) -> Result<i64, Error> {
    args.get_int(index)
        .ok_or_else(|| ErrorKind::InvalidArgument.context(format!("argument {index}")).into())
}

fn binary_arg<'a>(args: &'a Arguments, index: usize) -> Result<&'a [u8], Error> {
    args.get_binary(index)
        .ok_or_else(|| Error::from(ErrorKind::InvalidArgument))
}

fn array_arg<const N: usize>(args: &Arguments, index: usize) -> Result<[u8; N], Error> {
    binary_arg(args, index)?
        .try_into()
        .map_err(|_| ErrorKind::InvalidArgument.context(format!("argument {index} length")).into())
}

fn string_arg(args: &Arguments, index: usize) -> Result<String, Error> {
    String::from_utf8(binary_arg(args, index)?.to_vec())
        .map_err(|_| ErrorKind::InvalidArgument.context(format!("argument {index} utf8")).into())
}

/// The view's maintenance task: drains the notification queue in order
/// and applies each action to the wallets, then forwards the processed
/// event through the callback.
pub async fn maintenance(
    bdv: Arc<Bdv>,
    mut rx: mpsc::Receiver<BdvAction>,
) -> Result<(), Error> {
    while let Some(action) = rx.recv().await {
        match action {
            BdvAction::NewBlock {
                height,
                reorged_from,
            } => {
                apply_new_block(&bdv, height, reorged_from).await?;
                bdv.callback.emit(CallbackEvent::NewBlock { height });
            }
            BdvAction::Refresh { wallet_ids } => {
                apply_refresh(&bdv, &wallet_ids).await?;
                bdv.callback.emit(CallbackEvent::Refresh { wallet_ids });
            }
            BdvAction::ZeroConf { txio } => {
                let ledgers = {
                    let mut state = bdv.state.lock().await;
                    let headers = bdv.ctx.headers.read().expect("not poisoned");
                    let n_outputs = bdv.n_outputs_fn();
                    let mut ledgers = Vec::new();
                    for wallet in state.all_wallets_mut() {
                        ledgers.extend(wallet.scan_zc(
                            &txio,
                            &headers,
                            bdv.ctx.txn_per_page,
                            &n_outputs,
                        ));
                    }
                    ledgers
                };
                if !ledgers.is_empty() {
                    bdv.callback.emit(CallbackEvent::ZeroConf { ledgers });
                }
            }
            BdvAction::ZcPurge { invalidated } => {
                let dropped = {
                    let mut state = bdv.state.lock().await;
                    let headers = bdv.ctx.headers.read().expect("not poisoned");
                    let n_outputs = bdv.n_outputs_fn();
                    let mut dropped = Vec::new();
                    for wallet in state.all_wallets_mut() {
                        for (tx_key, tx_hash) in wallet.purge_zc(
                            &invalidated,
                            &headers,
                            bdv.ctx.txn_per_page,
                            &n_outputs,
                        ) {
                            let mut entry = LedgerEntry::new(
                                wallet.id().as_bytes().to_vec(),
                                0,
                                ZC_BLOCK_NUM,
                                tx_hash,
                                tx_key.zc_counter().unwrap_or(0),
                                0,
                            );
                            entry.valid = false;
                            dropped.push(entry);
                        }
                    }
                    dropped
                };
                if !dropped.is_empty() {
                    bdv.callback.emit(CallbackEvent::ZeroConf { ledgers: dropped });
                }
            }
            BdvAction::Progress(data) => {
                bdv.callback.emit(CallbackEvent::Progress(data));
            }
            BdvAction::Ready { height } => {
                apply_new_block(&bdv, height, None).await?;
                bdv.ready_tx.send_replace(true);
                info!(bdv = %bdv.id, height, "view ready");
                bdv.callback.emit(CallbackEvent::Ready { height });
            }
            BdvAction::Terminate => break,
        }
    }
    bdv.callback.shutdown();
    debug!(bdv = %bdv.id, "maintenance task exiting");
    Ok(())
}

/// Advances every wallet to `height`, unwinding first when the tip
/// arrived through a reorg (or shrank below what a wallet has seen).
async fn apply_new_block(
    bdv: &Arc<Bdv>,
    height: u32,
    reorged_from: Option<u32>,
) -> Result<(), Error> {
    let mut state = bdv.state.lock().await;
    let headers = bdv.ctx.headers.read().expect("not poisoned");
    let n_outputs = bdv.n_outputs_fn();
    for wallet in state.all_wallets_mut() {
        let last_valid = match reorged_from {
            Some(fork) => fork.min(height),
            None => height,
        };
        if wallet.last_scanned() > last_valid {
            wallet.update_after_reorg(last_valid, &headers, bdv.ctx.txn_per_page, &n_outputs);
        }
        let start = wallet.next_scan_height();
        wallet.scan(
            &bdv.ctx.store,
            &headers,
            start,
            height,
            bdv.ctx.txn_per_page,
            &n_outputs,
        )?;
    }
    Ok(())
}

/// Re-reads the named wallets from scratch after a side-scan merge or a
/// late registration, and drops their cached pages.
async fn apply_refresh(bdv: &Arc<Bdv>, wallet_ids: &[String]) -> Result<(), Error> {
    let height = bdv.ctx.status.top_height().unwrap_or(0);
    let mut state = bdv.state.lock().await;
    let headers = bdv.ctx.headers.read().expect("not poisoned");
    let n_outputs = bdv.n_outputs_fn();

    for id in wallet_ids {
        let Ok(wallet) = state.wallet_mut(id) else {
            // Some other view's wallet.
            continue;
        };
        wallet.scan(
            &bdv.ctx.store,
            &headers,
            0,
            height,
            bdv.ctx.txn_per_page,
            &n_outputs,
        )?;
        wallet.invalidate_pages();

        // Pick up current mempool state for the refreshed addresses.
        let zc_txio = bdv
            .ctx
            .zc
            .txio_for_addrs(wallet.scr_addrs());
        if !zc_txio.is_empty() {
            wallet.scan_zc(&zc_txio, &headers, bdv.ctx.txn_per_page, &n_outputs);
        }
    }

    // Delegates page over refreshed wallets; force a rebuild.
    for delegate in state.delegates.values_mut() {
        delegate.built_for = None;
    }
    Ok(())
}
