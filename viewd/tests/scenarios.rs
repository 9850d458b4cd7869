//! End-to-end scenarios driven through the framed command surface.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use viewd::components::chain::{HeaderChain, MemorySource};
use viewd::components::clients::Clients;
use viewd::components::filter::ScrAddrFilter;
use viewd::components::storage::Store;
use viewd::components::sync::{ChainStatus, ChainSync, EVENT_CHANNEL_DEPTH, SyncHandles};
use viewd::components::testing::{base_chain, block, coinbase_tx, fixture_addr, spend_tx};
use viewd::components::views::notify::{Callback as _, CallbackEvent};
use viewd::components::views::{Bdv, ViewContext};
use viewd::components::zeroconf::ZeroConfContainer;
use viewd::config::DbMode;
use viewd::types::{Block, Tx};
use viewd::wire::{Argument, Arguments, BdvCommand};

const COIN: u64 = 1_0000_0000;

struct Harness {
    source: Arc<MemorySource>,
    zc: Arc<ZeroConfContainer>,
    clients: Arc<Clients>,
    handles: SyncHandles,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// Builds every component and the clients fan-out, but does not start
    /// the sync task yet; scenarios control when indexing begins.
    fn new(mode: DbMode, blocks: Vec<Block>) -> Self {
        let source = Arc::new(MemorySource::new());
        for block in blocks {
            source.push_block(block);
        }
        let zc = Arc::new(ZeroConfContainer::default());
        let handles = SyncHandles {
            store: Store::in_memory(),
            source: source.clone(),
            filter: Arc::new(ScrAddrFilter::new(mode)),
            zc: zc.clone(),
            headers: Arc::new(RwLock::new(HeaderChain::new())),
            status: Arc::new(ChainStatus::new()),
            events: broadcast::channel(EVENT_CHANNEL_DEPTH).0,
        };
        let clients = Clients::new(
            ViewContext {
                store: handles.store.clone(),
                source: source.clone(),
                headers: handles.headers.clone(),
                filter: handles.filter.clone(),
                zc: zc.clone(),
                status: handles.status.clone(),
                txn_per_page: 100,
            },
            None,
        );
        clients.clone().spawn_maintenance(handles.events.subscribe());
        let (shutdown, _) = watch::channel(false);
        Harness {
            source,
            zc,
            clients,
            handles,
            shutdown,
        }
    }

    fn start_sync(&self) {
        ChainSync::spawn(self.handles.clone(), self.shutdown.subscribe()).unwrap();
    }

    async fn command(&self, method: &str, ids: &[&str], args: Arguments) -> Arguments {
        let cmd = BdvCommand::new(
            method,
            ids.iter().map(|id| id.to_string()).collect(),
            args,
        );
        self.clients.run_command(&cmd.serialize()).await
    }

    async fn register_bdv(&self) -> (String, Arc<Bdv>) {
        let response = self.command("registerBDV", &[], Arguments::new()).await;
        let id = String::from_utf8(response.get_binary(0).expect("bdv id").to_vec()).unwrap();
        let bdv = self.clients.get(&id).expect("registered");
        (id, bdv)
    }

    async fn register_wallet(&self, bdv_id: &str, wallet_id: &str, addr_tags: &[u8]) -> Arguments {
        let addrs: Vec<Vec<u8>> = addr_tags
            .iter()
            .map(|&tag| fixture_addr(tag).as_bytes().to_vec())
            .collect();
        let args: Arguments = [
            Argument::Binary(wallet_id.as_bytes().to_vec()),
            Argument::BinaryVec(addrs),
            Argument::Int(0),
        ]
        .into_iter()
        .collect();
        self.command("registerWallet", &[bdv_id], args).await
    }

    async fn balances(&self, bdv_id: &str, wallet_id: &str) -> (i64, i64, i64, i64) {
        let args: Arguments = [Argument::Binary(wallet_id.as_bytes().to_vec())]
            .into_iter()
            .collect();
        let response = self.command("getBalancesAndCount", &[bdv_id], args).await;
        (
            response.get_int(0).expect("full"),
            response.get_int(1).expect("spendable"),
            response.get_int(2).expect("unconfirmed"),
            response.get_int(3).expect("count"),
        )
    }
}

/// Drains callback events until one matches, discarding the rest.
async fn wait_for_event(
    bdv: &Arc<Bdv>,
    mut pred: impl FnMut(&CallbackEvent) -> bool,
) -> CallbackEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let events = bdv.callback().respond().await.expect("callback open");
            for event in events {
                if pred(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for callback event")
}

async fn go_online_and_wait_ready(harness: &Harness, bdv_id: &str, bdv: &Arc<Bdv>) {
    let response = harness.command("goOnline", &[bdv_id], Arguments::new()).await;
    assert_eq!(response.get_int(0), Some(1));
    wait_for_event(bdv, |event| matches!(event, CallbackEvent::Ready { .. })).await;
}

#[tokio::test]
async fn register_before_online() {
    let harness = Harness::new(DbMode::Selective, base_chain());
    let (bdv_id, bdv) = harness.register_bdv().await;

    // Registration lands before the index reaches the tip: immediate.
    let response = harness.register_wallet(&bdv_id, "w1", &[0xA1, 0xA2]).await;
    assert_eq!(response.get_int(0), Some(1));
    assert_eq!(response.get_int(1), Some(1));

    harness.start_sync();
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    let (full, spendable, unconf, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 50 * COIN as i64);
    assert_eq!(spendable, 50 * COIN as i64);
    assert_eq!(unconf, 0);
    assert_eq!(count, 1);

    // The query surface around the same state.
    let chain = base_chain();
    let header_hash = chain[1].header.hash;
    let response = harness
        .command(
            "hasHeaderWithHash",
            &[&bdv_id],
            [Argument::Binary(header_hash.0.to_vec())].into_iter().collect(),
        )
        .await;
    assert_eq!(response.get_int(0), Some(1));

    let pay_a1_hash = chain[1].txs[1].hash;
    let response = harness
        .command(
            "getTxByHash",
            &[&bdv_id],
            [Argument::Binary(pay_a1_hash.0.to_vec())].into_iter().collect(),
        )
        .await;
    let tx = Tx::deserialize(response.get_binary(0).expect("tx bytes")).unwrap();
    assert_eq!(tx.hash, pay_a1_hash);
    assert_eq!(tx.outputs[0].value, 50 * COIN);

    let response = harness
        .command(
            "getTxOutList",
            &[&bdv_id],
            [
                Argument::Binary(b"w1".to_vec()),
                Argument::Int(1),
            ]
            .into_iter()
            .collect(),
        )
        .await;
    assert_eq!(response.get_binary_vec(0).expect("utxo list").len(), 1);
}

#[tokio::test]
async fn register_after_online_triggers_one_refresh() {
    let harness = Harness::new(DbMode::Selective, base_chain());
    harness.start_sync();
    let (bdv_id, bdv) = harness.register_bdv().await;
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    // Late registration goes through a side scan.
    let response = harness.register_wallet(&bdv_id, "w2", &[0xA3]).await;
    assert_eq!(response.get_int(0), Some(1));
    assert_eq!(response.get_int(1), Some(0));

    let refreshed = wait_for_event(&bdv, |event| {
        matches!(event, CallbackEvent::Refresh { wallet_ids } if wallet_ids.contains(&"w2".to_string()))
    })
    .await;
    match refreshed {
        CallbackEvent::Refresh { wallet_ids } => assert_eq!(wallet_ids, ["w2"]),
        _ => unreachable!(),
    }

    let (full, spendable, unconf, count) = harness.balances(&bdv_id, "w2").await;
    assert_eq!(full, 25 * COIN as i64);
    assert_eq!(spendable, 25 * COIN as i64);
    assert_eq!(unconf, 0);
    assert_eq!(count, 1);
}

#[tokio::test]
async fn new_block_updates_balances() {
    let chain = base_chain();
    let cb2_hash = chain[2].txs[0].hash;
    let tip_hash = chain[2].header.hash;

    let harness = Harness::new(DbMode::Selective, chain);
    let (bdv_id, bdv) = harness.register_bdv().await;
    harness.register_wallet(&bdv_id, "w1", &[0xA1]).await;
    harness.start_sync();
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    let pay_more = spend_tx(0x06, (cb2_hash, 0), &[(0xA1, 10 * COIN), (0x6D, 40 * COIN)]);
    harness
        .source
        .push_block(block(0x13, tip_hash, vec![coinbase_tx(0x07, 0x6D, 50 * COIN), pay_more]));

    wait_for_event(&bdv, |event| {
        matches!(event, CallbackEvent::NewBlock { height: 3 })
    })
    .await;

    let (full, _, _, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 60 * COIN as i64);
    assert_eq!(count, 2);
}

#[tokio::test]
async fn zero_conf_receive_and_invalidation() {
    let chain = base_chain();
    let cb2_hash = chain[2].txs[0].hash;
    let tip_hash = chain[2].header.hash;

    let harness = Harness::new(DbMode::Selective, chain);
    let (bdv_id, bdv) = harness.register_bdv().await;
    harness.register_wallet(&bdv_id, "w1", &[0xA1]).await;
    harness.start_sync();
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    // Scenario 4: an unconfirmed payment to A1 raises the unconfirmed
    // balance and leaves the full balance alone.
    let zc_pay = spend_tx(0x40, (cb2_hash, 0), &[(0xA1, 5 * COIN), (0x6D, 45 * COIN)]);
    harness.zc.add_raw_tx(zc_pay, 1_700_000_000);

    let event = wait_for_event(&bdv, |event| {
        matches!(event, CallbackEvent::ZeroConf { ledgers } if !ledgers.is_empty())
    })
    .await;
    match event {
        CallbackEvent::ZeroConf { ledgers } => {
            assert!(ledgers.iter().all(|entry| entry.valid));
            assert_eq!(ledgers[0].value, 5 * COIN as i64);
        }
        _ => unreachable!(),
    }

    let (full, _, unconf, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 50 * COIN as i64);
    assert_eq!(unconf, 5 * COIN as i64);
    assert_eq!(count, 2);

    // Scenario 5: a block double-spends the same funding outpoint; the
    // mempool entry reverses out.
    let conflict = spend_tx(0x41, (cb2_hash, 0), &[(0x6D, 50 * COIN)]);
    harness
        .source
        .push_block(block(0x13, tip_hash, vec![coinbase_tx(0x08, 0x6D, 50 * COIN), conflict]));

    let event = wait_for_event(&bdv, |event| {
        matches!(event, CallbackEvent::ZeroConf { ledgers } if ledgers.iter().any(|entry| !entry.valid))
    })
    .await;
    match event {
        CallbackEvent::ZeroConf { ledgers } => {
            assert!(ledgers.iter().any(|entry| !entry.valid));
        }
        _ => unreachable!(),
    }

    let (full, _, unconf, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 50 * COIN as i64);
    assert_eq!(unconf, 0);
    assert_eq!(count, 1);
}

#[tokio::test]
async fn reorg_recomputes_from_the_alternate_chain() {
    let mut chain = base_chain();
    let cb1_hash = chain[1].txs[0].hash;
    let cb2_hash = chain[2].txs[0].hash;
    let b1_hash = chain[1].header.hash;
    let b2_hash = chain[2].header.hash;
    // Height 3 pays A1 another 10 BTC on the original branch.
    let pay_more = spend_tx(0x06, (cb2_hash, 0), &[(0xA1, 10 * COIN), (0x6D, 40 * COIN)]);
    chain.push(block(0x13, b2_hash, vec![coinbase_tx(0x07, 0x6D, 50 * COIN), pay_more]));

    let harness = Harness::new(DbMode::Selective, chain);
    let (bdv_id, bdv) = harness.register_bdv().await;
    harness.register_wallet(&bdv_id, "w1", &[0xA1]).await;
    harness.start_sync();
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    let (full, _, _, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 60 * COIN as i64);
    assert_eq!(count, 2);

    // The alternate branch replaces heights 2..4: A1's 10 BTC payment is
    // gone, and a different 7 BTC payment lands instead.
    let alt_pay = spend_tx(0x50, (cb1_hash, 0), &[(0xA1, 7 * COIN), (0x6D, 43 * COIN)]);
    let alt2 = block(0x22, b1_hash, vec![coinbase_tx(0x51, 0x6D, 50 * COIN), alt_pay]);
    let alt3 = block(
        0x23,
        alt2.header.hash,
        vec![coinbase_tx(0x52, 0x6D, 50 * COIN)],
    );
    let alt4 = block(
        0x24,
        alt3.header.hash,
        vec![coinbase_tx(0x53, 0x6D, 50 * COIN)],
    );
    harness.source.replace_from(2, vec![alt2, alt3, alt4]);

    wait_for_event(&bdv, |event| {
        matches!(event, CallbackEvent::NewBlock { height: 4 })
    })
    .await;

    let (full, _, _, count) = harness.balances(&bdv_id, "w1").await;
    assert_eq!(full, 57 * COIN as i64);
    assert_eq!(count, 2);
}

#[tokio::test]
async fn history_pages_through_a_ledger_delegate() {
    let harness = Harness::new(DbMode::Selective, base_chain());
    let (bdv_id, bdv) = harness.register_bdv().await;
    harness.register_wallet(&bdv_id, "w1", &[0xA1]).await;
    harness.start_sync();
    go_online_and_wait_ready(&harness, &bdv_id, &bdv).await;

    let response = harness
        .command("getLedgerDelegateForWallets", &[&bdv_id], Arguments::new())
        .await;
    let delegate_id =
        String::from_utf8(response.get_binary(0).expect("delegate id").to_vec()).unwrap();

    let response = harness
        .command(
            "getHistoryPage",
            &[&bdv_id, &delegate_id],
            [Argument::Int(0)].into_iter().collect(),
        )
        .await;
    let entries = response.get_ledgers(0).expect("ledger page");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, 50 * COIN as i64);
    assert_eq!(entries[0].block_num, 1);
    assert_eq!(entries[0].scope, b"w1".to_vec());

    // Unknown delegate ids are rejected.
    let response = harness
        .command(
            "getHistoryPage",
            &[&bdv_id, "nope"],
            [Argument::Int(0)].into_iter().collect(),
        )
        .await;
    assert!(matches!(response.get(0), Some(Argument::Error(_, _))));
}

#[tokio::test]
async fn not_ready_and_unknown_ids_are_reported() {
    let harness = Harness::new(DbMode::Selective, base_chain());
    let (bdv_id, _bdv) = harness.register_bdv().await;
    harness.register_wallet(&bdv_id, "w1", &[0xA1]).await;

    // Before goOnline completes, readiness-gated commands fail NotReady.
    let bdv_id_refs = [bdv_id.as_str()];
    let response = harness.command(
        "getBalancesAndCount",
        &bdv_id_refs,
        [Argument::Binary(b"w1".to_vec())].into_iter().collect(),
    );
    let kind = viewd::error::ErrorKind::NotReady.wire_code();
    assert!(matches!(response.await.get(0), Some(Argument::Error(code, _)) if *code == kind));

    // Unknown view ids too.
    let response = harness
        .command("getStatus", &["deadbeef"], Arguments::new())
        .await;
    let kind = viewd::error::ErrorKind::UnknownId.wire_code();
    assert!(matches!(response.get(0), Some(Argument::Error(code, _)) if *code == kind));

    // And unknown methods.
    let response = harness
        .command("mineFasterPlease", &[&bdv_id], Arguments::new())
        .await;
    let kind = viewd::error::ErrorKind::InvalidArgument.wire_code();
    assert!(matches!(response.get(0), Some(Argument::Error(code, _)) if *code == kind));
}

#[tokio::test]
async fn gc_reaps_idle_views_and_shutdown_quiesces() {
    let harness = Harness::new(DbMode::Selective, base_chain());
    harness.start_sync();
    let (bdv_id, _bdv) = harness.register_bdv().await;
    assert_eq!(harness.clients.len(), 1);

    harness.clients.clone().spawn_gc(Duration::from_secs(1));
    timeout(Duration::from_secs(10), async {
        while harness.clients.get(&bdv_id).is_some() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("idle view reaped");

    let (other_id, other) = harness.register_bdv().await;
    harness.clients.shutdown().await;
    assert!(harness.clients.get(&other_id).is_none());
    // A long-poll opened against a shut-down view unblocks with terminate.
    let events = other.callback().respond().await.unwrap();
    assert!(matches!(events.last(), Some(CallbackEvent::Terminate)));
}
