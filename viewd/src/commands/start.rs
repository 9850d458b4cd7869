//! `start` subcommand

use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, watch};
use tokio::{pin, select};
use tracing::{info, warn};

use crate::cli::StartCmd;
use crate::components::TaskHandle;
use crate::components::chain::{HeaderChain, MemorySource};
use crate::components::clients::Clients;
use crate::components::filter::ScrAddrFilter;
use crate::components::storage::Store;
use crate::components::sync::{ChainSync, EVENT_CHANNEL_DEPTH, ChainStatus, SyncHandles};
use crate::components::views::ViewContext;
use crate::components::zeroconf::ZeroConfContainer;
use crate::config::ViewdConfig;
use crate::error::{Error, ErrorKind};

impl StartCmd {
    pub fn run(&self, verbose: bool, config_path: Option<&Path>) -> Result<(), Error> {
        crate::components::tracing::init(verbose)?;
        let config = super::load_config(config_path)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| ErrorKind::Init.context(e))?;
        runtime.block_on(self.start(config))
    }

    async fn start(&self, config: ViewdConfig) -> Result<(), Error> {
        info!(
            "Indexing the {:?} network (magic {})",
            config.network,
            hex::encode(config.network.magic_bytes()),
        );
        if let Some(datadir) = &config.store.datadir {
            // The index store driver is pluggable; the in-process store
            // keeps everything in memory for now.
            info!("Ignoring store.datadir {} (in-memory store)", datadir.display());
        }
        let store = Store::in_memory();

        if config.chain.blkdir.is_none() {
            warn!("Configure `chain.blkdir` to index a node's block files; serving an empty chain");
        }
        let source = Arc::new(MemorySource::new());

        let filter = Arc::new(ScrAddrFilter::new(config.store.db_mode));
        let zc = Arc::new(ZeroConfContainer::default());
        let headers = Arc::new(RwLock::new(HeaderChain::new()));
        let status = Arc::new(ChainStatus::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let fanout_events = events.subscribe();
        let sync_task_handle = ChainSync::spawn(
            SyncHandles {
                store: store.clone(),
                source: source.clone(),
                filter: filter.clone(),
                zc: zc.clone(),
                headers: headers.clone(),
                status: status.clone(),
                events,
            },
            shutdown_rx,
        )?;

        let clients = Clients::new(
            ViewContext {
                store,
                source,
                headers,
                filter,
                zc,
                status,
                txn_per_page: config.txn_per_page(),
            },
            None,
        );
        let fanout_task_handle = clients.clone().spawn_maintenance(fanout_events);
        let gc_task_handle = clients.clone().spawn_gc(config.idle_reap());

        // The framing transports (FastCGI / WebSocket / binary socket) sit
        // outside this crate and drive `Clients::run_command`.
        info!("Command surface bound for {}", config.listen_addr());
        let transport_task_handle: TaskHandle =
            crate::spawn!("transport", std::future::pending());

        info!("Spawned Viewd tasks");

        // Ongoing tasks.
        pin!(sync_task_handle);
        pin!(fanout_task_handle);
        pin!(gc_task_handle);
        pin!(transport_task_handle);

        // Wait for tasks to finish.
        let res = loop {
            let exit_when_task_finishes = true;

            let result = select! {
                sync_join_result = &mut sync_task_handle => {
                    let sync_result = sync_join_result
                        .expect("unexpected panic in the chain sync task");
                    info!(?sync_result, "Chain sync task exited");
                    Ok(())
                }

                fanout_join_result = &mut fanout_task_handle => {
                    let fanout_result = fanout_join_result
                        .expect("unexpected panic in the clients maintenance task");
                    info!(?fanout_result, "Clients maintenance task exited");
                    Ok(())
                }

                gc_join_result = &mut gc_task_handle => {
                    let gc_result = gc_join_result
                        .expect("unexpected panic in the view GC task");
                    info!(?gc_result, "View GC task exited");
                    Ok(())
                }

                transport_join_result = &mut transport_task_handle => {
                    let transport_result = transport_join_result
                        .expect("unexpected panic in the transport task");
                    info!(?transport_result, "Transport task exited");
                    Ok(())
                }
            };

            // Stop Viewd if a task finished and returned an error, or if an
            // ongoing task exited.
            match result {
                Err(()) => break result,
                Ok(()) if exit_when_task_finishes => break result,
                Ok(()) => (),
            }
        };

        info!("Exiting Viewd because an ongoing task exited; asking other tasks to stop");

        let _ = shutdown_tx.send(true);
        clients.shutdown().await;

        // Ongoing tasks.
        sync_task_handle.abort();
        fanout_task_handle.abort();
        gc_task_handle.abort();
        transport_task_handle.abort();

        info!("All tasks have been asked to stop, waiting for remaining tasks to finish");

        res.map_err(|()| ErrorKind::Fatal.into())
    }
}
