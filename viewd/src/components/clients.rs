//! The registry of active client views.
//!
//! Owns every [`Bdv`], routes framed commands to them, fans the sync
//! task's events out to their notification queues, and reaps views whose
//! clients went away. The id map is copy-on-write: writers swap a fresh
//! map under the mutex, readers clone the current snapshot and never
//! block each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind};
use crate::wire::{Argument, Arguments, BdvCommand};

use super::TaskHandle;
use super::sync::ChainEvent;
use super::views::notify::{BdvAction, QueuedCallback};
use super::views::{Bdv, ViewContext, maintenance};

type BdvMap = HashMap<String, Arc<Bdv>>;

/// Callback the transport supplies to learn about service shutdown.
pub type ShutdownFn = Box<dyn FnOnce() + Send>;

/// The registry.
pub struct Clients {
    bdvs: Mutex<Arc<BdvMap>>,
    ctx: ViewContext,
    run: AtomicBool,
    shutdown_fn: Mutex<Option<ShutdownFn>>,
}

impl Clients {
    pub fn new(ctx: ViewContext, shutdown_fn: Option<ShutdownFn>) -> Arc<Self> {
        Arc::new(Clients {
            bdvs: Mutex::new(Arc::new(BdvMap::new())),
            ctx,
            run: AtomicBool::new(true),
            shutdown_fn: Mutex::new(shutdown_fn),
        })
    }

    /// The current id-map snapshot.
    fn snapshot(&self) -> Arc<BdvMap> {
        self.bdvs.lock().expect("not poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Bdv>> {
        self.snapshot().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Creates a view under a fresh 20-byte random id and starts its
    /// maintenance task.
    pub fn register_bdv(&self) -> Result<String, Error> {
        if !self.run.load(Ordering::Acquire) {
            return Err(ErrorKind::TransportClosed.into());
        }
        let mut id_bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);

        let callback = Arc::new(QueuedCallback::new());
        let (bdv, rx) = Bdv::new(id.clone(), self.ctx.clone(), callback);
        {
            let mut bdvs = self.bdvs.lock().expect("not poisoned");
            let mut next = BdvMap::clone(&bdvs);
            next.insert(id.clone(), bdv.clone());
            *bdvs = Arc::new(next);
        }
        crate::spawn!("bdv-maintenance", async move {
            if let Err(e) = maintenance(bdv, rx).await {
                warn!("view maintenance exited with error: {e}");
            }
        });
        info!(bdv = %id, "view registered");
        Ok(id)
    }

    /// Removes a view; its maintenance task drains the terminate and
    /// exits, unblocking any long-poll.
    pub async fn unregister_bdv(&self, id: &str) -> Result<(), Error> {
        let bdv = {
            let mut bdvs = self.bdvs.lock().expect("not poisoned");
            let mut next = BdvMap::clone(&bdvs);
            let bdv = next.remove(id);
            *bdvs = Arc::new(next);
            bdv
        };
        let bdv = bdv.ok_or_else(|| ErrorKind::UnknownId.context(format!("bdv {id}")))?;
        bdv.notify(BdvAction::Terminate).await;
        info!(bdv = %id, "view unregistered");
        Ok(())
    }

    /// Deserializes and routes one framed command. Never fails: protocol
    /// and handler errors come back as an `Error` argument.
    pub async fn run_command(&self, raw: &[u8]) -> Arguments {
        let cmd = match BdvCommand::deserialize(raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                return error_response(&ErrorKind::InvalidArgument.context(e));
            }
        };
        match self.dispatch(&cmd).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    async fn dispatch(&self, cmd: &BdvCommand) -> Result<Arguments, Error> {
        match cmd.method.as_str() {
            "registerBDV" => {
                let id = self.register_bdv()?;
                Ok([Argument::Binary(id.into_bytes())].into_iter().collect())
            }
            "unregisterBDV" => {
                let id = cmd
                    .ids
                    .first()
                    .ok_or_else(|| ErrorKind::InvalidArgument.context("missing bdv id"))?;
                self.unregister_bdv(id).await?;
                Ok([Argument::Int(1)].into_iter().collect())
            }
            method => {
                let id = cmd
                    .ids
                    .first()
                    .ok_or_else(|| ErrorKind::InvalidArgument.context("missing bdv id"))?;
                let bdv = self
                    .get(id)
                    .ok_or_else(|| ErrorKind::UnknownId.context(format!("bdv {id}")))?;
                bdv.execute_command(method, &cmd.ids, &cmd.args).await
            }
        }
    }

    /// Quiesces the registry: broadcast terminate, drop every view, hand
    /// control back to the transport.
    pub async fn shutdown(&self) {
        self.run.store(false, Ordering::Release);
        let bdvs = {
            let mut map = self.bdvs.lock().expect("not poisoned");
            std::mem::replace(&mut *map, Arc::new(BdvMap::new()))
        };
        for bdv in bdvs.values() {
            bdv.notify(BdvAction::Terminate).await;
        }
        if let Some(shutdown_fn) = self.shutdown_fn.lock().expect("not poisoned").take() {
            shutdown_fn();
        }
        info!("clients registry shut down");
    }

    /// Fans sync events out to every view's queue, preserving per-view
    /// FIFO order.
    pub fn spawn_maintenance(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ChainEvent>,
    ) -> TaskHandle {
        let clients = self;
        crate::spawn!("clients-maintenance", async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event fan-out lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !clients.run.load(Ordering::Acquire) {
                    break;
                }
                let action = match event {
                    ChainEvent::NewBlock {
                        height,
                        reorged_from,
                    } => BdvAction::NewBlock {
                        height,
                        reorged_from,
                    },
                    ChainEvent::Refresh { wallet_ids } => BdvAction::Refresh { wallet_ids },
                    ChainEvent::ZcReceived { txio } => BdvAction::ZeroConf { txio },
                    ChainEvent::ZcPurged { invalidated } => BdvAction::ZcPurge { invalidated },
                    ChainEvent::Progress(data) => BdvAction::Progress(data),
                };
                for bdv in clients.snapshot().values() {
                    bdv.notify(action.clone()).await;
                }
            }
            Ok(())
        })
    }

    /// Reaps views whose clients have gone quiet.
    pub fn spawn_gc(self: Arc<Self>, idle_threshold: Duration) -> TaskHandle {
        let clients = self;
        crate::spawn!("bdv-gc", async move {
            let mut interval = tokio::time::interval(idle_threshold.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !clients.run.load(Ordering::Acquire) {
                    break;
                }
                let stale: Vec<String> = clients
                    .snapshot()
                    .values()
                    .filter(|bdv| Duration::from_secs(bdv.idle_secs()) >= idle_threshold)
                    .map(|bdv| bdv.id().to_owned())
                    .collect();
                for id in stale {
                    info!(bdv = %id, "reaping idle view");
                    let _ = clients.unregister_bdv(&id).await;
                }
            }
            Ok(())
        })
    }
}

fn error_response(e: &Error) -> Arguments {
    [Argument::Error(e.kind().wire_code(), e.to_string())]
        .into_iter()
        .collect()
}
