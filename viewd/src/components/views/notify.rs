//! Notification plumbing for one client view.
//!
//! Each view owns a bounded FIFO of [`BdvAction`]s drained by its
//! maintenance task, and a [`Callback`] through which processed events
//! reach the client's transport. The callback is an injected seam: each
//! framing transport implements it; [`QueuedCallback`] is the in-process
//! long-polling implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{Error, ErrorKind};
use crate::types::dbkey::TxioKey;
use crate::types::{LedgerEntry, ScriptHash};
use crate::wire::{Argument, Arguments, ProgressData};

use super::super::zeroconf::TxioByAddr;

/// Capacity of a view's notification queue.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 64;

/// Maximum concurrent long-poll waiters per view.
pub const MAX_CALLBACK_WAITERS: u32 = 2;

/// One unit of work for a view's maintenance task.
#[derive(Clone, Debug)]
pub enum BdvAction {
    NewBlock {
        height: u32,
        /// Fork height when this tip arrived through a reorg.
        reorged_from: Option<u32>,
    },
    /// Re-read state for the named wallets (side-scan merge, late
    /// registration).
    Refresh {
        wallet_ids: Vec<String>,
    },
    /// New mempool TxIOs, as published by the container.
    ZeroConf {
        txio: Arc<TxioByAddr>,
    },
    /// Mempool entries invalidated by a block.
    ZcPurge {
        invalidated: Arc<std::collections::HashMap<ScriptHash, Vec<TxioKey>>>,
    },
    Progress(ProgressData),
    Ready {
        height: u32,
    },
    Terminate,
}

/// An event ready for delivery to the client.
#[derive(Clone, Debug)]
pub enum CallbackEvent {
    NewBlock { height: u32 },
    Refresh { wallet_ids: Vec<String> },
    ZeroConf { ledgers: Vec<LedgerEntry> },
    Progress(ProgressData),
    Ready { height: u32 },
    Terminate,
}

impl CallbackEvent {
    /// The event's name on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            CallbackEvent::NewBlock { .. } => "NewBlock",
            CallbackEvent::Refresh { .. } => "BDV_Refresh",
            CallbackEvent::ZeroConf { .. } => "BDV_ZC",
            CallbackEvent::Progress(_) => "BDV_Progress",
            CallbackEvent::Ready { .. } => "BDM_Ready",
            CallbackEvent::Terminate => "Terminate",
        }
    }

    /// Appends the event to a response: a name argument followed by the
    /// payload.
    pub fn append_to(&self, args: &mut Arguments) {
        args.push(Argument::Binary(self.kind().as_bytes().to_vec()));
        match self {
            CallbackEvent::NewBlock { height } | CallbackEvent::Ready { height } => {
                args.push(Argument::Int(i64::from(*height)));
            }
            CallbackEvent::Refresh { wallet_ids } => {
                args.push(Argument::BinaryVec(
                    wallet_ids.iter().map(|id| id.as_bytes().to_vec()).collect(),
                ));
            }
            CallbackEvent::ZeroConf { ledgers } => {
                args.push(Argument::Ledgers(ledgers.clone()));
            }
            CallbackEvent::Progress(data) => {
                args.push(Argument::Progress(*data));
            }
            CallbackEvent::Terminate => {}
        }
    }
}

/// The transport seam: emit queues an event, respond drains them.
#[async_trait]
pub trait Callback: Send + Sync {
    fn emit(&self, event: CallbackEvent);

    /// Blocks until at least one event is queued, then drains everything.
    async fn respond(&self) -> Result<Vec<CallbackEvent>, Error>;

    /// Unblocks pending waiters with a terminate event.
    fn shutdown(&self);
}

/// In-process long-polling callback.
#[derive(Default)]
pub struct QueuedCallback {
    queue: Mutex<VecDeque<CallbackEvent>>,
    available: Notify,
    waiters: AtomicU32,
    closed: AtomicBool,
}

impl QueuedCallback {
    pub fn new() -> Self {
        QueuedCallback::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("not poisoned").len()
    }
}

#[async_trait]
impl Callback for QueuedCallback {
    fn emit(&self, event: CallbackEvent) {
        self.queue.lock().expect("not poisoned").push_back(event);
        self.available.notify_waiters();
    }

    async fn respond(&self) -> Result<Vec<CallbackEvent>, Error> {
        // Bounded at MAX_CALLBACK_WAITERS concurrent waiters; extras are
        // advised to retry.
        if self.waiters.fetch_add(1, Ordering::AcqRel) >= MAX_CALLBACK_WAITERS {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(ErrorKind::Busy.into());
        }
        let result = loop {
            if self.closed.load(Ordering::Acquire) {
                break vec![CallbackEvent::Terminate];
            }
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock().expect("not poisoned");
                if !queue.is_empty() {
                    break queue.drain(..).collect();
                }
            }
            notified.await;
        };
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        Ok(result)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_drains_everything_queued() {
        let cb = Arc::new(QueuedCallback::new());
        cb.emit(CallbackEvent::NewBlock { height: 7 });
        cb.emit(CallbackEvent::Refresh {
            wallet_ids: vec!["w1".into()],
        });
        let events = cb.respond().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(cb.pending(), 0);
    }

    #[tokio::test]
    async fn respond_blocks_until_an_event_arrives() {
        let cb = Arc::new(QueuedCallback::new());
        let waiter = {
            let cb = cb.clone();
            tokio::spawn(async move { cb.respond().await })
        };
        tokio::task::yield_now().await;
        cb.emit(CallbackEvent::Ready { height: 3 });
        let events = waiter.await.unwrap().unwrap();
        assert!(matches!(events[0], CallbackEvent::Ready { height: 3 }));
    }

    #[tokio::test]
    async fn third_concurrent_waiter_is_rejected() {
        let cb = Arc::new(QueuedCallback::new());
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let cb = cb.clone();
            waiters.push(tokio::spawn(async move { cb.respond().await }));
        }
        // Let both long-polls park.
        tokio::task::yield_now().await;

        let err = cb.respond().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        cb.shutdown();
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }

    #[test]
    fn events_serialize_with_their_names() {
        let mut args = Arguments::new();
        CallbackEvent::NewBlock { height: 12 }.append_to(&mut args);
        assert_eq!(args.get_binary(0), Some("NewBlock".as_bytes()));
        assert_eq!(args.get_int(1), Some(12));
    }
}
