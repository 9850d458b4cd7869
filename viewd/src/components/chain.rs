//! The seam to the raw-block backend, and the in-memory header chain.
//!
//! Parsing block files and talking to the p2p network are external
//! collaborators; the index consumes them through [`BlockSource`]. The
//! [`MemorySource`] implementation backs tests and standalone runs, fed
//! programmatically.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::types::{Block, BlockHash, BlockHeader, Tx};

/// Position of a transaction inside the raw block data, as recorded in
/// BLKDATA. Raw bytes are re-read through the source rather than stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxCursor {
    pub height: u32,
    pub tx_index: u16,
}

/// Errors surfaced by a block source.
#[derive(Debug)]
pub enum SourceError {
    /// The backend shut down; the sync task treats this as terminate.
    Closed,
    Backend(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Closed => write!(f, "block source closed"),
            SourceError::Backend(e) => write!(f, "block source: {e}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Supplier of parsed blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// The current best-chain tip height, or `None` for an empty chain.
    async fn tip_height(&self) -> Result<Option<u32>, SourceError>;

    /// Waits until the best chain reaches `height`, then returns that
    /// block. The returned block's parent hash is the caller's reorg
    /// signal.
    async fn next_block(&self, height: u32) -> Result<Block, SourceError>;

    /// Reads a block already on the best chain. Used by rescans and reorg
    /// recovery; does not wait.
    async fn read_block(&self, height: u32) -> Result<Option<Block>, SourceError>;

    /// Re-reads one transaction through its stored cursor.
    async fn read_tx(&self, cursor: TxCursor) -> Result<Option<Tx>, SourceError>;
}

/// A programmatically-fed [`BlockSource`].
#[derive(Default)]
pub struct MemorySource {
    chain: Mutex<Vec<Block>>,
    changed: Notify,
}

impl MemorySource {
    pub fn new() -> Self {
        MemorySource::default()
    }

    /// Appends a block to the best chain.
    pub fn push_block(&self, block: Block) {
        self.chain.lock().expect("not poisoned").push(block);
        self.changed.notify_waiters();
    }

    /// Replaces the chain from `height` upward with `blocks`, simulating a
    /// reorg.
    pub fn replace_from(&self, height: u32, blocks: Vec<Block>) {
        let mut chain = self.chain.lock().expect("not poisoned");
        chain.truncate(height as usize);
        chain.extend(blocks);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    async fn tip_height(&self) -> Result<Option<u32>, SourceError> {
        let chain = self.chain.lock().expect("not poisoned");
        Ok(chain.len().checked_sub(1).map(|tip| tip as u32))
    }

    async fn next_block(&self, height: u32) -> Result<Block, SourceError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register for wakeups before the re-check, so a push between
            // the check and the await is not missed.
            notified.as_mut().enable();
            if let Some(block) = self
                .chain
                .lock()
                .expect("not poisoned")
                .get(height as usize)
            {
                return Ok(block.clone());
            }
            notified.await;
        }
    }

    async fn read_block(&self, height: u32) -> Result<Option<Block>, SourceError> {
        let chain = self.chain.lock().expect("not poisoned");
        Ok(chain.get(height as usize).cloned())
    }

    async fn read_tx(&self, cursor: TxCursor) -> Result<Option<Tx>, SourceError> {
        let chain = self.chain.lock().expect("not poisoned");
        Ok(chain
            .get(cursor.height as usize)
            .and_then(|block| block.txs.get(usize::from(cursor.tx_index)))
            .cloned())
    }
}

/// The in-memory view of the HEADERS table, kept current by the sync task
/// and read by views (`hasHeaderWithHash`, ledger timestamps).
#[derive(Debug, Default)]
pub struct HeaderChain {
    by_height: Vec<BlockHeader>,
    by_hash: HashMap<BlockHash, u32>,
}

impl HeaderChain {
    pub fn new() -> Self {
        HeaderChain::default()
    }

    /// Appends the header of the block at the next height.
    ///
    /// Panics if `height` is not the next height; the sync task feeds
    /// headers strictly in order.
    pub fn push(&mut self, height: u32, header: BlockHeader) {
        assert_eq!(height as usize, self.by_height.len(), "non-contiguous header");
        self.by_hash.insert(header.hash, height);
        self.by_height.push(header);
    }

    /// Drops all headers above `height`.
    pub fn unwind_to(&mut self, height: u32) {
        while self.by_height.len() > (height as usize) + 1 {
            let header = self.by_height.pop().expect("non-empty");
            self.by_hash.remove(&header.hash);
        }
    }

    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.by_height.get(height as usize)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn tip(&self) -> Option<(u32, &BlockHeader)> {
        let header = self.by_height.last()?;
        Some((self.by_height.len() as u32 - 1, header))
    }

    pub fn timestamp_at(&self, height: u32) -> Option<u32> {
        self.header_at(height).map(|header| header.timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }
}

/// Shared handle to the header chain.
pub type SharedHeaders = Arc<RwLock<HeaderChain>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: u8, prev: u8) -> BlockHeader {
        BlockHeader {
            hash: BlockHash([tag; 32]),
            prev_hash: BlockHash([prev; 32]),
            timestamp: 1000 + u32::from(tag),
        }
    }

    #[test]
    fn push_and_unwind() {
        let mut chain = HeaderChain::new();
        chain.push(0, header(1, 0));
        chain.push(1, header(2, 1));
        chain.push(2, header(3, 2));
        assert_eq!(chain.tip().unwrap().0, 2);
        assert_eq!(chain.height_of(&BlockHash([3; 32])), Some(2));

        chain.unwind_to(0);
        assert_eq!(chain.tip().unwrap().0, 0);
        assert!(!chain.contains(&BlockHash([2; 32])));
        assert!(chain.contains(&BlockHash([1; 32])));
    }

    #[tokio::test]
    async fn memory_source_waits_for_pushes() {
        let source = Arc::new(MemorySource::new());
        assert_eq!(source.tip_height().await.unwrap(), None);

        let waiter = {
            let source = source.clone();
            tokio::spawn(async move { source.next_block(0).await })
        };
        let block = Block {
            header: header(9, 0),
            txs: Vec::new(),
        };
        source.push_block(block.clone());
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.header, block.header);
    }
}
