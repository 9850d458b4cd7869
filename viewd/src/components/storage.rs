//! The durable index store.
//!
//! The actual key-value driver is an external collaborator hidden behind
//! [`KvStore`]; the in-tree [`memory::MemoryKv`] driver backs tests and the
//! default daemon configuration. [`Store`] layers the index's typed records
//! on top: script histories, per-block transaction indices, spentness, and
//! database metadata.
//!
//! Composite keys are big-endian so their byte order matches their natural
//! sort order; scalar fields inside values are little-endian.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::dbkey::{height_to_hgtx, hgtx_to_height};
use crate::types::{BlockHash, BlockHeader, ScriptHash, TxHash, TxIoPair, TxKey, TxioKey};
use crate::wire::{Reader, WireError, Writer};

pub mod memory;
pub mod ssh;

pub use memory::MemoryKv;
pub use ssh::{Ssh, SubSsh};

/// Current schema version recorded in SDBI.
pub const SCHEMA_VERSION: u32 = 1;

/// The tables of the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    /// Block headers, by hash and by `hgtx`.
    Headers,
    /// Per-block transaction indices: hash hints, tx records, txout records.
    BlkData,
    /// Per-script-hash summary records.
    History,
    /// Sub-history TxIO maps, keyed by `script hash || hgtx`.
    SubSsh,
    /// Spent-output links: txout key to the spending txin key.
    Spentness,
    /// Database-level metadata.
    Sdbi,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Headers,
        Table::BlkData,
        Table::History,
        Table::SubSsh,
        Table::Spentness,
        Table::Sdbi,
    ];

    pub fn index(self) -> usize {
        match self {
            Table::Headers => 0,
            Table::BlkData => 1,
            Table::History => 2,
            Table::SubSsh => 3,
            Table::Spentness => 4,
            Table::Sdbi => 5,
        }
    }
}

/// Errors surfaced by the storage layer.
#[derive(Debug)]
pub enum StorageError {
    /// The driver failed.
    Driver(String),
    /// A stored record did not decode.
    Corrupt(WireError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Driver(e) => write!(f, "storage driver: {e}"),
            StorageError::Corrupt(e) => write!(f, "corrupt record: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<WireError> for StorageError {
    fn from(e: WireError) -> Self {
        StorageError::Corrupt(e)
    }
}

/// A read-only view of the store, consistent for its lifetime.
pub trait ReadTx {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// A batched mutation; nothing is visible to other readers until `commit`.
pub trait WriteTx: ReadTx {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&mut self, table: Table, key: &[u8]) -> Result<(), StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// The driver seam. Drivers must allow concurrent readers; the index opens
/// write transactions only from the sync task.
pub trait KvStore: Send + Sync {
    fn read(&self) -> Result<Box<dyn ReadTx + '_>, StorageError>;

    fn write(&self) -> Result<Box<dyn WriteTx + '_>, StorageError>;
}

/// Database-level metadata: watermark of the scanned chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sdbi {
    pub schema_version: u32,
    pub top_height: u32,
    pub top_hash: BlockHash,
}

const SDBI_KEY: &[u8] = b"sdbi";

/// Per-transaction record stored in BLKDATA under the 6-byte tx key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub hash: TxHash,
    pub n_outputs: u16,
}

/// Per-txout record stored in BLKDATA under the 8-byte txout key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTxOut {
    pub scr_addr: ScriptHash,
    pub value: u64,
    pub from_coinbase: bool,
}

/// Typed access to the index tables.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Store { kv }
    }

    pub fn in_memory() -> Self {
        Store::new(Arc::new(MemoryKv::new()))
    }

    /// Opens a fresh read transaction. Query paths call this once per batch.
    pub fn reader(&self) -> Result<StoreReader<'_>, StorageError> {
        Ok(StoreReader {
            tx: self.kv.read()?,
        })
    }

    /// Opens the single write transaction of the sync task.
    pub fn writer(&self) -> Result<StoreWriter<'_>, StorageError> {
        Ok(StoreWriter {
            tx: self.kv.write()?,
        })
    }

    pub fn sdbi(&self) -> Result<Sdbi, StorageError> {
        self.reader()?.sdbi()
    }

    /// The stored SSH summary, or an uninitialized one for unseen hashes.
    pub fn ssh_summary(&self, scr_addr: &ScriptHash) -> Result<Ssh, StorageError> {
        self.reader()?.ssh_summary(scr_addr)
    }

    /// All TxIO pairs of `scr_addr` with output height in
    /// `start..=end`.
    pub fn ssh_history(
        &self,
        scr_addr: &ScriptHash,
        start: u32,
        end: u32,
    ) -> Result<BTreeMap<TxioKey, TxIoPair>, StorageError> {
        self.reader()?.ssh_history(scr_addr, start, end)
    }

    /// Per-height TxIO counts for `scr_addr`, the input to history paging.
    pub fn ssh_block_counts(
        &self,
        scr_addr: &ScriptHash,
    ) -> Result<BTreeMap<u32, u32>, StorageError> {
        self.reader()?.ssh_block_counts(scr_addr)
    }

    pub fn tx_key_for_hash(&self, hash: &TxHash) -> Result<Option<TxKey>, StorageError> {
        self.reader()?.tx_key_for_hash(hash)
    }

    pub fn stored_txout(&self, key: &TxioKey) -> Result<Option<StoredTxOut>, StorageError> {
        self.reader()?.stored_txout(key)
    }

    pub fn header_by_hash(&self, hash: &BlockHash) -> Result<Option<(u32, BlockHeader)>, StorageError> {
        self.reader()?.header_by_hash(hash)
    }

    /// All headers in height order, for rebuilding the in-memory chain.
    pub fn headers(&self) -> Result<Vec<(u32, BlockHeader)>, StorageError> {
        self.reader()?.headers()
    }
}

macro_rules! typed_reads {
    ($tx:ty) => {
        impl $tx {
            pub fn sdbi(&self) -> Result<Sdbi, StorageError> {
                match self.tx.get(Table::Sdbi, SDBI_KEY)? {
                    Some(bytes) => decode_sdbi(&bytes),
                    None => Ok(Sdbi {
                        schema_version: SCHEMA_VERSION,
                        ..Sdbi::default()
                    }),
                }
            }

            pub fn ssh_summary(&self, scr_addr: &ScriptHash) -> Result<Ssh, StorageError> {
                match self.tx.get(Table::History, scr_addr.as_bytes())? {
                    Some(bytes) => ssh::decode_ssh(&bytes),
                    None => Ok(Ssh::default()),
                }
            }

            pub fn sub_ssh(
                &self,
                scr_addr: &ScriptHash,
                hgtx: &[u8; 4],
            ) -> Result<Option<SubSsh>, StorageError> {
                let key = ssh::subssh_key(scr_addr, hgtx);
                match self.tx.get(Table::SubSsh, &key)? {
                    Some(bytes) => Ok(Some(ssh::decode_subssh(&bytes)?)),
                    None => Ok(None),
                }
            }

            pub fn ssh_history(
                &self,
                scr_addr: &ScriptHash,
                start: u32,
                end: u32,
            ) -> Result<BTreeMap<TxioKey, TxIoPair>, StorageError> {
                let mut out = BTreeMap::new();
                for (key, value) in self.tx.scan_prefix(Table::SubSsh, scr_addr.as_bytes())? {
                    let Some(hgtx) = ssh::subssh_key_hgtx(scr_addr, &key) else {
                        continue;
                    };
                    let height = hgtx_to_height(&hgtx);
                    if height < start || height > end {
                        continue;
                    }
                    let sub = ssh::decode_subssh(&value)?;
                    out.extend(sub.txios);
                }
                Ok(out)
            }

            pub fn ssh_block_counts(
                &self,
                scr_addr: &ScriptHash,
            ) -> Result<BTreeMap<u32, u32>, StorageError> {
                let mut counts = BTreeMap::new();
                for (key, value) in self.tx.scan_prefix(Table::SubSsh, scr_addr.as_bytes())? {
                    let Some(hgtx) = ssh::subssh_key_hgtx(scr_addr, &key) else {
                        continue;
                    };
                    let sub = ssh::decode_subssh(&value)?;
                    if !sub.txios.is_empty() {
                        counts.insert(hgtx_to_height(&hgtx), sub.txios.len() as u32);
                    }
                }
                Ok(counts)
            }

            pub fn tx_key_for_hash(&self, hash: &TxHash) -> Result<Option<TxKey>, StorageError> {
                match self.tx.get(Table::BlkData, &hash.0)? {
                    Some(bytes) => Ok(TxKey::from_bytes(&bytes)),
                    None => Ok(None),
                }
            }

            pub fn tx_record(&self, key: &TxKey) -> Result<Option<TxRecord>, StorageError> {
                match self.tx.get(Table::BlkData, key.as_bytes())? {
                    Some(bytes) => Ok(Some(decode_tx_record(&bytes)?)),
                    None => Ok(None),
                }
            }

            /// Every transaction record of one block, via the hgtx prefix.
            pub fn tx_records_at(
                &self,
                hgtx: &[u8; 4],
            ) -> Result<Vec<(TxKey, TxRecord)>, StorageError> {
                let mut out = Vec::new();
                for (key, value) in self.tx.scan_prefix(Table::BlkData, hgtx)? {
                    // Skip hash hints and txout records sharing the prefix.
                    if key.len() != 6 {
                        continue;
                    }
                    if let Some(tx_key) = TxKey::from_bytes(&key) {
                        out.push((tx_key, decode_tx_record(&value)?));
                    }
                }
                Ok(out)
            }

            pub fn stored_txout(&self, key: &TxioKey) -> Result<Option<StoredTxOut>, StorageError> {
                match self.tx.get(Table::BlkData, key.as_bytes())? {
                    Some(bytes) => Ok(Some(decode_stored_txout(&bytes)?)),
                    None => Ok(None),
                }
            }

            pub fn spent_by(&self, out_key: &TxioKey) -> Result<Option<TxioKey>, StorageError> {
                match self.tx.get(Table::Spentness, out_key.as_bytes())? {
                    Some(bytes) => Ok(TxioKey::from_bytes(&bytes)),
                    None => Ok(None),
                }
            }

            pub fn spentness(&self) -> Result<Vec<(TxioKey, TxioKey)>, StorageError> {
                let mut out = Vec::new();
                for (key, value) in self.tx.scan_prefix(Table::Spentness, &[])? {
                    if let (Some(out_key), Some(in_key)) =
                        (TxioKey::from_bytes(&key), TxioKey::from_bytes(&value))
                    {
                        out.push((out_key, in_key));
                    }
                }
                Ok(out)
            }

            pub fn header_by_hash(
                &self,
                hash: &BlockHash,
            ) -> Result<Option<(u32, BlockHeader)>, StorageError> {
                match self.tx.get(Table::Headers, &hash.0)? {
                    Some(bytes) => {
                        let (height, header) = decode_header(&bytes)?;
                        Ok(Some((height, header)))
                    }
                    None => Ok(None),
                }
            }

            pub fn header_by_height(
                &self,
                height: u32,
            ) -> Result<Option<BlockHeader>, StorageError> {
                let hgtx = height_to_hgtx(height, 0);
                match self.tx.get(Table::Headers, &hgtx)? {
                    Some(bytes) => {
                        let hash = BlockHash(
                            bytes
                                .as_slice()
                                .try_into()
                                .map_err(|_| WireError::Malformed("header hash"))?,
                        );
                        Ok(self.header_by_hash(&hash)?.map(|(_, header)| header))
                    }
                    None => Ok(None),
                }
            }

            pub fn headers(&self) -> Result<Vec<(u32, BlockHeader)>, StorageError> {
                let mut out = Vec::new();
                for (key, value) in self.tx.scan_prefix(Table::Headers, &[])? {
                    // Hash-keyed rows carry the full record.
                    if key.len() == 32 {
                        let (height, header) = decode_header(&value)?;
                        out.push((height, header));
                    }
                }
                out.sort_by_key(|(height, _)| *height);
                Ok(out)
            }
        }
    };
}

/// A typed read transaction.
pub struct StoreReader<'a> {
    tx: Box<dyn ReadTx + 'a>,
}

/// The typed write transaction of the sync task. Reads observe the pending
/// writes of the same transaction.
pub struct StoreWriter<'a> {
    tx: Box<dyn WriteTx + 'a>,
}

typed_reads!(StoreReader<'_>);
typed_reads!(StoreWriter<'_>);

impl StoreWriter<'_> {
    pub fn put_sdbi(&mut self, sdbi: &Sdbi) -> Result<(), StorageError> {
        self.tx.put(Table::Sdbi, SDBI_KEY, &encode_sdbi(sdbi))
    }

    pub fn put_ssh(&mut self, scr_addr: &ScriptHash, ssh: &Ssh) -> Result<(), StorageError> {
        self.tx
            .put(Table::History, scr_addr.as_bytes(), &ssh::encode_ssh(ssh))
    }

    pub fn put_sub_ssh(
        &mut self,
        scr_addr: &ScriptHash,
        hgtx: &[u8; 4],
        sub: &SubSsh,
    ) -> Result<(), StorageError> {
        let key = ssh::subssh_key(scr_addr, hgtx);
        if sub.txios.is_empty() {
            self.tx.delete(Table::SubSsh, &key)
        } else {
            self.tx.put(Table::SubSsh, &key, &ssh::encode_subssh(sub))
        }
    }

    pub fn put_header(&mut self, height: u32, header: &BlockHeader) -> Result<(), StorageError> {
        let hgtx = height_to_hgtx(height, 0);
        self.tx
            .put(Table::Headers, &header.hash.0, &encode_header(height, header))?;
        self.tx.put(Table::Headers, &hgtx, &header.hash.0)
    }

    pub fn delete_header(&mut self, height: u32, hash: &BlockHash) -> Result<(), StorageError> {
        self.tx.delete(Table::Headers, &hash.0)?;
        self.tx.delete(Table::Headers, &height_to_hgtx(height, 0))
    }

    pub fn put_tx_hint(&mut self, hash: &TxHash, key: &TxKey) -> Result<(), StorageError> {
        self.tx.put(Table::BlkData, &hash.0, key.as_bytes())
    }

    pub fn delete_tx_hint(&mut self, hash: &TxHash) -> Result<(), StorageError> {
        self.tx.delete(Table::BlkData, &hash.0)
    }

    pub fn put_tx_record(&mut self, key: &TxKey, record: &TxRecord) -> Result<(), StorageError> {
        self.tx
            .put(Table::BlkData, key.as_bytes(), &encode_tx_record(record))
    }

    pub fn delete_tx_record(&mut self, key: &TxKey) -> Result<(), StorageError> {
        self.tx.delete(Table::BlkData, key.as_bytes())
    }

    pub fn put_stored_txout(
        &mut self,
        key: &TxioKey,
        stxo: &StoredTxOut,
    ) -> Result<(), StorageError> {
        self.tx
            .put(Table::BlkData, key.as_bytes(), &encode_stored_txout(stxo))
    }

    pub fn delete_stored_txout(&mut self, key: &TxioKey) -> Result<(), StorageError> {
        self.tx.delete(Table::BlkData, key.as_bytes())
    }

    pub fn put_spentness(
        &mut self,
        out_key: &TxioKey,
        in_key: &TxioKey,
    ) -> Result<(), StorageError> {
        self.tx
            .put(Table::Spentness, out_key.as_bytes(), in_key.as_bytes())
    }

    pub fn delete_spentness(&mut self, out_key: &TxioKey) -> Result<(), StorageError> {
        self.tx.delete(Table::Spentness, out_key.as_bytes())
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.commit()
    }
}

fn encode_sdbi(sdbi: &Sdbi) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32_le(sdbi.schema_version);
    w.put_u32_le(sdbi.top_height);
    w.put_bytes(&sdbi.top_hash.0);
    w.into_bytes()
}

fn decode_sdbi(bytes: &[u8]) -> Result<Sdbi, StorageError> {
    let mut r = Reader::new(bytes);
    Ok(Sdbi {
        schema_version: r.get_u32_le()?,
        top_height: r.get_u32_le()?,
        top_hash: BlockHash(r.get_array()?),
    })
}

fn encode_header(height: u32, header: &BlockHeader) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32_le(height);
    w.put_bytes(&header.hash.0);
    w.put_bytes(&header.prev_hash.0);
    w.put_u32_le(header.timestamp);
    w.into_bytes()
}

fn decode_header(bytes: &[u8]) -> Result<(u32, BlockHeader), StorageError> {
    let mut r = Reader::new(bytes);
    let height = r.get_u32_le()?;
    let header = BlockHeader {
        hash: BlockHash(r.get_array()?),
        prev_hash: BlockHash(r.get_array()?),
        timestamp: r.get_u32_le()?,
    };
    Ok((height, header))
}

fn encode_tx_record(record: &TxRecord) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_bytes(&record.hash.0);
    w.put_bytes(&record.n_outputs.to_le_bytes());
    w.into_bytes()
}

fn decode_tx_record(bytes: &[u8]) -> Result<TxRecord, StorageError> {
    let mut r = Reader::new(bytes);
    let hash = TxHash(r.get_array()?);
    let n_outputs = u16::from_le_bytes(r.get_array()?);
    Ok(TxRecord { hash, n_outputs })
}

fn encode_stored_txout(stxo: &StoredTxOut) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u64_le(stxo.value);
    w.put_u8(u8::from(stxo.from_coinbase));
    w.put_var_bytes(stxo.scr_addr.as_bytes());
    w.into_bytes()
}

fn decode_stored_txout(bytes: &[u8]) -> Result<StoredTxOut, StorageError> {
    let mut r = Reader::new(bytes);
    let value = r.get_u64_le()?;
    let from_coinbase = r.get_u8()? != 0;
    let scr_addr = ScriptHash::from_bytes(r.get_var_bytes()?.to_vec());
    Ok(StoredTxOut {
        scr_addr,
        value,
        from_coinbase,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdbi_defaults_when_absent() {
        let store = Store::in_memory();
        let sdbi = store.sdbi().unwrap();
        assert_eq!(sdbi.schema_version, SCHEMA_VERSION);
        assert_eq!(sdbi.top_height, 0);
    }

    #[test]
    fn unseen_script_hash_yields_uninitialized_ssh() {
        let store = Store::in_memory();
        let sa = ScriptHash::from_hash160([9u8; 20]);
        let ssh = store.ssh_summary(&sa).unwrap();
        assert!(!ssh.is_initialized());
        assert_eq!(ssh.balance, 0);
    }

    #[test]
    fn records_round_trip() {
        let store = Store::in_memory();
        let sa = ScriptHash::from_hash160([1u8; 20]);
        let tx_key = TxKey::confirmed(3, 0, 1);
        let out_key = tx_key.with_io(0);
        let hash = TxHash([4u8; 32]);

        {
            let mut w = store.writer().unwrap();
            w.put_tx_hint(&hash, &tx_key).unwrap();
            w.put_tx_record(&tx_key, &TxRecord { hash, n_outputs: 2 }).unwrap();
            w.put_stored_txout(
                &out_key,
                &StoredTxOut {
                    scr_addr: sa.clone(),
                    value: 5000,
                    from_coinbase: true,
                },
            )
            .unwrap();
            w.commit().unwrap();
        }

        assert_eq!(store.tx_key_for_hash(&hash).unwrap(), Some(tx_key));
        let stxo = store.stored_txout(&out_key).unwrap().unwrap();
        assert_eq!(stxo.value, 5000);
        assert!(stxo.from_coinbase);
        assert_eq!(stxo.scr_addr, sa);
    }

    #[test]
    fn writer_reads_see_pending_writes() {
        let store = Store::in_memory();
        let hash = TxHash([7u8; 32]);
        let tx_key = TxKey::confirmed(1, 0, 0);

        let mut w = store.writer().unwrap();
        w.put_tx_hint(&hash, &tx_key).unwrap();
        assert_eq!(w.tx_key_for_hash(&hash).unwrap(), Some(tx_key));

        // Not visible outside until commit.
        assert_eq!(store.tx_key_for_hash(&hash).unwrap(), None);
        w.commit().unwrap();
        assert_eq!(store.tx_key_for_hash(&hash).unwrap(), Some(tx_key));
    }
}
