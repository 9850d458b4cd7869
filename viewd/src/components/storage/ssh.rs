//! Stored script-history records and their codecs.

use std::collections::BTreeMap;

use crate::types::dbkey::TxioKey;
use crate::types::{TxHash, TxIoPair};
use crate::wire::{Reader, WireError, Writer};

use super::StorageError;

/// The per-script-hash summary stored in HISTORY.
///
/// Invariant: `balance` equals the sum of unspent output values across all
/// sub-histories at heights up to `scanned_up_to`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ssh {
    /// Lazily materialized: false until the record first exists on disk.
    pub initialized: bool,
    /// Watermark: the height this history has been scanned to.
    pub scanned_up_to: u32,
    pub total_txio_count: u64,
    pub balance: u64,
}

impl Ssh {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// One sub-history: the TxIO pairs whose output landed at one height.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubSsh {
    pub txios: BTreeMap<TxioKey, TxIoPair>,
}

/// SUBSSH key: `script hash || hgtx`.
pub fn subssh_key(scr_addr: &crate::types::ScriptHash, hgtx: &[u8; 4]) -> Vec<u8> {
    let mut key = Vec::with_capacity(scr_addr.as_bytes().len() + 4);
    key.extend_from_slice(scr_addr.as_bytes());
    key.extend_from_slice(hgtx);
    key
}

/// Splits the hgtx suffix off a SUBSSH key belonging to `scr_addr`.
pub fn subssh_key_hgtx(scr_addr: &crate::types::ScriptHash, key: &[u8]) -> Option<[u8; 4]> {
    let prefix = scr_addr.as_bytes();
    if key.len() != prefix.len() + 4 || !key.starts_with(prefix) {
        return None;
    }
    key[prefix.len()..].try_into().ok()
}

pub fn encode_ssh(ssh: &Ssh) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32_le(ssh.scanned_up_to);
    w.put_u64_le(ssh.total_txio_count);
    w.put_u64_le(ssh.balance);
    w.into_bytes()
}

pub fn decode_ssh(bytes: &[u8]) -> Result<Ssh, StorageError> {
    let mut r = Reader::new(bytes);
    Ok(Ssh {
        initialized: true,
        scanned_up_to: r.get_u32_le()?,
        total_txio_count: r.get_u64_le()?,
        balance: r.get_u64_le()?,
    })
}

const TXIO_SPENT: u8 = 0x01;
const TXIO_COINBASE: u8 = 0x02;
const TXIO_MULTISIG: u8 = 0x04;

fn encode_txio(txio: &TxIoPair, w: &mut Writer) {
    w.put_bytes(txio.out_key().as_bytes());
    let mut flags = 0u8;
    if txio.is_spent() {
        flags |= TXIO_SPENT;
    }
    if txio.from_coinbase() {
        flags |= TXIO_COINBASE;
    }
    if txio.is_multisig() {
        flags |= TXIO_MULTISIG;
    }
    w.put_u8(flags);
    w.put_u64_le(txio.value());
    w.put_bytes(&txio.out_hash().0);
    w.put_u32_le(txio.tx_time());
    if let (Some(in_key), Some(in_hash)) = (txio.in_key(), txio.in_hash()) {
        w.put_bytes(in_key.as_bytes());
        w.put_bytes(&in_hash.0);
    }
}

fn decode_txio(r: &mut Reader<'_>) -> Result<TxIoPair, StorageError> {
    let out_key = TxioKey::from_bytes(r.get_bytes(8)?).ok_or(WireError::Malformed("txio key"))?;
    let flags = r.get_u8()?;
    let value = r.get_u64_le()?;
    let out_hash = TxHash(r.get_array()?);
    let tx_time = r.get_u32_le()?;
    let mut txio = TxIoPair::new_output(out_key, out_hash, value)
        .with_coinbase(flags & TXIO_COINBASE != 0)
        .with_multisig(flags & TXIO_MULTISIG != 0)
        .with_tx_time(tx_time);
    if flags & TXIO_SPENT != 0 {
        let in_key =
            TxioKey::from_bytes(r.get_bytes(8)?).ok_or(WireError::Malformed("txin key"))?;
        let in_hash = TxHash(r.get_array()?);
        txio.set_input(in_key, in_hash);
    }
    Ok(txio)
}

pub fn encode_subssh(sub: &SubSsh) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_var_int(sub.txios.len() as u64);
    for txio in sub.txios.values() {
        encode_txio(txio, &mut w);
    }
    w.into_bytes()
}

pub fn decode_subssh(bytes: &[u8]) -> Result<SubSsh, StorageError> {
    let mut r = Reader::new(bytes);
    let count = r.get_var_int()?;
    let mut txios = BTreeMap::new();
    for _ in 0..count {
        let txio = decode_txio(&mut r)?;
        txios.insert(txio.out_key(), txio);
    }
    Ok(SubSsh { txios })
}

#[cfg(test)]
mod tests {
    use crate::types::dbkey::TxKey;
    use crate::types::ScriptHash;

    use super::*;

    #[test]
    fn subssh_round_trips_spent_and_unspent() {
        let out_a = TxKey::confirmed(10, 0, 0).with_io(0);
        let out_b = TxKey::confirmed(10, 0, 2).with_io(1);
        let mut spent = TxIoPair::new_output(out_a, TxHash([1; 32]), 700).with_coinbase(true);
        spent.set_input(TxKey::confirmed(12, 0, 4).with_io(0), TxHash([2; 32]));
        let unspent = TxIoPair::new_output(out_b, TxHash([3; 32]), 900).with_tx_time(77);

        let mut sub = SubSsh::default();
        sub.txios.insert(out_a, spent);
        sub.txios.insert(out_b, unspent);

        let decoded = decode_subssh(&encode_subssh(&sub)).unwrap();
        assert_eq!(decoded, sub);
    }

    #[test]
    fn subssh_key_is_hash_plus_hgtx() {
        let sa = ScriptHash::from_hash160([5u8; 20]);
        let hgtx = crate::types::dbkey::height_to_hgtx(42, 0);
        let key = subssh_key(&sa, &hgtx);
        assert_eq!(subssh_key_hgtx(&sa, &key), Some(hgtx));
        assert_eq!(subssh_key_hgtx(&sa, &key[..key.len() - 1]), None);
    }
}
