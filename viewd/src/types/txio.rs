//! The fundamental indexed unit: one output and its (optional) spending
//! input, scoped to a single script hash.

use super::dbkey::{TxKey, TxioKey};
use super::tx::TxHash;

/// One output plus the input that spends it, if any.
///
/// A pair is *spent* iff it has an input side, and *unconfirmed* iff either
/// side carries the zero-conf key prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIoPair {
    out_key: TxioKey,
    in_key: Option<TxioKey>,
    value: u64,
    out_hash: TxHash,
    in_hash: Option<TxHash>,
    tx_time: u32,
    from_coinbase: bool,
    is_multisig: bool,
}

impl TxIoPair {
    /// A fresh unspent output.
    pub fn new_output(out_key: TxioKey, out_hash: TxHash, value: u64) -> Self {
        TxIoPair {
            out_key,
            in_key: None,
            value,
            out_hash,
            in_hash: None,
            tx_time: 0,
            from_coinbase: false,
            is_multisig: false,
        }
    }

    pub fn with_coinbase(mut self, from_coinbase: bool) -> Self {
        self.from_coinbase = from_coinbase;
        self
    }

    pub fn with_multisig(mut self, is_multisig: bool) -> Self {
        self.is_multisig = is_multisig;
        self
    }

    pub fn with_tx_time(mut self, tx_time: u32) -> Self {
        self.tx_time = tx_time;
        self
    }

    /// Marks the output as spent by `in_key` of the transaction `in_hash`.
    pub fn set_input(&mut self, in_key: TxioKey, in_hash: TxHash) {
        self.in_key = Some(in_key);
        self.in_hash = Some(in_hash);
    }

    /// Reverses [`set_input`](Self::set_input), restoring the unspent state.
    pub fn clear_input(&mut self) {
        self.in_key = None;
        self.in_hash = None;
    }

    pub fn out_key(&self) -> TxioKey {
        self.out_key
    }

    pub fn in_key(&self) -> Option<TxioKey> {
        self.in_key
    }

    pub fn out_tx_key(&self) -> TxKey {
        self.out_key.tx_key()
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn out_hash(&self) -> TxHash {
        self.out_hash
    }

    pub fn in_hash(&self) -> Option<TxHash> {
        self.in_hash
    }

    pub fn tx_time(&self) -> u32 {
        self.tx_time
    }

    pub fn is_spent(&self) -> bool {
        self.in_key.is_some()
    }

    pub fn from_coinbase(&self) -> bool {
        self.from_coinbase
    }

    pub fn is_multisig(&self) -> bool {
        self.is_multisig
    }

    pub fn has_zc_out(&self) -> bool {
        self.out_key.is_unconfirmed()
    }

    pub fn has_zc_in(&self) -> bool {
        self.in_key.is_some_and(|key| key.is_unconfirmed())
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.has_zc_out() || self.has_zc_in()
    }

    /// Whether the output can be used as a spendable input right now:
    /// unspent, mined, and (for coinbase outputs) matured.
    pub fn is_spendable(&self, current_height: u32, maturity: u32) -> bool {
        if self.is_spent() || self.has_zc_out() {
            return false;
        }
        match (self.from_coinbase, self.out_key.height()) {
            (true, Some(height)) => current_height.saturating_sub(height) + 1 >= maturity,
            (false, Some(_)) => true,
            (_, None) => false,
        }
    }
}
