//! Parsed-chain model types.
//!
//! The raw block-file parser and the p2p client are external collaborators;
//! they hand the index already-parsed blocks and transactions in this form.

use std::fmt;

/// A transaction hash (double-SHA256 of the raw transaction).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A block hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The subset of a block header the index records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: BlockHash,
    /// Hash of this block's parent. All-zero for the genesis block.
    pub prev_hash: BlockHash,
    pub timestamp: u32,
}

/// A parsed block: header plus its transactions in block order.
#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

/// A reference to a transaction output being spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: TxHash,
    pub vout: u32,
}

impl OutPoint {
    /// Whether this is the null outpoint of a coinbase input.
    pub fn is_null(&self) -> bool {
        self.txid.is_null() && self.vout == u32::MAX
    }
}

/// One transaction input. Script and witness data are irrelevant to the
/// index and are not carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
}

/// One transaction output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A parsed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tx {
    pub hash: TxHash,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Local receive time for mempool transactions; zero for mined ones
    /// (their time comes from the containing block header).
    pub tx_time: u32,
}

impl Tx {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Serializes the parsed form for the query surface. This is not the
    /// consensus encoding; clients get back what the parser handed us.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = crate::wire::Writer::new();
        w.put_bytes(&self.hash.0);
        w.put_var_int(self.inputs.len() as u64);
        for input in &self.inputs {
            w.put_bytes(&input.prevout.txid.0);
            w.put_u32_be(input.prevout.vout);
        }
        w.put_var_int(self.outputs.len() as u64);
        for output in &self.outputs {
            w.put_u64_be(output.value);
            w.put_var_bytes(&output.script_pubkey);
        }
        w.put_u32_be(self.tx_time);
        w.into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, crate::wire::WireError> {
        let mut r = crate::wire::Reader::new(bytes);
        let hash = TxHash(r.get_array()?);
        let n_inputs = r.get_var_int()?;
        let mut inputs = Vec::with_capacity(n_inputs.min(1024) as usize);
        for _ in 0..n_inputs {
            inputs.push(TxIn {
                prevout: OutPoint {
                    txid: TxHash(r.get_array()?),
                    vout: r.get_u32_be()?,
                },
            });
        }
        let n_outputs = r.get_var_int()?;
        let mut outputs = Vec::with_capacity(n_outputs.min(1024) as usize);
        for _ in 0..n_outputs {
            outputs.push(TxOut {
                value: r.get_u64_be()?,
                script_pubkey: r.get_var_bytes()?.to_vec(),
            });
        }
        let tx_time = r.get_u32_be()?;
        Ok(Tx {
            hash,
            inputs,
            outputs,
            tx_time,
        })
    }
}
