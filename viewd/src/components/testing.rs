//! Fixture builders shared by the unit and scenario tests.

use crate::types::{Block, BlockHash, BlockHeader, OutPoint, ScriptHash, Tx, TxHash, TxIn, TxOut};

/// A pay-to-pubkey-hash locking script over a constant-byte hash.
pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xA9, 20];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xAC]);
    script
}

/// The script hash the p2pkh fixture script reduces to.
pub fn fixture_addr(tag: u8) -> ScriptHash {
    ScriptHash::from_hash160([tag; 20])
}

/// A coinbase transaction paying `value` to the fixture address `to_tag`.
pub fn coinbase_tx(hash_tag: u8, to_tag: u8, value: u64) -> Tx {
    Tx {
        hash: TxHash([hash_tag; 32]),
        inputs: vec![TxIn {
            prevout: OutPoint {
                txid: TxHash::default(),
                vout: u32::MAX,
            },
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: p2pkh_script(to_tag),
        }],
        tx_time: 0,
    }
}

/// A one-input transaction paying the listed fixture outputs.
pub fn spend_tx(hash_tag: u8, from: (TxHash, u32), outputs: &[(u8, u64)]) -> Tx {
    Tx {
        hash: TxHash([hash_tag; 32]),
        inputs: vec![TxIn {
            prevout: OutPoint {
                txid: from.0,
                vout: from.1,
            },
        }],
        outputs: outputs
            .iter()
            .map(|&(to_tag, value)| TxOut {
                value,
                script_pubkey: p2pkh_script(to_tag),
            })
            .collect(),
        tx_time: 0,
    }
}

/// A block whose hash is derived from its tag byte.
pub fn block(tag: u8, prev: BlockHash, txs: Vec<Tx>) -> Block {
    Block {
        header: BlockHeader {
            hash: BlockHash([tag; 32]),
            prev_hash: prev,
            timestamp: 1_500_000_000 + u32::from(tag),
        },
        txs,
    }
}

/// The shared base fixture:
///
/// - block 0 (tag 0x10): coinbase paying the miner `M` (tag 0x6D);
/// - block 1 (tag 0x11): coinbase to M, plus M's coinbase spend paying
///   `A1` (tag 0xA1) 50 BTC;
/// - block 2 (tag 0x12): coinbase to M, plus a payment of 25 BTC to `A3`
///   (tag 0xA3).
///
/// `A2` (tag 0xA2) never appears on-chain.
pub fn base_chain() -> Vec<Block> {
    let cb0 = coinbase_tx(0x01, 0x6D, 50_0000_0000);
    let cb1 = coinbase_tx(0x02, 0x6D, 50_0000_0000);
    let pay_a1 = spend_tx(0x03, (cb0.hash, 0), &[(0xA1, 50_0000_0000)]);
    let cb2 = coinbase_tx(0x04, 0x6D, 50_0000_0000);
    let pay_a3 = spend_tx(0x05, (cb1.hash, 0), &[(0xA3, 25_0000_0000), (0x6D, 25_0000_0000)]);

    let b0 = block(0x10, BlockHash::default(), vec![cb0]);
    let b1 = block(0x11, b0.header.hash, vec![cb1, pay_a1]);
    let b2 = block(0x12, b1.header.hash, vec![cb2, pay_a3]);
    vec![b0, b1, b2]
}
