//! Core data model for the chain index.

pub mod dbkey;
pub mod ledger;
pub mod script_hash;
pub mod tx;
pub mod txio;

pub use dbkey::{TxKey, TxioKey};
pub use ledger::LedgerEntry;
pub use script_hash::ScriptHash;
pub use tx::{Block, BlockHash, BlockHeader, OutPoint, Tx, TxHash, TxIn, TxOut};
pub use txio::TxIoPair;
