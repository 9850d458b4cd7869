//! Script-hash derivation.
//!
//! A `ScriptHash` is the canonical key for a payment target: a prefix byte
//! followed by a hash of the locking script's essential content. Pay-to-pubkey
//! and pay-to-pubkey-hash reduce to the same form, so an address registered
//! once matches both encodings.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use std::fmt;

/// Prefix for hash160-form targets (P2PKH and P2PK).
pub const PREFIX_HASH160: u8 = 0x00;
/// Prefix for pay-to-script-hash targets.
pub const PREFIX_P2SH: u8 = 0x05;
/// Prefix for bare multisig targets.
pub const PREFIX_MULTISIG: u8 = 0xFE;
/// Prefix for scripts the classifier does not recognize.
pub const PREFIX_NONSTANDARD: u8 = 0xFF;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xA9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xAC;
const OP_CHECKMULTISIG: u8 = 0xAE;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// The shape of a locking script, as far as the index cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptClass {
    PubKeyHash,
    PubKey,
    ScriptHash,
    Multisig,
    NonStandard,
}

/// Canonical key for a payment target: prefix byte + script hash.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptHash(Vec<u8>);

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

impl ScriptHash {
    /// Builds the hash160-form key for a raw 20-byte hash.
    pub fn from_hash160(hash: [u8; 20]) -> Self {
        let mut bytes = Vec::with_capacity(21);
        bytes.push(PREFIX_HASH160);
        bytes.extend_from_slice(&hash);
        ScriptHash(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ScriptHash(bytes)
    }

    /// Classifies `script_pubkey` and derives the canonical key for it.
    pub fn from_script(script_pubkey: &[u8]) -> Self {
        match classify(script_pubkey) {
            ScriptClass::PubKeyHash => {
                let mut bytes = vec![PREFIX_HASH160];
                bytes.extend_from_slice(&script_pubkey[3..23]);
                ScriptHash(bytes)
            }
            ScriptClass::PubKey => {
                let key_len = script_pubkey[0] as usize;
                Self::from_hash160(hash160(&script_pubkey[1..1 + key_len]))
            }
            ScriptClass::ScriptHash => {
                let mut bytes = vec![PREFIX_P2SH];
                bytes.extend_from_slice(&script_pubkey[2..22]);
                ScriptHash(bytes)
            }
            ScriptClass::Multisig => {
                let (m, pubkeys) = multisig_parts(script_pubkey).expect("classified");
                let mut bytes = vec![PREFIX_MULTISIG, m, pubkeys.len() as u8];
                for key in &pubkeys {
                    bytes.extend_from_slice(&hash160(key));
                }
                ScriptHash(bytes)
            }
            ScriptClass::NonStandard => {
                let mut bytes = vec![PREFIX_NONSTANDARD];
                bytes.extend_from_slice(&Sha256::digest(script_pubkey));
                ScriptHash(bytes)
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn is_multisig(&self) -> bool {
        self.prefix() == PREFIX_MULTISIG
    }

    /// For a multisig key, the `(m, n)` threshold and the hash160-form keys
    /// of the embedded pubkeys.
    pub fn multisig_members(&self) -> Option<(u8, u8, Vec<ScriptHash>)> {
        if !self.is_multisig() || self.0.len() < 3 {
            return None;
        }
        let m = self.0[1];
        let n = self.0[2];
        let hashes = &self.0[3..];
        if hashes.len() != usize::from(n) * 20 {
            return None;
        }
        let members = hashes
            .chunks_exact(20)
            .map(|chunk| ScriptHash::from_hash160(chunk.try_into().expect("20 bytes")))
            .collect();
        Some((m, n, members))
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Classifies a locking script.
pub fn classify(script: &[u8]) -> ScriptClass {
    match script {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        [OP_DUP, OP_HASH160, 20, .., OP_EQUALVERIFY, OP_CHECKSIG] if script.len() == 25 => {
            ScriptClass::PubKeyHash
        }
        // <33|65 byte pubkey> OP_CHECKSIG
        [33, .., OP_CHECKSIG] if script.len() == 35 => ScriptClass::PubKey,
        [65, .., OP_CHECKSIG] if script.len() == 67 => ScriptClass::PubKey,
        // OP_HASH160 <20> OP_EQUAL
        [OP_HASH160, 20, .., OP_EQUAL] if script.len() == 23 => ScriptClass::ScriptHash,
        _ if multisig_parts(script).is_some() => ScriptClass::Multisig,
        _ => ScriptClass::NonStandard,
    }
}

/// Parses `OP_m <pubkey>* OP_n OP_CHECKMULTISIG`, returning the threshold
/// and the raw pubkeys.
fn multisig_parts(script: &[u8]) -> Option<(u8, Vec<&[u8]>)> {
    let (&last, rest) = script.split_last()?;
    if last != OP_CHECKMULTISIG {
        return None;
    }
    let (&op_n, mut rest) = rest.split_last()?;
    if !(OP_1..=OP_16).contains(&op_n) {
        return None;
    }
    let n = op_n - OP_1 + 1;
    let op_m = *rest.first()?;
    if !(OP_1..=op_n).contains(&op_m) {
        return None;
    }
    let m = op_m - OP_1 + 1;
    rest = &rest[1..];
    let mut pubkeys = Vec::with_capacity(usize::from(n));
    while !rest.is_empty() {
        let len = usize::from(rest[0]);
        if !(len == 33 || len == 65) || rest.len() < 1 + len {
            return None;
        }
        pubkeys.push(&rest[1..1 + len]);
        rest = &rest[1 + len..];
    }
    if pubkeys.len() != usize::from(n) {
        return None;
    }
    Some((m, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 20];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    fn p2pk(pubkey: &[u8]) -> Vec<u8> {
        let mut script = vec![pubkey.len() as u8];
        script.extend_from_slice(pubkey);
        script.push(OP_CHECKSIG);
        script
    }

    #[test]
    fn p2pk_and_p2pkh_reduce_to_same_key() {
        let pubkey = [0x02u8; 33];
        let hash = hash160(&pubkey);
        assert_eq!(
            ScriptHash::from_script(&p2pk(&pubkey)),
            ScriptHash::from_script(&p2pkh(hash)),
        );
    }

    #[test]
    fn p2sh_keeps_the_embedded_hash() {
        let mut script = vec![OP_HASH160, 20];
        script.extend_from_slice(&[7u8; 20]);
        script.push(OP_EQUAL);
        let sa = ScriptHash::from_script(&script);
        assert_eq!(sa.prefix(), PREFIX_P2SH);
        assert_eq!(&sa.as_bytes()[1..], &[7u8; 20]);
    }

    #[test]
    fn multisig_members_round_trip() {
        let key_a = [0x02u8; 33];
        let key_b = [0x03u8; 33];
        let mut script = vec![OP_1];
        for key in [&key_a, &key_b] {
            script.push(33);
            script.extend_from_slice(key.as_slice());
        }
        script.extend_from_slice(&[OP_1 + 1, OP_CHECKMULTISIG]);

        let sa = ScriptHash::from_script(&script);
        assert!(sa.is_multisig());
        let (m, n, members) = sa.multisig_members().unwrap();
        assert_eq!((m, n), (1, 2));
        assert_eq!(members[0], ScriptHash::from_hash160(hash160(&key_a)));
        assert_eq!(members[1], ScriptHash::from_hash160(hash160(&key_b)));
    }

    #[test]
    fn garbage_is_nonstandard() {
        let sa = ScriptHash::from_script(&[0x6a, 0x04, 1, 2, 3, 4]);
        assert_eq!(sa.prefix(), PREFIX_NONSTANDARD);
        assert_eq!(sa.as_bytes().len(), 33);
    }
}
