//! Composite, sort-ordered database keys.
//!
//! Confirmed transactions are addressed by a 6-byte key: a 4-byte big-endian
//! `hgtx` prefix (`height << 8 | dup`) followed by a 2-byte big-endian index
//! of the transaction within its block. TxOut/TxIn sides extend this with a
//! 2-byte big-endian io index. Unconfirmed transactions use the `0xFFFF`
//! sentinel prefix followed by a 4-byte monotonic counter, which both makes
//! "is this confirmed?" a single prefix test and sorts all zero-conf keys
//! after every real height.

/// The two-byte prefix marking an unconfirmed key.
pub const ZC_PREFIX: [u8; 2] = [0xFF, 0xFF];

/// Encodes a `(height, dup)` pair as the 4-byte big-endian `hgtx` prefix.
///
/// Heights are capped at 2^24 - 1 by the key layout.
pub fn height_to_hgtx(height: u32, dup: u8) -> [u8; 4] {
    ((height & 0x00FF_FFFF) << 8 | u32::from(dup)).to_be_bytes()
}

/// Decodes the height component of a 4-byte `hgtx` prefix.
pub fn hgtx_to_height(hgtx: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*hgtx) >> 8
}

/// A 6-byte key identifying one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxKey([u8; 6]);

impl TxKey {
    /// Key of a transaction mined at `height` (duplicate id `dup`) at
    /// position `tx_index` within its block.
    pub fn confirmed(height: u32, dup: u8, tx_index: u16) -> Self {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(&height_to_hgtx(height, dup));
        key[4..].copy_from_slice(&tx_index.to_be_bytes());
        TxKey(key)
    }

    /// Key of an unconfirmed transaction, from the container's counter.
    pub fn zero_conf(counter: u32) -> Self {
        let mut key = [0u8; 6];
        key[..2].copy_from_slice(&ZC_PREFIX);
        key[2..].copy_from_slice(&counter.to_be_bytes());
        TxKey(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(TxKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.0[..2] == ZC_PREFIX
    }

    /// The mined height, or `None` for unconfirmed keys.
    pub fn height(&self) -> Option<u32> {
        if self.is_unconfirmed() {
            None
        } else {
            let hgtx: [u8; 4] = self.0[..4].try_into().expect("4 bytes");
            Some(hgtx_to_height(&hgtx))
        }
    }

    /// The zero-conf counter, or `None` for confirmed keys.
    pub fn zc_counter(&self) -> Option<u32> {
        if self.is_unconfirmed() {
            Some(u32::from_be_bytes(self.0[2..].try_into().expect("4 bytes")))
        } else {
            None
        }
    }

    /// The in-block transaction index, for confirmed keys.
    pub fn tx_index(&self) -> Option<u16> {
        if self.is_unconfirmed() {
            None
        } else {
            Some(u16::from_be_bytes(self.0[4..].try_into().expect("2 bytes")))
        }
    }

    /// Extends this key with an io index, addressing one of the
    /// transaction's outputs or inputs.
    pub fn with_io(&self, io_index: u16) -> TxioKey {
        let mut key = [0u8; 8];
        key[..6].copy_from_slice(&self.0);
        key[6..].copy_from_slice(&io_index.to_be_bytes());
        TxioKey(key)
    }
}

/// An 8-byte key identifying one output (or one spending input) of a
/// transaction: a [`TxKey`] plus a 2-byte big-endian io index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxioKey([u8; 8]);

impl TxioKey {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(TxioKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn tx_key(&self) -> TxKey {
        TxKey(self.0[..6].try_into().expect("6 bytes"))
    }

    pub fn io_index(&self) -> u16 {
        u16::from_be_bytes(self.0[6..].try_into().expect("2 bytes"))
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.0[..2] == ZC_PREFIX
    }

    pub fn height(&self) -> Option<u32> {
        self.tx_key().height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hgtx_round_trip() {
        for height in [0u32, 1, 100, 250_000, 0x00FF_FFFF] {
            let hgtx = height_to_hgtx(height, 0);
            assert_eq!(hgtx_to_height(&hgtx), height);
        }
    }

    #[test]
    fn confirmed_keys_sort_by_height_then_index() {
        let a = TxKey::confirmed(5, 0, 0);
        let b = TxKey::confirmed(5, 0, 3);
        let c = TxKey::confirmed(6, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn zc_keys_sort_after_all_real_heights() {
        // Real heights stay far below the 0xFF0000 band the sentinel
        // occupies.
        let confirmed = TxKey::confirmed(0x00EF_FFFF, 0xFF, u16::MAX);
        let zc = TxKey::zero_conf(0);
        assert!(confirmed < zc);
        assert!(!confirmed.is_unconfirmed());
        assert!(zc.is_unconfirmed());
        assert_eq!(zc.height(), None);
        assert_eq!(zc.zc_counter(), Some(0));
    }

    #[test]
    fn txio_key_components() {
        let key = TxKey::confirmed(42, 1, 7).with_io(9);
        assert_eq!(key.tx_key(), TxKey::confirmed(42, 1, 7));
        assert_eq!(key.io_index(), 9);
        assert_eq!(key.height(), Some(42));
        assert!(!key.is_unconfirmed());
    }
}
