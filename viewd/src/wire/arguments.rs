//! The typed command/argument surface.
//!
//! Every request is `{method, ids, args}` where `args` is an ordered
//! sequence of tagged values; responses have the identical shape. The
//! framing transports (FastCGI, WebSocket, raw socket) move these byte
//! strings around but never look inside them.

use crate::types::{LedgerEntry, TxHash};

use super::{Reader, WireError, Writer};

const TAG_INT: u8 = 0x01;
const TAG_BINARY: u8 = 0x02;
const TAG_BINARY_VEC: u8 = 0x03;
const TAG_LEDGERS: u8 = 0x04;
const TAG_PROGRESS: u8 = 0x05;
const TAG_ERROR: u8 = 0x06;

const FLAG_VALID: u8 = 0x01;
const FLAG_COINBASE: u8 = 0x02;
const FLAG_SENT_TO_SELF: u8 = 0x04;
const FLAG_CHANGE_BACK: u8 = 0x08;

/// Phase discriminator carried by progress notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressPhase {
    Init,
    HeaderSync,
    Scan,
    SideScan,
}

impl ProgressPhase {
    fn to_u8(self) -> u8 {
        match self {
            ProgressPhase::Init => 0,
            ProgressPhase::HeaderSync => 1,
            ProgressPhase::Scan => 2,
            ProgressPhase::SideScan => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ProgressPhase::Init),
            1 => Ok(ProgressPhase::HeaderSync),
            2 => Ok(ProgressPhase::Scan),
            3 => Ok(ProgressPhase::SideScan),
            _ => Err(WireError::Malformed("progress phase")),
        }
    }
}

/// A progress report: phase, completion fraction, elapsed seconds, and a
/// phase-specific numeric (e.g. blocks scanned).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressData {
    pub phase: ProgressPhase,
    pub progress: f64,
    pub time: u32,
    pub numeric: u32,
}

/// One typed wire value.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    Int(i64),
    Binary(Vec<u8>),
    BinaryVec(Vec<Vec<u8>>),
    Ledgers(Vec<LedgerEntry>),
    Progress(ProgressData),
    /// Error kind code plus a human-readable message.
    Error(u8, String),
}

impl Argument {
    fn serialize(&self, w: &mut Writer) {
        match self {
            Argument::Int(value) => {
                w.put_u8(TAG_INT);
                w.put_i64_be(*value);
            }
            Argument::Binary(bytes) => {
                w.put_u8(TAG_BINARY);
                w.put_var_bytes(bytes);
            }
            Argument::BinaryVec(items) => {
                w.put_u8(TAG_BINARY_VEC);
                w.put_var_int(items.len() as u64);
                for item in items {
                    w.put_var_bytes(item);
                }
            }
            Argument::Ledgers(entries) => {
                w.put_u8(TAG_LEDGERS);
                w.put_var_int(entries.len() as u64);
                for entry in entries {
                    serialize_ledger_entry(entry, w);
                }
            }
            Argument::Progress(data) => {
                w.put_u8(TAG_PROGRESS);
                w.put_u8(data.phase.to_u8());
                w.put_f64_be(data.progress);
                w.put_u32_be(data.time);
                w.put_u32_be(data.numeric);
            }
            Argument::Error(kind, message) => {
                w.put_u8(TAG_ERROR);
                w.put_u8(*kind);
                w.put_var_bytes(message.as_bytes());
            }
        }
    }

    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
        match r.get_u8()? {
            TAG_INT => Ok(Argument::Int(r.get_i64_be()?)),
            TAG_BINARY => Ok(Argument::Binary(r.get_var_bytes()?.to_vec())),
            TAG_BINARY_VEC => {
                let count = r.get_var_int()?;
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    items.push(r.get_var_bytes()?.to_vec());
                }
                Ok(Argument::BinaryVec(items))
            }
            TAG_LEDGERS => {
                let count = r.get_var_int()?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    entries.push(deserialize_ledger_entry(r)?);
                }
                Ok(Argument::Ledgers(entries))
            }
            TAG_PROGRESS => {
                let phase = ProgressPhase::from_u8(r.get_u8()?)?;
                Ok(Argument::Progress(ProgressData {
                    phase,
                    progress: r.get_f64_be()?,
                    time: r.get_u32_be()?,
                    numeric: r.get_u32_be()?,
                }))
            }
            TAG_ERROR => {
                let kind = r.get_u8()?;
                let message = String::from_utf8(r.get_var_bytes()?.to_vec())
                    .map_err(|_| WireError::Malformed("error message"))?;
                Ok(Argument::Error(kind, message))
            }
            tag => Err(WireError::BadTag(tag)),
        }
    }
}

fn serialize_ledger_entry(entry: &LedgerEntry, w: &mut Writer) {
    w.put_var_bytes(&entry.scope);
    w.put_i64_be(entry.value);
    w.put_u32_be(entry.block_num);
    w.put_bytes(&entry.tx_hash.0);
    w.put_u32_be(entry.index);
    w.put_u32_be(entry.tx_time);
    let mut flags = 0u8;
    if entry.valid {
        flags |= FLAG_VALID;
    }
    if entry.coinbase {
        flags |= FLAG_COINBASE;
    }
    if entry.sent_to_self {
        flags |= FLAG_SENT_TO_SELF;
    }
    if entry.change_back {
        flags |= FLAG_CHANGE_BACK;
    }
    w.put_u8(flags);
}

fn deserialize_ledger_entry(r: &mut Reader<'_>) -> Result<LedgerEntry, WireError> {
    let scope = r.get_var_bytes()?.to_vec();
    let value = r.get_i64_be()?;
    let block_num = r.get_u32_be()?;
    let tx_hash = TxHash(r.get_array()?);
    let index = r.get_u32_be()?;
    let tx_time = r.get_u32_be()?;
    let flags = r.get_u8()?;
    Ok(LedgerEntry {
        scope,
        value,
        block_num,
        tx_hash,
        index,
        tx_time,
        valid: flags & FLAG_VALID != 0,
        coinbase: flags & FLAG_COINBASE != 0,
        sent_to_self: flags & FLAG_SENT_TO_SELF != 0,
        change_back: flags & FLAG_CHANGE_BACK != 0,
    })
}

/// An ordered sequence of [`Argument`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new() -> Self {
        Arguments(Vec::new())
    }

    pub fn push(&mut self, arg: Argument) {
        self.0.push(arg);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Argument> {
        self.0.get(index)
    }

    pub fn get_int(&self, index: usize) -> Option<i64> {
        match self.0.get(index)? {
            Argument::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get_binary(&self, index: usize) -> Option<&[u8]> {
        match self.0.get(index)? {
            Argument::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_binary_vec(&self, index: usize) -> Option<&[Vec<u8>]> {
        match self.0.get(index)? {
            Argument::BinaryVec(items) => Some(items),
            _ => None,
        }
    }

    pub fn get_ledgers(&self, index: usize) -> Option<&[LedgerEntry]> {
        match self.0.get(index)? {
            Argument::Ledgers(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.serialize_into(&mut w);
        w.into_bytes()
    }

    pub fn serialize_into(&self, w: &mut Writer) {
        w.put_var_int(self.0.len() as u64);
        for arg in &self.0 {
            arg.serialize(w);
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let args = Self::deserialize_from(&mut r)?;
        if !r.is_empty() {
            return Err(WireError::Malformed("trailing bytes"));
        }
        Ok(args)
    }

    pub fn deserialize_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.get_var_int()?;
        let mut args = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            args.push(Argument::deserialize(r)?);
        }
        Ok(Arguments(args))
    }
}

impl FromIterator<Argument> for Arguments {
    fn from_iter<I: IntoIterator<Item = Argument>>(iter: I) -> Self {
        Arguments(iter.into_iter().collect())
    }
}

/// A framed request: method name, id path, and arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct BdvCommand {
    pub method: String,
    pub ids: Vec<String>,
    pub args: Arguments,
}

impl BdvCommand {
    pub fn new(method: impl Into<String>, ids: Vec<String>, args: Arguments) -> Self {
        BdvCommand {
            method: method.into(),
            ids,
            args,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_var_bytes(self.method.as_bytes());
        w.put_var_int(self.ids.len() as u64);
        for id in &self.ids {
            w.put_var_bytes(id.as_bytes());
        }
        self.args.serialize_into(&mut w);
        w.into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let method = String::from_utf8(r.get_var_bytes()?.to_vec())
            .map_err(|_| WireError::Malformed("method"))?;
        let id_count = r.get_var_int()?;
        let mut ids = Vec::with_capacity(id_count.min(16) as usize);
        for _ in 0..id_count {
            ids.push(
                String::from_utf8(r.get_var_bytes()?.to_vec())
                    .map_err(|_| WireError::Malformed("id"))?,
            );
        }
        let args = Arguments::deserialize_from(&mut r)?;
        if !r.is_empty() {
            return Err(WireError::Malformed("trailing bytes"));
        }
        Ok(BdvCommand { method, ids, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ledger() -> LedgerEntry {
        let mut entry = LedgerEntry::new(
            vec![0x00; 21],
            -5_0000_0000,
            1234,
            TxHash([0xAB; 32]),
            7,
            1_400_000_000,
        );
        entry.coinbase = true;
        entry.change_back = true;
        entry
    }

    #[test]
    fn every_argument_type_round_trips() {
        let args: Arguments = [
            Argument::Int(-42),
            Argument::Binary(vec![1, 2, 3]),
            Argument::BinaryVec(vec![vec![], vec![0xFF; 40]]),
            Argument::Ledgers(vec![sample_ledger()]),
            Argument::Progress(ProgressData {
                phase: ProgressPhase::SideScan,
                progress: 0.25,
                time: 11,
                numeric: 90,
            }),
            Argument::Error(3, "bad argument".into()),
        ]
        .into_iter()
        .collect();

        let bytes = args.serialize();
        assert_eq!(Arguments::deserialize(&bytes).unwrap(), args);
    }

    #[test]
    fn command_round_trips() {
        let cmd = BdvCommand::new(
            "getBalancesAndCount",
            vec!["bdv01".into(), "wallet01".into()],
            [Argument::Int(250)].into_iter().collect(),
        );
        let bytes = cmd.serialize();
        assert_eq!(BdvCommand::deserialize(&bytes).unwrap(), cmd);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        // One argument with tag 0x7F.
        assert_eq!(
            Arguments::deserialize(&[0x01, 0x7F]),
            Err(WireError::BadTag(0x7F)),
        );
    }

    #[test]
    fn ledger_entry_wire_layout_is_stable() {
        let entry = sample_ledger();
        let mut w = Writer::new();
        serialize_ledger_entry(&entry, &mut w);
        let bytes = w.into_bytes();
        // varint(21) + 21 + i64 + u32 + 32 + u32 + u32 + flags
        assert_eq!(bytes.len(), 1 + 21 + 8 + 4 + 32 + 4 + 4 + 1);
        assert_eq!(bytes[bytes.len() - 1], FLAG_VALID | FLAG_COINBASE | FLAG_CHANGE_BACK);
    }
}
