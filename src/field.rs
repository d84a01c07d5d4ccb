//! Instruction fields: typed values with a reconstructable byte footprint
//! and a per-byte signature used for self-modifying-code detection.

use core::fmt;

use crate::dtype::DataType;
use crate::mem::MemoryPort;

/// One decoded field of an instruction: a typed value plus the exact bytes
/// it was parsed from.
///
/// The `signature` records, per byte, whether that byte discriminates the
/// instruction (`Some(b)`) or is a payload whose change does not alter
/// semantics (`None`), e.g. an immediate's data bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrField {
    address: u32,
    index: u8,
    ty: DataType,
    value: u64,
    bytes: Vec<u8>,
    signature: Vec<Option<u8>>,
    is_final: bool,
}

impl InstrField {
    /// A structural field: every byte participates in the signature, and
    /// the field is final from the start (opcodes, prefixes, ModR/M, SIB).
    pub fn structural(address: u32, index: u8, ty: DataType, bytes: Vec<u8>) -> Self {
        let value = le_value(&bytes);
        let signature = bytes.iter().map(|b| Some(*b)).collect();
        Self {
            address,
            index,
            ty,
            value: ty.normalize(value),
            bytes,
            signature,
            is_final: true,
        }
    }

    /// A value field: its bytes are payload (wildcards in the signature)
    /// and it starts out non-final, re-reading memory at execution time
    /// until the store finalizes it (immediates, displacements).
    pub fn value_field(address: u32, index: u8, ty: DataType, bytes: Vec<u8>) -> Self {
        let value = le_value(&bytes);
        let signature = vec![None; bytes.len()];
        Self {
            address,
            index,
            ty,
            value: ty.normalize(value),
            bytes,
            signature,
            is_final: false,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn len(&self) -> u8 {
        self.bytes.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Position of this field within its instruction.
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn data_type(&self) -> DataType {
        self.ty
    }

    /// The value observed at parse time, normalized to the field's type.
    pub fn parsed_value(&self) -> u64 {
        self.value
    }

    /// The value to execute with: the parse-time value once the field is
    /// final, the current guest memory content before that. This is what
    /// lets a re-used instruction node pick up a rewritten immediate.
    pub fn live_value<M: MemoryPort + ?Sized>(&self, mem: &M) -> u64 {
        if self.is_final {
            self.value
        } else {
            let bytes = mem.read_span(self.address, self.bytes.len() as u32);
            self.ty.normalize(le_value(&bytes))
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn signature(&self) -> &[Option<u8>] {
        &self.signature
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Locks the field to the bytes currently in guest memory, extending
    /// the signature over its full footprint.
    pub fn finalize<M: MemoryPort + ?Sized>(&mut self, mem: &M) {
        if self.is_final {
            return;
        }
        let bytes = mem.read_span(self.address, self.bytes.len() as u32);
        self.value = self.ty.normalize(le_value(&bytes));
        self.signature = bytes.iter().map(|b| Some(*b)).collect();
        self.bytes = bytes;
        self.is_final = true;
    }
}

fn le_value(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// The ordered per-byte fingerprint of a whole instruction.
///
/// `None` positions are wildcards. A signature matches a byte slice when
/// every `Some(b)` position equals the corresponding byte.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Signature(Vec<Option<u8>>);

impl Signature {
    /// A zero-length signature (matches anything).
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    /// Assembles an instruction signature from its fields in order,
    /// truncating at the first field that is not yet final.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a InstrField>) -> Self {
        let mut bytes = Vec::new();
        for field in fields {
            if !field.is_final() {
                break;
            }
            bytes.extend_from_slice(field.signature());
        }
        Signature(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        if bytes.len() < self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(bytes)
            .all(|(sig, byte)| sig.map_or(true, |s| s == *byte))
    }

    /// Matches directly against guest memory at `addr`.
    pub fn matches_memory<M: MemoryPort + ?Sized>(&self, mem: &M, addr: u32) -> bool {
        self.0.iter().enumerate().all(|(i, sig)| {
            sig.map_or(true, |s| s == mem.read_u8(addr.wrapping_add(i as u32)))
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match b {
                Some(b) => write!(f, "{b:02X}")?,
                None => write!(f, "??")?,
            }
        }
        Ok(())
    }
}
