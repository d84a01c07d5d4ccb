//! Error taxonomy: guest-recoverable CPU exceptions, fatal VM faults and
//! reported-but-benign guest errors.

use core::fmt;

use thiserror::Error;

/// A convenience alias for results whose error side is a fatal VM fault.
pub type Result<T = ()> = core::result::Result<T, VmFault>;

/// How an exception interacts with the interrupted instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionKind {
    /// Reported before the instruction completes; the saved IP points at
    /// the faulting instruction.
    Fault,
    /// Reported after the instruction completes; the saved IP points past
    /// it.
    Trap,
    /// The machine state around the exception is unreliable.
    Abort,
}

/// An x86 CPU exception, recoverable through the guest IVT.
///
/// The executor loop never lets one of these escape: it is converted into
/// an interrupt push through the real-mode vector table. Only [`VmFault`]
/// unwinds past the loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuException {
    vector: u8,
    kind: ExceptionKind,
    error_code: Option<u16>,
}

impl CpuException {
    pub const fn new(vector: u8, kind: ExceptionKind, error_code: Option<u16>) -> Self {
        Self {
            vector,
            kind,
            error_code,
        }
    }

    /// #DE, raised by `DIV`/`IDIV` on a zero divisor or quotient overflow.
    pub const fn division_error() -> Self {
        Self::new(0, ExceptionKind::Fault, None)
    }

    /// #UD, raised when fetching an encoding the catalog does not know.
    pub const fn invalid_opcode() -> Self {
        Self::new(6, ExceptionKind::Fault, None)
    }

    /// #GP.
    pub const fn general_protection(error_code: u16) -> Self {
        Self::new(13, ExceptionKind::Fault, Some(error_code))
    }

    /// #PF. Unused in real mode, kept for the taxonomy.
    pub const fn page_fault(error_code: u16) -> Self {
        Self::new(14, ExceptionKind::Fault, Some(error_code))
    }

    /// #DF.
    pub const fn double_fault() -> Self {
        Self::new(8, ExceptionKind::Abort, Some(0))
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    pub fn error_code(&self) -> Option<u16> {
        self.error_code
    }
}

impl fmt::Display for CpuException {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(
                f,
                "cpu exception vector {} ({:?}, error code {:#x})",
                self.vector, self.kind, code
            ),
            None => write!(f, "cpu exception vector {} ({:?})", self.vector, self.kind),
        }
    }
}

/// A fatal fault in the virtual machine itself. Unwinds past the executor
/// loop; the guest cannot observe or recover from it.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VmFault {
    #[error("no candidate at {address:#07x} matches memory after re-parse; selector had {candidates} candidate(s)")]
    NoMatchingCandidate { address: u32, candidates: usize },

    #[error("control-flow graph is corrupted: {0}")]
    CorruptedGraph(String),

    #[error("callback index {0:#04x} is not registered")]
    CallbackNotFound(u8),

    #[error("memory access at {address:#010x} (+{len}) is outside the {size} byte address space")]
    MemoryOutOfBounds { address: u32, len: u32, size: u32 },

    #[error("unhandled {exception} and IVT entry {} is unset", .exception.vector())]
    UnhandledException { exception: CpuException },
}

/// A guest-level problem that is reported and survived, never fatal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GuestError {
    #[error("unhandled interrupt service request {vector:#04x}, function {function:#06x}")]
    UnhandledInterrupt { vector: u8, function: u16 },

    #[error("unsupported BIOS sub-function {function:#04x} of interrupt {vector:#04x}")]
    UnsupportedBiosFunction { vector: u8, function: u8 },
}

/// Failure to parse the byte stream at an address. Converted into #UD at
/// the executor loop boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid opcode {bytes:02x?} at {address:#07x}")]
    InvalidOpcode { address: u32, bytes: Vec<u8> },

    #[error("instruction at {address:#07x} is truncated after {got} byte(s)")]
    Truncated { address: u32, got: u8 },

    #[error("instruction at {address:#07x} exceeds the maximum length of 15 bytes")]
    TooLong { address: u32 },
}

impl ParseError {
    /// The CPU-level view of a parse failure.
    pub fn as_exception(&self) -> CpuException {
        CpuException::invalid_opcode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_constructors() {
        assert_eq!(CpuException::division_error().vector(), 0);
        assert_eq!(CpuException::invalid_opcode().vector(), 6);
        assert_eq!(CpuException::double_fault().kind(), ExceptionKind::Abort);
        assert_eq!(
            CpuException::general_protection(0).error_code(),
            Some(0)
        );
    }

    #[test]
    fn parse_error_becomes_ud() {
        let err = ParseError::Truncated {
            address: 0x100,
            got: 1,
        };
        assert_eq!(err.as_exception(), CpuException::invalid_opcode());
    }
}
