//! Host callback table behind the reserved `FE 38 nn` opcode.

use log::warn;

use crate::error::{GuestError, VmFault};
use crate::mem::MemoryPort;
use crate::state::{CpuState, SegmentedAddress};

/// A host function invoked when the guest executes `FE 38 nn`.
pub type CallbackFn<M> = Box<dyn FnMut(&mut CpuState, &mut M) -> Result<(), GuestError>>;

/// Indexed host callbacks. Installing one plants the reserved three-byte
/// opcode in guest memory; erasing rewrites it as `INT nn` + `NOP` so
/// disassembly tooling sees something sensible.
pub struct CallbackTable<M> {
    entries: Vec<Option<CallbackFn<M>>>,
}

impl<M: MemoryPort> CallbackTable<M> {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(256);
        entries.resize_with(256, || None);
        Self { entries }
    }

    pub fn register(&mut self, index: u8, callback: CallbackFn<M>) {
        self.entries[index as usize] = Some(callback);
    }

    pub fn is_registered(&self, index: u8) -> bool {
        self.entries[index as usize].is_some()
    }

    /// Writes the `FE 38 nn` sequence for callback `index` at `addr`.
    pub fn install(&self, mem: &mut M, addr: SegmentedAddress, index: u8) {
        mem.load_bytes(addr.linear(), &[0xFE, 0x38, index]);
    }

    /// Unregisters `index` and rewrites its opcode at `addr` as
    /// `CD nn 90` (`INT nn` + `NOP`).
    pub fn erase(&mut self, mem: &mut M, addr: SegmentedAddress, index: u8) {
        self.entries[index as usize] = None;
        mem.load_bytes(addr.linear(), &[0xCD, index, 0x90]);
    }

    /// Runs callback `index`. Guest-level errors are logged and survived;
    /// an unregistered index is a fatal fault.
    pub fn dispatch(
        &mut self,
        index: u8,
        state: &mut CpuState,
        mem: &mut M,
    ) -> Result<(), VmFault> {
        match &mut self.entries[index as usize] {
            Some(callback) => {
                if let Err(err) = callback(state, mem) {
                    warn!("callback {index:#04x}: {err}");
                }
                Ok(())
            }
            None => Err(VmFault::CallbackNotFound(index)),
        }
    }
}

impl<M: MemoryPort> Default for CallbackTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
