//! Interrupt request plumbing between peripheral threads and the CPU.

use std::sync::{Arc, Mutex};

/// Base vector of IRQs 0..=7 (master PIC convention).
const MASTER_BASE: u8 = 0x08;
/// Base vector of IRQs 8..=15.
const SLAVE_BASE: u8 = 0x70;

/// A shared interrupt-request register.
///
/// Peripheral threads assert request lines at any time; the CPU samples
/// only at instruction boundaries and reads-and-clears the highest
/// priority (lowest numbered) pending request.
///
/// # Examples
/// ```
/// use cfg86::InterruptLine;
/// let line = InterruptLine::new();
/// let timer = line.clone();
/// timer.request(0);
/// assert_eq!(line.acknowledge(), Some(0x08));
/// assert_eq!(line.acknowledge(), None);
/// ```
#[derive(Clone, Default)]
pub struct InterruptLine {
    mask: Arc<Mutex<u16>>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self {
            mask: Arc::new(Mutex::new(0)),
        }
    }

    /// Asserts IRQ line `irq` (0..=15).
    pub fn request(&self, irq: u8) {
        let mut mask = self.mask.lock().unwrap();
        *mask |= 1 << (irq & 0xF);
    }

    /// True when any request is pending.
    pub fn pending(&self) -> bool {
        *self.mask.lock().unwrap() != 0
    }

    /// Takes the highest-priority pending request, clearing its line, and
    /// returns the interrupt vector to deliver.
    pub fn acknowledge(&self) -> Option<u8> {
        let mut mask = self.mask.lock().unwrap();
        if *mask == 0 {
            return None;
        }
        let irq = mask.trailing_zeros() as u8;
        *mask &= !(1 << irq);
        Some(if irq < 8 {
            MASTER_BASE + irq
        } else {
            SLAVE_BASE + (irq - 8)
        })
    }
}
