//! The CFG CPU: fetch through the node store, execute, follow successors,
//! honor the cycle budget and deliver interrupts at step boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::callbacks::{CallbackFn, CallbackTable};
use crate::cfg::{EdgeKind, FetchError, NodeId, NodeStore};
use crate::error::{CpuException, ExceptionKind, Result, VmFault};
use crate::exec::{execute, ExecutionHelper, Transition};
use crate::intr::InterruptLine;
use crate::mem::MemoryPort;
use crate::state::{CpuState, SegReg, SegmentedAddress};

/// Construction-time knobs for the executor loop.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuConfig {
    /// Cycles granted to one [`CfgCpu::run`] slice.
    pub slice_budget: u64,
    /// Sample the interrupt line between steps.
    pub poll_interrupts: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            slice_budget: 10_000,
            poll_interrupts: true,
        }
    }
}

/// What one step did.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// The instruction was HLT; stepping should pause until an interrupt
    /// or the embedder resumes.
    Halted,
}

/// Why a `run` slice ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    BudgetExhausted,
    Halted,
    /// The cooperative running flag was cleared.
    Stopped,
    Paused,
}

/// The complete CFG CPU over a memory port.
///
/// # Examples
/// ```
/// use cfg86::{CfgCpu, CpuConfig, FlatMemory, MemoryPort, SegReg};
/// let mut mem = FlatMemory::new(0x10_0000);
/// mem.load_bytes(0x10000, &[0xB8, 0x34, 0x12, 0xF4]); // mov ax, 0x1234; hlt
/// let mut cpu = CfgCpu::new(mem, CpuConfig::default());
/// cpu.state_mut().set_seg(SegReg::Cs, 0x1000);
/// cpu.state_mut().set_ip(0);
/// cpu.run().unwrap();
/// assert_eq!(cpu.state().ax(), 0x1234);
/// ```
pub struct CfgCpu<M: MemoryPort> {
    state: CpuState,
    mem: M,
    store: NodeStore,
    callbacks: CallbackTable<M>,
    intr: InterruptLine,
    config: CpuConfig,
    paused: Arc<AtomicBool>,
}

impl<M: MemoryPort> CfgCpu<M> {
    pub fn new(mem: M, config: CpuConfig) -> Self {
        Self {
            state: CpuState::new(),
            mem,
            store: NodeStore::new(),
            callbacks: CallbackTable::new(),
            intr: InterruptLine::new(),
            config,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// The discovered control-flow graph.
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackTable<M> {
        &mut self.callbacks
    }

    pub fn register_callback(&mut self, index: u8, callback: CallbackFn<M>) {
        self.callbacks.register(index, callback);
    }

    /// The interrupt line peripherals should clone.
    pub fn interrupt_line(&self) -> InterruptLine {
        self.intr.clone()
    }

    /// Shared pause flag; set from any thread, honored at the next step
    /// boundary.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Executes a single instruction at `CS:IP`.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let addr = self.state.cs_ip();
        let node_id = match self.store.fetch(&self.mem, addr) {
            Ok(id) => id,
            Err(FetchError::Parse(err)) => {
                warn!("parse failure at {addr}: {err}");
                self.deliver_exception(err.as_exception(), addr)?;
                return Ok(StepOutcome::Executed);
            }
            Err(FetchError::Fault(fault)) => {
                error!("fatal fetch fault at {addr}: {fault}\n{}", self.state);
                return Err(fault);
            }
        };

        let result = {
            let node = self
                .store
                .node(node_id)
                .as_instruction()
                .expect("fetch yields instruction nodes");
            trace!("step {addr}: {}", node.inst().disassemble());
            let mut helper = ExecutionHelper::new(&mut self.state, &mut self.mem);
            execute(node.inst(), &mut helper)
        };
        self.store.finalize_fields(&self.mem, node_id);
        self.state.add_cycles(1);

        let next = self
            .store
            .node(node_id)
            .as_instruction()
            .expect("fetch yields instruction nodes")
            .inst()
            .next_address();

        match result {
            Ok(Transition::FallThrough) => {
                self.transfer(node_id, EdgeKind::FallThrough, next);
                Ok(StepOutcome::Executed)
            }
            Ok(Transition::Taken(target)) => {
                self.transfer(node_id, EdgeKind::Taken, target);
                Ok(StepOutcome::Executed)
            }
            Ok(Transition::Return(target)) => {
                self.transfer(node_id, EdgeKind::Return, target);
                Ok(StepOutcome::Executed)
            }
            Ok(Transition::Callback { index }) => {
                // Position the guest past the opcode first so the host can
                // redirect control if it wants to.
                self.state.set_seg(SegReg::Cs, next.segment);
                self.state.set_ip(next.offset);
                self.callbacks
                    .dispatch(index, &mut self.state, &mut self.mem)?;
                self.record_edge_to(node_id, EdgeKind::FallThrough, self.state.cs_ip());
                Ok(StepOutcome::Executed)
            }
            Ok(Transition::Halt) => {
                debug!("hlt at {addr}");
                self.state.set_seg(SegReg::Cs, next.segment);
                self.state.set_ip(next.offset);
                Ok(StepOutcome::Halted)
            }
            Err(exception) => {
                let return_to = match exception.kind() {
                    ExceptionKind::Fault => addr,
                    _ => next,
                };
                self.deliver_exception(exception, return_to)?;
                Ok(StepOutcome::Executed)
            }
        }
    }

    /// Runs until the slice budget is exhausted, HLT, pause, or the
    /// running flag clears.
    pub fn run(&mut self) -> Result<RunExit> {
        let mut budget = self.config.slice_budget;
        loop {
            if !self.state.running() {
                return Ok(RunExit::Stopped);
            }
            if self.paused.load(Ordering::Acquire) {
                return Ok(RunExit::Paused);
            }
            if budget == 0 {
                return Ok(RunExit::BudgetExhausted);
            }
            self.poll_interrupts()?;
            match self.step()? {
                StepOutcome::Executed => {}
                StepOutcome::Halted => return Ok(RunExit::Halted),
            }
            budget -= 1;
        }
    }

    /// Hardware interrupts preempt only at instruction boundaries and
    /// only while IF is set.
    fn poll_interrupts(&mut self) -> Result<()> {
        if !self.config.poll_interrupts || !self.state.interrupt() {
            return Ok(());
        }
        if let Some(vector) = self.intr.acknowledge() {
            debug!("delivering hardware interrupt vector {vector:#04x}");
            self.deliver_exception(
                CpuException::new(vector, ExceptionKind::Trap, None),
                self.state.cs_ip(),
            )?;
        }
        Ok(())
    }

    /// Sets the new `CS:IP`, then looks up or creates the successor node
    /// and records the labeled edge.
    fn transfer(&mut self, from: NodeId, kind: EdgeKind, target: SegmentedAddress) {
        self.state.set_seg(SegReg::Cs, target.segment);
        self.state.set_ip(target.offset);
        self.record_edge_to(from, kind, target);
    }

    fn record_edge_to(&mut self, from: NodeId, kind: EdgeKind, target: SegmentedAddress) {
        match self.store.fetch(&self.mem, target) {
            Ok(successor) => self.store.record_edge(from, kind, successor),
            // The successor will fault when actually stepped; no edge.
            Err(err) => trace!("successor at {target} not representable yet: {err:?}"),
        }
    }

    /// Pushes an interrupt frame returning to `return_to` and vectors
    /// through the IVT. An unset IVT entry is fatal.
    fn deliver_exception(
        &mut self,
        exception: CpuException,
        return_to: SegmentedAddress,
    ) -> Result<()> {
        let entry = self.mem.ivt_entry(exception.vector());
        if entry.segment == 0 && entry.offset == 0 {
            error!("{exception} with unset IVT entry\n{}", self.state);
            return Err(VmFault::UnhandledException { exception });
        }
        debug!("{exception} vectors to {entry}");
        let mut helper = ExecutionHelper::new(&mut self.state, &mut self.mem);
        let target = helper.interrupt_entry(exception.vector(), return_to.offset);
        self.state.set_seg(SegReg::Cs, target.segment);
        self.state.set_ip(target.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatMemory;

    fn cpu_with(bytes: &[u8]) -> CfgCpu<FlatMemory> {
        let mut mem = FlatMemory::new(0x10_0000);
        mem.load_bytes(0x10000, bytes);
        let mut cpu = CfgCpu::new(mem, CpuConfig::default());
        cpu.state_mut().set_seg(SegReg::Cs, 0x1000);
        cpu.state_mut().set_seg(SegReg::Ds, 0x1000);
        cpu.state_mut().set_seg(SegReg::Ss, 0x2000);
        cpu.state_mut().set_sp(0x0100);
        cpu.state_mut().set_ip(0);
        cpu
    }

    #[test]
    fn step_advances_and_builds_graph() {
        let mut cpu = cpu_with(&[0xB8, 0x34, 0x12, 0xF4]);
        cpu.step().unwrap();
        assert_eq!(cpu.state().ax(), 0x1234);
        assert_eq!(cpu.state().ip(), 3);
        assert_eq!(cpu.state().cycles(), 1);
        let edges = cpu.store().edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].1, EdgeKind::FallThrough);
    }

    #[test]
    fn run_stops_on_hlt() {
        let mut cpu = cpu_with(&[0x40, 0x40, 0xF4]); // inc ax; inc ax; hlt
        assert_eq!(cpu.run().unwrap(), RunExit::Halted);
        assert_eq!(cpu.state().ax(), 2);
        assert_eq!(cpu.state().ip(), 3);
    }

    #[test]
    fn budget_exhaustion_yields() {
        let mut mem = FlatMemory::new(0x10_0000);
        mem.load_bytes(0x10000, &[0xEB, 0xFE]); // jmp $
        let mut cpu = CfgCpu::new(
            mem,
            CpuConfig {
                slice_budget: 25,
                poll_interrupts: false,
            },
        );
        cpu.state_mut().set_seg(SegReg::Cs, 0x1000);
        assert_eq!(cpu.run().unwrap(), RunExit::BudgetExhausted);
        assert_eq!(cpu.state().cycles(), 25);
        assert_eq!(cpu.state().ip(), 0);
    }

    #[test]
    fn pause_flag_stops_slice() {
        let mut cpu = cpu_with(&[0xEB, 0xFE]);
        cpu.pause_flag().store(true, Ordering::Release);
        assert_eq!(cpu.run().unwrap(), RunExit::Paused);
    }

    #[test]
    fn division_error_vectors_through_ivt() {
        let mut cpu = cpu_with(&[0xF7, 0xF1]); // div cx
        cpu.state_mut().set_ax(1);
        cpu.state_mut().set_cx(0);
        cpu.memory_mut()
            .set_ivt_entry(0, SegmentedAddress::new(0xF000, 0x0200));
        cpu.step().unwrap();
        assert_eq!(cpu.state().cs_ip(), SegmentedAddress::new(0xF000, 0x0200));
        // The pushed return IP points at the faulting instruction.
        assert_eq!(cpu.memory().read_u16(0x200FA), 0x0000);
    }

    #[test]
    fn division_error_without_handler_is_fatal() {
        let mut cpu = cpu_with(&[0xF7, 0xF1]);
        cpu.state_mut().set_ax(1);
        cpu.state_mut().set_cx(0);
        assert!(matches!(
            cpu.step(),
            Err(VmFault::UnhandledException { .. })
        ));
    }

    #[test]
    fn invalid_opcode_becomes_ud_interrupt() {
        let mut cpu = cpu_with(&[0xD8, 0x00]); // FPU escape, unsupported
        cpu.memory_mut()
            .set_ivt_entry(6, SegmentedAddress::new(0xF000, 0x0300));
        cpu.step().unwrap();
        assert_eq!(cpu.state().cs_ip(), SegmentedAddress::new(0xF000, 0x0300));
    }

    #[test]
    fn hardware_interrupt_delivered_between_steps() {
        let mut cpu = cpu_with(&[0x90, 0x90, 0xF4]); // nop; nop; hlt
        cpu.memory_mut()
            .set_ivt_entry(0x08, SegmentedAddress::new(0xF000, 0x0400));
        // Handler: iret at f000:0400.
        cpu.memory_mut().write_u8(0xF0400, 0xCF);
        cpu.state_mut().set_interrupt(true);
        let line = cpu.interrupt_line();

        cpu.step().unwrap(); // first nop
        line.request(0);
        cpu.poll_interrupts().unwrap();
        assert_eq!(cpu.state().cs_ip(), SegmentedAddress::new(0xF000, 0x0400));
        assert!(!cpu.state().interrupt());

        cpu.step().unwrap(); // iret back
        assert_eq!(cpu.state().cs_ip(), SegmentedAddress::new(0x1000, 0x0001));
        assert!(cpu.state().interrupt());
    }

    #[test]
    fn interrupts_not_taken_while_if_clear() {
        let mut cpu = cpu_with(&[0x90, 0xF4]);
        let line = cpu.interrupt_line();
        line.request(0);
        cpu.state_mut().set_interrupt(false);
        cpu.poll_interrupts().unwrap();
        assert_eq!(cpu.state().cs_ip(), SegmentedAddress::new(0x1000, 0x0000));
        assert!(line.pending());
    }

    #[test]
    fn callback_dispatches_to_host() {
        let mut cpu = cpu_with(&[0xFE, 0x38, 0x07, 0xF4]);
        cpu.register_callback(
            0x07,
            Box::new(|state, _mem| {
                state.set_bx(0x4242);
                Ok(())
            }),
        );
        cpu.step().unwrap();
        assert_eq!(cpu.state().bx(), 0x4242);
        assert_eq!(cpu.state().ip(), 3);
    }

    #[test]
    fn unknown_callback_is_fatal() {
        let mut cpu = cpu_with(&[0xFE, 0x38, 0x07]);
        assert!(matches!(
            cpu.step(),
            Err(VmFault::CallbackNotFound(0x07))
        ));
    }

    #[test]
    fn graph_idempotence_over_reexecution() {
        // Run the same loop body twice from identical states; the edge set
        // must come out identical.
        let image = [0xB9, 0x02, 0x00, 0x49, 0x75, 0xFD, 0xF4]; // mov cx,2; dec cx; jnz -3; hlt
        let run_once = || {
            let mut cpu = cpu_with(&image);
            cpu.run().unwrap();
            let mut edges = cpu.store().edges();
            edges.sort_by_key(|(a, k, b)| (a.index(), *k, b.index()));
            (cpu.state().clone(), edges)
        };
        let (s1, e1) = run_once();
        let (s2, e2) = run_once();
        assert_eq!(s1, s2);
        assert_eq!(e1, e2);
    }
}
