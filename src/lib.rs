#![doc = include_str!("../README.md")]

pub mod alu;
mod ast;
mod callbacks;
mod cfg;
mod cpu;
mod dtype;
mod error;
mod exec;
mod field;
mod inst;
mod intr;
mod mem;
mod modrm;
mod parser;
mod state;

pub use ast::{
    AstBuilder, AstError, AstInterpreter, AstVisitor, BinOp, StmtNode, UnOp, ValueNode,
};
pub use callbacks::{CallbackFn, CallbackTable};
pub use cfg::{
    CfgNode, DiscriminatedNode, EdgeKind, FetchError, InstructionNode, NodeId, NodeStore,
    SelectorNode,
};
pub use cpu::{CfgCpu, CpuConfig, RunExit, StepOutcome};
pub use dtype::{BitWidth, DataType};
pub use error::{CpuException, ExceptionKind, GuestError, ParseError, Result, VmFault};
pub use exec::{execute, ExecutionHelper, Transition};
pub use field::{InstrField, Signature};
pub use inst::{
    AluForm, AluOp, Cond, Grp3Op, Grp45Op, LoopKind, Op, ParsedInstruction, RepKind, ShiftCount,
    ShiftOp, StringOp,
};
pub use intr::InterruptLine;
pub use mem::{FlatMemory, MemoryPort, IVT_BASE, IVT_END};
pub use modrm::{
    MemoryOffset16, MemoryOffset32, MemoryOffsetKind, ModRmContext, SibContext,
};
pub use parser::Parser;
pub use state::{
    reg8_name, AddrWidth, CpuState, Flags, Gpr, SegReg, SegmentedAddress, Width,
};
