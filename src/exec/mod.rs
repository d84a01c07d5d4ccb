//! Instruction execution: the per-step helper and the imperative
//! executors for the catalog.

mod helper;
mod semantics;

pub use helper::{ExecutionHelper, Transition};
pub use semantics::execute;

pub(crate) use semantics::{
    alu_apply, apply_shift, read_wide_dividend, write_div_result, write_wide_result,
};
