//! A language-neutral abstract syntax tree for instruction semantics.
//!
//! Every parsed instruction lowers twice: to a single [`StmtNode::Instruction`]
//! naming the operation (the disassembly form) and to a statement tree
//! expressing its full effect (the execution form). Consumers dispatch over
//! the tree with an [`AstVisitor`]; exhaustiveness is the contract, and a
//! visitor may answer any variant with a typed "unsupported" error.

mod builder;
mod interp;
mod lower;

pub use builder::AstBuilder;
pub use interp::AstInterpreter;

use core::fmt;

use thiserror::Error;

use crate::dtype::DataType;
use crate::error::CpuException;
use crate::state::{reg8_name, Flags, Gpr, SegReg, Width};

/// Binary operators available in value trees, including assignment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LogicalAnd,
    LogicalOr,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Assign,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::LogicalAnd => "&&",
            BinOp::LogicalOr => "||",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Assign => "=",
        }
    }
}

/// Unary operators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum UnOp {
    Neg,
    Not,
    LogicalNot,
}

impl UnOp {
    fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "~",
            UnOp::LogicalNot => "!",
        }
    }
}

/// Value-producing nodes.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueNode {
    Constant(DataType, u64),
    /// General register by encoding index at the type's width.
    Register(u8, DataType),
    SegmentRegister(u8),
    /// One flag bit, by its EFLAGS mask.
    CpuFlag(u32),
    /// Memory at a linear address.
    AbsolutePointer(DataType, Box<ValueNode>),
    /// Memory at `segment:offset`.
    SegmentedPointer(DataType, Box<ValueNode>, Box<ValueNode>),
    VariableReference(String, DataType),
    BinaryOp(DataType, Box<ValueNode>, BinOp, Box<ValueNode>),
    UnaryOp(DataType, UnOp, Box<ValueNode>),
    TypeConversion(DataType, Box<ValueNode>),
    /// An intrinsic producing a value (ALU helpers, stack pops).
    MethodCallValue(String, Vec<ValueNode>),
}

/// Statement and control-flow nodes.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum StmtNode {
    /// The disassembly form: an operation name plus operand sub-trees.
    Instruction(String, Vec<ValueNode>),
    Block(Vec<StmtNode>),
    IfElse(ValueNode, Box<StmtNode>, Option<Box<StmtNode>>),
    VariableDeclaration(String, DataType, Option<ValueNode>),
    /// An intrinsic invoked for effect only.
    MethodCall(String, Vec<ValueNode>),
    /// A value evaluated for its side effect (assignments).
    Expr(ValueNode),
    /// Advance IP past the current instruction.
    MoveIpNext,
    CallNear(ValueNode),
    CallFar(ValueNode, ValueNode),
    ReturnNear(Option<ValueNode>),
    ReturnFar(Option<ValueNode>),
    JumpNear(ValueNode),
    JumpFar(ValueNode, ValueNode),
    InterruptCall(ValueNode),
    ReturnInterrupt,
}

/// Errors produced while visiting or evaluating a tree.
#[derive(Error, Debug, PartialEq)]
pub enum AstError {
    #[error("visitor does not support {0} nodes")]
    Unsupported(&'static str),

    #[error("unknown intrinsic `{0}`")]
    UnknownMethod(String),

    #[error("reference to undeclared variable `{0}`")]
    UnknownVariable(String),

    #[error("left side of an assignment is not a storage location")]
    BadAssignTarget,

    #[error("evaluation raised {0}")]
    Exception(CpuException),
}

/// Total dispatch over the tree: one method per variant, each defaulting
/// to a typed "unsupported" answer so partial visitors stay honest.
#[allow(unused_variables)]
pub trait AstVisitor {
    type Output;

    fn visit_constant(&mut self, ty: DataType, value: u64) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("Constant"))
    }

    fn visit_register(&mut self, index: u8, ty: DataType) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("Register"))
    }

    fn visit_segment_register(&mut self, index: u8) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("SegmentRegister"))
    }

    fn visit_cpu_flag(&mut self, mask: u32) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("CpuFlag"))
    }

    fn visit_absolute_pointer(
        &mut self,
        ty: DataType,
        addr: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("AbsolutePointer"))
    }

    fn visit_segmented_pointer(
        &mut self,
        ty: DataType,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("SegmentedPointer"))
    }

    fn visit_variable_reference(
        &mut self,
        name: &str,
        ty: DataType,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("VariableReference"))
    }

    fn visit_binary_op(
        &mut self,
        ty: DataType,
        left: &ValueNode,
        op: BinOp,
        right: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("BinaryOp"))
    }

    fn visit_unary_op(
        &mut self,
        ty: DataType,
        op: UnOp,
        value: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("UnaryOp"))
    }

    fn visit_type_conversion(
        &mut self,
        ty: DataType,
        value: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("TypeConversion"))
    }

    fn visit_method_call_value(
        &mut self,
        name: &str,
        args: &[ValueNode],
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("MethodCallValue"))
    }

    fn visit_instruction(
        &mut self,
        mnemonic: &str,
        operands: &[ValueNode],
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("Instruction"))
    }

    fn visit_block(&mut self, stmts: &[StmtNode]) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("Block"))
    }

    fn visit_if_else(
        &mut self,
        cond: &ValueNode,
        then: &StmtNode,
        otherwise: Option<&StmtNode>,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("IfElse"))
    }

    fn visit_variable_declaration(
        &mut self,
        name: &str,
        ty: DataType,
        init: Option<&ValueNode>,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("VariableDeclaration"))
    }

    fn visit_method_call(
        &mut self,
        name: &str,
        args: &[ValueNode],
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("MethodCall"))
    }

    fn visit_expr(&mut self, value: &ValueNode) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("Expr"))
    }

    fn visit_move_ip_next(&mut self) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("MoveIpNext"))
    }

    fn visit_call_near(&mut self, target: &ValueNode) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("CallNear"))
    }

    fn visit_call_far(
        &mut self,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("CallFar"))
    }

    fn visit_return_near(&mut self, pop: Option<&ValueNode>) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("ReturnNear"))
    }

    fn visit_return_far(&mut self, pop: Option<&ValueNode>) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("ReturnFar"))
    }

    fn visit_jump_near(&mut self, target: &ValueNode) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("JumpNear"))
    }

    fn visit_jump_far(
        &mut self,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("JumpFar"))
    }

    fn visit_interrupt_call(&mut self, vector: &ValueNode) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("InterruptCall"))
    }

    fn visit_return_interrupt(&mut self) -> Result<Self::Output, AstError> {
        Err(AstError::Unsupported("ReturnInterrupt"))
    }
}

impl ValueNode {
    pub fn accept<V: AstVisitor>(&self, v: &mut V) -> Result<V::Output, AstError> {
        match self {
            ValueNode::Constant(ty, value) => v.visit_constant(*ty, *value),
            ValueNode::Register(index, ty) => v.visit_register(*index, *ty),
            ValueNode::SegmentRegister(index) => v.visit_segment_register(*index),
            ValueNode::CpuFlag(mask) => v.visit_cpu_flag(*mask),
            ValueNode::AbsolutePointer(ty, addr) => v.visit_absolute_pointer(*ty, addr),
            ValueNode::SegmentedPointer(ty, seg, off) => v.visit_segmented_pointer(*ty, seg, off),
            ValueNode::VariableReference(name, ty) => v.visit_variable_reference(name, *ty),
            ValueNode::BinaryOp(ty, left, op, right) => v.visit_binary_op(*ty, left, *op, right),
            ValueNode::UnaryOp(ty, op, value) => v.visit_unary_op(*ty, *op, value),
            ValueNode::TypeConversion(ty, value) => v.visit_type_conversion(*ty, value),
            ValueNode::MethodCallValue(name, args) => v.visit_method_call_value(name, args),
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ValueNode::Constant(ty, _)
            | ValueNode::Register(_, ty)
            | ValueNode::AbsolutePointer(ty, _)
            | ValueNode::SegmentedPointer(ty, _, _)
            | ValueNode::VariableReference(_, ty)
            | ValueNode::BinaryOp(ty, _, _, _)
            | ValueNode::UnaryOp(ty, _, _)
            | ValueNode::TypeConversion(ty, _) => Some(*ty),
            _ => None,
        }
    }
}

impl StmtNode {
    pub fn accept<V: AstVisitor>(&self, v: &mut V) -> Result<V::Output, AstError> {
        match self {
            StmtNode::Instruction(mnemonic, operands) => v.visit_instruction(mnemonic, operands),
            StmtNode::Block(stmts) => v.visit_block(stmts),
            StmtNode::IfElse(cond, then, otherwise) => {
                v.visit_if_else(cond, then, otherwise.as_deref())
            }
            StmtNode::VariableDeclaration(name, ty, init) => {
                v.visit_variable_declaration(name, *ty, init.as_ref())
            }
            StmtNode::MethodCall(name, args) => v.visit_method_call(name, args),
            StmtNode::Expr(value) => v.visit_expr(value),
            StmtNode::MoveIpNext => v.visit_move_ip_next(),
            StmtNode::CallNear(target) => v.visit_call_near(target),
            StmtNode::CallFar(seg, off) => v.visit_call_far(seg, off),
            StmtNode::ReturnNear(pop) => v.visit_return_near(pop.as_ref()),
            StmtNode::ReturnFar(pop) => v.visit_return_far(pop.as_ref()),
            StmtNode::JumpNear(target) => v.visit_jump_near(target),
            StmtNode::JumpFar(seg, off) => v.visit_jump_far(seg, off),
            StmtNode::InterruptCall(vector) => v.visit_interrupt_call(vector),
            StmtNode::ReturnInterrupt => v.visit_return_interrupt(),
        }
    }
}

fn flag_name(mask: u32) -> &'static str {
    match mask {
        m if m == Flags::CARRY.bits() => "CF",
        m if m == Flags::PARITY.bits() => "PF",
        m if m == Flags::AUXILIARY.bits() => "AF",
        m if m == Flags::ZERO.bits() => "ZF",
        m if m == Flags::SIGN.bits() => "SF",
        m if m == Flags::TRAP.bits() => "TF",
        m if m == Flags::INTERRUPT.bits() => "IF",
        m if m == Flags::DIRECTION.bits() => "DF",
        m if m == Flags::OVERFLOW.bits() => "OF",
        _ => "flags",
    }
}

fn width_keyword(ty: DataType) -> &'static str {
    match ty.width.bits() {
        8 => "byte",
        16 => "word",
        32 => "dword",
        _ => "ptr",
    }
}

impl fmt::Display for ValueNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueNode::Constant(ty, value) => {
                let masked = value & ty.width.mask();
                write!(f, "0x{masked:X}")
            }
            ValueNode::Register(index, ty) => match ty.width.bits() {
                8 => write!(f, "{}", reg8_name(*index)),
                32 => write!(f, "{}", Gpr::from_index(*index).name(Width::W32)),
                _ => write!(f, "{}", Gpr::from_index(*index).name(Width::W16)),
            },
            ValueNode::SegmentRegister(index) => write!(f, "{}", SegReg::from_index(*index).name()),
            ValueNode::CpuFlag(mask) => write!(f, "flags.{}", flag_name(*mask)),
            ValueNode::AbsolutePointer(ty, addr) => {
                write!(f, "{} ptr [{addr}]", width_keyword(*ty))
            }
            ValueNode::SegmentedPointer(ty, seg, off) => {
                write!(f, "{} ptr {seg}:[{off}]", width_keyword(*ty))
            }
            ValueNode::VariableReference(name, _) => write!(f, "{name}"),
            ValueNode::BinaryOp(_, left, op, right) => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            ValueNode::UnaryOp(_, op, value) => write!(f, "{}{value}", op.symbol()),
            ValueNode::TypeConversion(ty, value) => write!(f, "{ty}({value})"),
            ValueNode::MethodCallValue(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for StmtNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StmtNode::Instruction(mnemonic, operands) => {
                write!(f, "{mnemonic}")?;
                for (i, op) in operands.iter().enumerate() {
                    write!(f, "{}{op}", if i == 0 { " " } else { ", " })?;
                }
                Ok(())
            }
            StmtNode::Block(stmts) => {
                for (i, stmt) in stmts.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{stmt}")?;
                }
                Ok(())
            }
            StmtNode::IfElse(cond, then, otherwise) => {
                write!(f, "if ({cond}) {{ {then} }}")?;
                if let Some(e) = otherwise {
                    write!(f, " else {{ {e} }}")?;
                }
                Ok(())
            }
            StmtNode::VariableDeclaration(name, ty, init) => {
                write!(f, "{ty} {name}")?;
                if let Some(init) = init {
                    write!(f, " = {init}")?;
                }
                Ok(())
            }
            StmtNode::MethodCall(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            StmtNode::Expr(value) => write!(f, "{value}"),
            StmtNode::MoveIpNext => write!(f, "ip = next"),
            StmtNode::CallNear(target) => write!(f, "call_near({target})"),
            StmtNode::CallFar(seg, off) => write!(f, "call_far({seg}, {off})"),
            StmtNode::ReturnNear(pop) => match pop {
                Some(pop) => write!(f, "return_near({pop})"),
                None => write!(f, "return_near()"),
            },
            StmtNode::ReturnFar(pop) => match pop {
                Some(pop) => write!(f, "return_far({pop})"),
                None => write!(f, "return_far()"),
            },
            StmtNode::JumpNear(target) => write!(f, "jump_near({target})"),
            StmtNode::JumpFar(seg, off) => write!(f, "jump_far({seg}, {off})"),
            StmtNode::InterruptCall(vector) => write!(f, "interrupt({vector})"),
            StmtNode::ReturnInterrupt => write!(f, "return_interrupt()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;

    #[test]
    fn visitor_defaults_to_unsupported() {
        struct Nothing;
        impl AstVisitor for Nothing {
            type Output = ();
        }
        let node = ValueNode::Constant(DataType::U16, 1);
        assert_eq!(
            node.accept(&mut Nothing),
            Err(AstError::Unsupported("Constant"))
        );
        assert_eq!(
            StmtNode::MoveIpNext.accept(&mut Nothing),
            Err(AstError::Unsupported("MoveIpNext"))
        );
    }

    #[test]
    fn display_forms() {
        let mov = StmtNode::Instruction(
            "mov".into(),
            vec![
                ValueNode::Register(0, DataType::U16),
                ValueNode::Constant(DataType::U16, 0x1234),
            ],
        );
        assert_eq!(mov.to_string(), "mov ax, 0x1234");

        let mem = ValueNode::SegmentedPointer(
            DataType::U16,
            Box::new(ValueNode::SegmentRegister(3)),
            Box::new(ValueNode::BinaryOp(
                DataType::U16,
                Box::new(ValueNode::Register(3, DataType::U16)),
                BinOp::Add,
                Box::new(ValueNode::Constant(DataType::U16, 6)),
            )),
        );
        assert_eq!(mem.to_string(), "word ptr ds:[bx + 0x6]");
    }
}
