//! Fluent construction of AST nodes from semantic intent.

use crate::ast::{BinOp, StmtNode, UnOp, ValueNode};
use crate::dtype::DataType;
use crate::state::{Flags, SegReg, Width};

/// Stateless node factory handed to every instruction lowering.
///
/// # Examples
/// ```
/// use cfg86::{AstBuilder, DataType, Width};
/// let b = AstBuilder::new();
/// let stmt = b.assign(b.reg(0, Width::W16), b.imm(DataType::U16, 0x1234));
/// assert_eq!(stmt.to_string(), "ax = 0x1234");
/// ```
#[derive(Default)]
pub struct AstBuilder;

impl AstBuilder {
    pub fn new() -> Self {
        AstBuilder
    }

    // Values.

    pub fn imm(&self, ty: DataType, value: u64) -> ValueNode {
        ValueNode::Constant(ty, value)
    }

    pub fn u16(&self, value: u16) -> ValueNode {
        ValueNode::Constant(DataType::U16, value as u64)
    }

    pub fn reg(&self, index: u8, width: Width) -> ValueNode {
        ValueNode::Register(index, DataType::of(width, false))
    }

    pub fn seg(&self, seg: SegReg) -> ValueNode {
        ValueNode::SegmentRegister(seg.index())
    }

    pub fn flag(&self, flag: Flags) -> ValueNode {
        ValueNode::CpuFlag(flag.bits())
    }

    pub fn abs_ptr(&self, ty: DataType, addr: ValueNode) -> ValueNode {
        ValueNode::AbsolutePointer(ty, Box::new(addr))
    }

    pub fn seg_ptr(&self, ty: DataType, segment: ValueNode, offset: ValueNode) -> ValueNode {
        ValueNode::SegmentedPointer(ty, Box::new(segment), Box::new(offset))
    }

    pub fn var(&self, name: &str, ty: DataType) -> ValueNode {
        ValueNode::VariableReference(name.to_owned(), ty)
    }

    pub fn bin(&self, ty: DataType, left: ValueNode, op: BinOp, right: ValueNode) -> ValueNode {
        ValueNode::BinaryOp(ty, Box::new(left), op, Box::new(right))
    }

    pub fn add(&self, ty: DataType, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(ty, left, BinOp::Add, right)
    }

    pub fn sub(&self, ty: DataType, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(ty, left, BinOp::Sub, right)
    }

    pub fn eq(&self, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(DataType::U8, left, BinOp::Eq, right)
    }

    pub fn ne(&self, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(DataType::U8, left, BinOp::Ne, right)
    }

    pub fn either(&self, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(DataType::U8, left, BinOp::LogicalOr, right)
    }

    pub fn both(&self, left: ValueNode, right: ValueNode) -> ValueNode {
        self.bin(DataType::U8, left, BinOp::LogicalAnd, right)
    }

    pub fn un(&self, ty: DataType, op: UnOp, value: ValueNode) -> ValueNode {
        ValueNode::UnaryOp(ty, op, Box::new(value))
    }

    pub fn not(&self, value: ValueNode) -> ValueNode {
        self.un(DataType::U8, UnOp::LogicalNot, value)
    }

    pub fn conv(&self, ty: DataType, value: ValueNode) -> ValueNode {
        ValueNode::TypeConversion(ty, Box::new(value))
    }

    /// An intrinsic that yields a value.
    pub fn call_value(&self, name: &str, args: Vec<ValueNode>) -> ValueNode {
        ValueNode::MethodCallValue(name.to_owned(), args)
    }

    // Statements.

    pub fn inst(&self, mnemonic: &str, operands: Vec<ValueNode>) -> StmtNode {
        StmtNode::Instruction(mnemonic.to_owned(), operands)
    }

    pub fn block(&self, stmts: Vec<StmtNode>) -> StmtNode {
        StmtNode::Block(stmts)
    }

    /// `target = value`, typed from the target.
    pub fn assign(&self, target: ValueNode, value: ValueNode) -> StmtNode {
        let ty = target.data_type().unwrap_or(DataType::U64);
        StmtNode::Expr(ValueNode::BinaryOp(
            ty,
            Box::new(target),
            BinOp::Assign,
            Box::new(value),
        ))
    }

    pub fn if_else(&self, cond: ValueNode, then: StmtNode, otherwise: StmtNode) -> StmtNode {
        StmtNode::IfElse(cond, Box::new(then), Some(Box::new(otherwise)))
    }

    pub fn if_then(&self, cond: ValueNode, then: StmtNode) -> StmtNode {
        StmtNode::IfElse(cond, Box::new(then), None)
    }

    pub fn decl(&self, name: &str, ty: DataType, init: ValueNode) -> StmtNode {
        StmtNode::VariableDeclaration(name.to_owned(), ty, Some(init))
    }

    /// An intrinsic invoked for effect.
    pub fn call(&self, name: &str, args: Vec<ValueNode>) -> StmtNode {
        StmtNode::MethodCall(name.to_owned(), args)
    }

    pub fn move_ip_next(&self) -> StmtNode {
        StmtNode::MoveIpNext
    }

    pub fn jump_near(&self, target: ValueNode) -> StmtNode {
        StmtNode::JumpNear(target)
    }

    pub fn jump_far(&self, segment: ValueNode, offset: ValueNode) -> StmtNode {
        StmtNode::JumpFar(segment, offset)
    }

    pub fn call_near(&self, target: ValueNode) -> StmtNode {
        StmtNode::CallNear(target)
    }

    pub fn call_far(&self, segment: ValueNode, offset: ValueNode) -> StmtNode {
        StmtNode::CallFar(segment, offset)
    }

    pub fn return_near(&self, pop: Option<ValueNode>) -> StmtNode {
        StmtNode::ReturnNear(pop)
    }

    pub fn return_far(&self, pop: Option<ValueNode>) -> StmtNode {
        StmtNode::ReturnFar(pop)
    }

    pub fn interrupt(&self, vector: ValueNode) -> StmtNode {
        StmtNode::InterruptCall(vector)
    }

    pub fn return_interrupt(&self) -> StmtNode {
        StmtNode::ReturnInterrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_takes_target_type() {
        let b = AstBuilder::new();
        let stmt = b.assign(b.reg(3, Width::W16), b.u16(7));
        match stmt {
            StmtNode::Expr(ValueNode::BinaryOp(ty, _, BinOp::Assign, _)) => {
                assert_eq!(ty, DataType::U16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn condition_helpers_build_u8_trees() {
        let b = AstBuilder::new();
        let cond = b.either(b.flag(Flags::CARRY), b.flag(Flags::ZERO));
        assert_eq!(cond.to_string(), "flags.CF || flags.ZF");
    }
}
