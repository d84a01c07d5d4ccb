//! Evaluation of execution ASTs against live machine state.
//!
//! This is the analyzer-side twin of the imperative executors: it walks
//! the tree produced by `generate_execution_ast` and applies the same
//! effects through the shared ALU, which is what the executor/AST
//! equivalence property checks.

use std::collections::HashMap;

use crate::alu;
use crate::ast::{AstError, AstVisitor, BinOp, StmtNode, UnOp, ValueNode};
use crate::dtype::DataType;
use crate::exec::{alu_apply, apply_shift, ExecutionHelper};
use crate::inst::{AluOp, ShiftOp};
use crate::mem::MemoryPort;
use crate::state::{CpuState, Flags, SegReg, Width};

fn width_of(ty: DataType) -> Width {
    match ty.width.bits() {
        32 | 64 => Width::W32,
        16 => Width::W16,
        _ => Width::W8,
    }
}

/// Walks an execution AST, mutating the machine it borrows.
pub struct AstInterpreter<'a, M: MemoryPort + ?Sized> {
    state: &'a mut CpuState,
    mem: &'a mut M,
    /// In-segment address of the next linear instruction; the target of
    /// `MoveIpNext` and the return address of calls.
    next_ip: u16,
    vars: HashMap<String, u64>,
}

impl<'a, M: MemoryPort + ?Sized> AstInterpreter<'a, M> {
    pub fn new(state: &'a mut CpuState, mem: &'a mut M, next_ip: u16) -> Self {
        Self {
            state,
            mem,
            next_ip,
            vars: HashMap::new(),
        }
    }

    /// Runs a statement tree to completion.
    pub fn run(&mut self, stmt: &StmtNode) -> Result<(), AstError> {
        stmt.accept(self).map(|_| ())
    }

    fn eval(&mut self, value: &ValueNode) -> Result<u64, AstError> {
        value
            .accept(self)?
            .ok_or(AstError::Unsupported("value position"))
    }

    fn eval_bool(&mut self, value: &ValueNode) -> Result<bool, AstError> {
        Ok(self.eval(value)? != 0)
    }

    fn helper(&mut self) -> ExecutionHelper<'_, M> {
        ExecutionHelper::new(self.state, self.mem)
    }

    fn pointer_addr(
        &mut self,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<u32, AstError> {
        let seg = self.eval(segment)? as u16;
        let off = self.eval(offset)? as u32;
        Ok(((seg as u32) << 4).wrapping_add(off) & 0xF_FFFF)
    }

    fn write_target(&mut self, target: &ValueNode, value: u64) -> Result<(), AstError> {
        match target {
            ValueNode::Register(index, ty) => {
                self.state.set_reg(width_of(*ty), *index, value);
                Ok(())
            }
            ValueNode::SegmentRegister(index) => {
                self.state
                    .set_seg(SegReg::from_index(*index), value as u16);
                Ok(())
            }
            ValueNode::CpuFlag(mask) => {
                let flags = Flags::from_bits_retain(*mask);
                self.state.flags_mut().set(flags, value != 0);
                Ok(())
            }
            ValueNode::AbsolutePointer(ty, addr) => {
                let addr = self.eval(addr)? as u32;
                self.mem.write_sized(addr, width_of(*ty), value);
                Ok(())
            }
            ValueNode::SegmentedPointer(ty, segment, offset) => {
                let addr = self.pointer_addr(segment, offset)?;
                self.mem.write_sized(addr, width_of(*ty), value);
                Ok(())
            }
            ValueNode::VariableReference(name, _) => {
                if !self.vars.contains_key(name) {
                    return Err(AstError::UnknownVariable(name.clone()));
                }
                self.vars.insert(name.clone(), value);
                Ok(())
            }
            _ => Err(AstError::BadAssignTarget),
        }
    }

    fn intrinsic_value(&mut self, name: &str, args: &[u64]) -> Result<u64, AstError> {
        if let Some((op, w)) = parse_alu_name(name) {
            let state = &mut *self.state;
            return match op {
                AluName::Bin(op) => alu_apply(state, op, w, args[0], args[1])
                    .ok_or_else(|| AstError::UnknownMethod(name.to_owned())),
                AluName::Shift(op) => Ok(apply_shift(state, op, w, args[0], args[1] as u8)),
                AluName::Inc => Ok(alu::inc(state, w, args[0])),
                AluName::Dec => Ok(alu::dec(state, w, args[0])),
                AluName::Neg => Ok(alu::neg(state, w, args[0])),
                _ => Err(AstError::UnknownMethod(name.to_owned())),
            };
        }
        match name {
            "stack.pop16" => Ok(self.helper().pop16() as u64),
            "stack.pop32" => Ok(self.helper().pop32() as u64),
            _ => Err(AstError::UnknownMethod(name.to_owned())),
        }
    }

    fn intrinsic_effect(&mut self, name: &str, args: &[u64]) -> Result<(), AstError> {
        if let Some((op, w)) = parse_alu_name(name) {
            match op {
                AluName::Cmp => {
                    alu::cmp(self.state, w, args[0], args[1]);
                    return Ok(());
                }
                AluName::Test => {
                    alu::test(self.state, w, args[0], args[1]);
                    return Ok(());
                }
                AluName::Mul | AluName::Imul => {
                    let a = self.state.reg(w, 0);
                    let (lo, hi) = if matches!(op, AluName::Mul) {
                        alu::mul(self.state, w, a, args[0])
                    } else {
                        alu::imul(self.state, w, a, args[0])
                    };
                    crate::exec::write_wide_result(self.state, w, lo, hi);
                    return Ok(());
                }
                AluName::Div | AluName::Idiv => {
                    let (hi, lo) = crate::exec::read_wide_dividend(self.state, w);
                    let result = if matches!(op, AluName::Div) {
                        alu::div(w, hi, lo, args[0])
                    } else {
                        alu::idiv(w, hi, lo, args[0])
                    };
                    let (q, r) = result.map_err(AstError::Exception)?;
                    crate::exec::write_div_result(self.state, w, q, r);
                    return Ok(());
                }
                // A value intrinsic in effect position still runs for its
                // flag updates.
                _ => {
                    self.intrinsic_value(name, args)?;
                    return Ok(());
                }
            }
        }
        match name {
            "stack.push16" => {
                self.helper().push16(args[0] as u16);
                Ok(())
            }
            "stack.push32" => {
                self.helper().push32(args[0] as u32);
                Ok(())
            }
            "stack.pushf16" => {
                let image = self.state.flags16();
                self.helper().push16(image);
                Ok(())
            }
            "stack.popf16" => {
                let image = self.helper().pop16();
                self.state.set_flags16(image);
                Ok(())
            }
            "stack.pushf32" => {
                let bits = self.state.flags().bits();
                self.helper().push32(bits);
                Ok(())
            }
            "stack.popf32" => {
                let bits = self.helper().pop32();
                self.state.set_flags16(bits as u16);
                Ok(())
            }
            "flags.lahf" => {
                let image = self.state.flags16() as u8;
                self.state.set_ah(image);
                Ok(())
            }
            "flags.sahf" => {
                let image = (self.state.flags16() & 0xFF00) | self.state.ah() as u16;
                self.state.set_flags16(image);
                Ok(())
            }
            "cpu.halt" => {
                self.state.set_running(false);
                Ok(())
            }
            _ => Err(AstError::UnknownMethod(name.to_owned())),
        }
    }
}

enum AluName {
    Bin(AluOp),
    Shift(ShiftOp),
    Inc,
    Dec,
    Neg,
    Cmp,
    Test,
    Mul,
    Imul,
    Div,
    Idiv,
}

/// Splits `alu.<op><width>` intrinsic names.
fn parse_alu_name(name: &str) -> Option<(AluName, Width)> {
    let rest = name.strip_prefix("alu.")?;
    let split = rest.find(|c: char| c.is_ascii_digit())?;
    let (op, digits) = rest.split_at(split);
    let w = match digits {
        "8" => Width::W8,
        "16" => Width::W16,
        "32" => Width::W32,
        _ => return None,
    };
    let op = match op {
        "add" => AluName::Bin(AluOp::Add),
        "or" => AluName::Bin(AluOp::Or),
        "adc" => AluName::Bin(AluOp::Adc),
        "sbb" => AluName::Bin(AluOp::Sbb),
        "and" => AluName::Bin(AluOp::And),
        "sub" => AluName::Bin(AluOp::Sub),
        "xor" => AluName::Bin(AluOp::Xor),
        "rol" => AluName::Shift(ShiftOp::Rol),
        "ror" => AluName::Shift(ShiftOp::Ror),
        "rcl" => AluName::Shift(ShiftOp::Rcl),
        "rcr" => AluName::Shift(ShiftOp::Rcr),
        "shl" => AluName::Shift(ShiftOp::Shl),
        "shr" => AluName::Shift(ShiftOp::Shr),
        "sar" => AluName::Shift(ShiftOp::Sar),
        "inc" => AluName::Inc,
        "dec" => AluName::Dec,
        "neg" => AluName::Neg,
        "cmp" => AluName::Cmp,
        "test" => AluName::Test,
        "mul" => AluName::Mul,
        "imul" => AluName::Imul,
        "div" => AluName::Div,
        "idiv" => AluName::Idiv,
        _ => return None,
    };
    Some((op, w))
}

impl<M: MemoryPort + ?Sized> AstVisitor for AstInterpreter<'_, M> {
    /// `Some` for value nodes, `None` for statements.
    type Output = Option<u64>;

    fn visit_constant(&mut self, ty: DataType, value: u64) -> Result<Self::Output, AstError> {
        Ok(Some(ty.normalize(value)))
    }

    fn visit_register(&mut self, index: u8, ty: DataType) -> Result<Self::Output, AstError> {
        Ok(Some(ty.normalize(self.state.reg(width_of(ty), index))))
    }

    fn visit_segment_register(&mut self, index: u8) -> Result<Self::Output, AstError> {
        Ok(Some(self.state.seg(SegReg::from_index(index)) as u64))
    }

    fn visit_cpu_flag(&mut self, mask: u32) -> Result<Self::Output, AstError> {
        Ok(Some((self.state.flags().bits() & mask != 0) as u64))
    }

    fn visit_absolute_pointer(
        &mut self,
        ty: DataType,
        addr: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let addr = self.eval(addr)? as u32;
        Ok(Some(ty.normalize(self.mem.read_sized(addr, width_of(ty)))))
    }

    fn visit_segmented_pointer(
        &mut self,
        ty: DataType,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let addr = self.pointer_addr(segment, offset)?;
        Ok(Some(ty.normalize(self.mem.read_sized(addr, width_of(ty)))))
    }

    fn visit_variable_reference(
        &mut self,
        name: &str,
        ty: DataType,
    ) -> Result<Self::Output, AstError> {
        let value = self
            .vars
            .get(name)
            .copied()
            .ok_or_else(|| AstError::UnknownVariable(name.to_owned()))?;
        Ok(Some(ty.normalize(value)))
    }

    fn visit_binary_op(
        &mut self,
        ty: DataType,
        left: &ValueNode,
        op: BinOp,
        right: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        if op == BinOp::Assign {
            let value = self.eval(right)?;
            let value = ty.normalize(value);
            self.write_target(left, value)?;
            return Ok(Some(value));
        }
        let a = self.eval(left)?;
        let b = self.eval(right)?;
        let result = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(AstError::Exception(
                        crate::error::CpuException::division_error(),
                    ));
                }
                a / b
            }
            BinOp::Rem => {
                if b == 0 {
                    return Err(AstError::Exception(
                        crate::error::CpuException::division_error(),
                    ));
                }
                a % b
            }
            BinOp::Eq => (a == b) as u64,
            BinOp::Ne => (a != b) as u64,
            BinOp::Lt => ((a as i64) < b as i64) as u64,
            BinOp::Gt => (a as i64 > b as i64) as u64,
            BinOp::Le => (a as i64 <= b as i64) as u64,
            BinOp::Ge => (a as i64 >= b as i64) as u64,
            BinOp::LogicalAnd => (a != 0 && b != 0) as u64,
            BinOp::LogicalOr => (a != 0 || b != 0) as u64,
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32),
            BinOp::Shr => {
                if ty.signed {
                    ((a as i64).wrapping_shr(b as u32)) as u64
                } else {
                    (a & ty.width.mask()).wrapping_shr(b as u32)
                }
            }
            BinOp::Assign => unreachable!(),
        };
        Ok(Some(ty.normalize(result)))
    }

    fn visit_unary_op(
        &mut self,
        ty: DataType,
        op: UnOp,
        value: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let v = self.eval(value)?;
        let result = match op {
            UnOp::Neg => v.wrapping_neg(),
            UnOp::Not => !v,
            UnOp::LogicalNot => (v == 0) as u64,
        };
        Ok(Some(ty.normalize(result)))
    }

    fn visit_type_conversion(
        &mut self,
        ty: DataType,
        value: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let v = self.eval(value)?;
        Ok(Some(ty.normalize(v)))
    }

    fn visit_method_call_value(
        &mut self,
        name: &str,
        args: &[ValueNode],
    ) -> Result<Self::Output, AstError> {
        let args = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;
        self.intrinsic_value(name, &args).map(Some)
    }

    fn visit_block(&mut self, stmts: &[StmtNode]) -> Result<Self::Output, AstError> {
        for stmt in stmts {
            stmt.accept(self)?;
        }
        Ok(None)
    }

    fn visit_if_else(
        &mut self,
        cond: &ValueNode,
        then: &StmtNode,
        otherwise: Option<&StmtNode>,
    ) -> Result<Self::Output, AstError> {
        if self.eval_bool(cond)? {
            then.accept(self)?;
        } else if let Some(otherwise) = otherwise {
            otherwise.accept(self)?;
        }
        Ok(None)
    }

    fn visit_variable_declaration(
        &mut self,
        name: &str,
        ty: DataType,
        init: Option<&ValueNode>,
    ) -> Result<Self::Output, AstError> {
        let value = match init {
            Some(init) => ty.normalize(self.eval(init)?),
            None => 0,
        };
        self.vars.insert(name.to_owned(), value);
        Ok(None)
    }

    fn visit_method_call(
        &mut self,
        name: &str,
        args: &[ValueNode],
    ) -> Result<Self::Output, AstError> {
        let args = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;
        self.intrinsic_effect(name, &args)?;
        Ok(None)
    }

    fn visit_expr(&mut self, value: &ValueNode) -> Result<Self::Output, AstError> {
        self.eval(value)?;
        Ok(None)
    }

    fn visit_move_ip_next(&mut self) -> Result<Self::Output, AstError> {
        self.state.set_ip(self.next_ip);
        Ok(None)
    }

    fn visit_call_near(&mut self, target: &ValueNode) -> Result<Self::Output, AstError> {
        let target = self.eval(target)? as u16;
        let ret = self.next_ip;
        self.helper().push16(ret);
        self.state.set_ip(target);
        Ok(None)
    }

    fn visit_call_far(
        &mut self,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let seg = self.eval(segment)? as u16;
        let off = self.eval(offset)? as u16;
        let cs = self.state.seg(SegReg::Cs);
        let ret = self.next_ip;
        let mut h = self.helper();
        h.push16(cs);
        h.push16(ret);
        self.state.set_seg(SegReg::Cs, seg);
        self.state.set_ip(off);
        Ok(None)
    }

    fn visit_return_near(&mut self, pop: Option<&ValueNode>) -> Result<Self::Output, AstError> {
        let ip = self.helper().pop16();
        if let Some(pop) = pop {
            let extra = self.eval(pop)? as u16;
            let sp = self.state.sp().wrapping_add(extra);
            self.state.set_sp(sp);
        }
        self.state.set_ip(ip);
        Ok(None)
    }

    fn visit_return_far(&mut self, pop: Option<&ValueNode>) -> Result<Self::Output, AstError> {
        let mut h = self.helper();
        let ip = h.pop16();
        let cs = h.pop16();
        if let Some(pop) = pop {
            let extra = self.eval(pop)? as u16;
            let sp = self.state.sp().wrapping_add(extra);
            self.state.set_sp(sp);
        }
        self.state.set_seg(SegReg::Cs, cs);
        self.state.set_ip(ip);
        Ok(None)
    }

    fn visit_jump_near(&mut self, target: &ValueNode) -> Result<Self::Output, AstError> {
        let target = self.eval(target)? as u16;
        self.state.set_ip(target);
        Ok(None)
    }

    fn visit_jump_far(
        &mut self,
        segment: &ValueNode,
        offset: &ValueNode,
    ) -> Result<Self::Output, AstError> {
        let seg = self.eval(segment)? as u16;
        let off = self.eval(offset)? as u16;
        self.state.set_seg(SegReg::Cs, seg);
        self.state.set_ip(off);
        Ok(None)
    }

    fn visit_interrupt_call(&mut self, vector: &ValueNode) -> Result<Self::Output, AstError> {
        let vector = self.eval(vector)? as u8;
        let ret = self.next_ip;
        let target = self.helper().interrupt_entry(vector, ret);
        self.state.set_seg(SegReg::Cs, target.segment);
        self.state.set_ip(target.offset);
        Ok(None)
    }

    fn visit_return_interrupt(&mut self) -> Result<Self::Output, AstError> {
        let mut h = self.helper();
        let ip = h.pop16();
        let cs = h.pop16();
        let flags = h.pop16();
        self.state.set_flags16(flags);
        self.state.set_seg(SegReg::Cs, cs);
        self.state.set_ip(ip);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstBuilder;
    use crate::mem::FlatMemory;
    use crate::parser::Parser;
    use crate::SegmentedAddress;

    fn run_ast(bytes: &[u8], prepare: impl FnOnce(&mut CpuState, &mut FlatMemory)) -> CpuState {
        let mut state = CpuState::new();
        let mut mem = FlatMemory::new(0x10_0000);
        state.set_seg(SegReg::Cs, 0x1000);
        state.set_seg(SegReg::Ds, 0x2000);
        state.set_seg(SegReg::Ss, 0x4000);
        state.set_sp(0x0100);
        mem.load_bytes(0x10000, bytes);
        prepare(&mut state, &mut mem);
        let inst = Parser::new()
            .parse(&mem, SegmentedAddress::new(0x1000, 0))
            .unwrap();
        let ast = inst.generate_execution_ast(&AstBuilder::new());
        let next = inst.next_address().offset;
        AstInterpreter::new(&mut state, &mut mem, next)
            .run(&ast)
            .unwrap();
        state
    }

    #[test]
    fn mov_through_ast() {
        let state = run_ast(&[0xB8, 0x34, 0x12], |_, _| {});
        assert_eq!(state.ax(), 0x1234);
        assert_eq!(state.ip(), 3);
    }

    #[test]
    fn add_updates_flags_through_ast() {
        let state = run_ast(&[0x05, 0x01, 0x00], |s, _| s.set_ax(0xFFFF)); // add ax, 1
        assert_eq!(state.ax(), 0);
        assert!(state.zero());
        assert!(state.carry());
    }

    #[test]
    fn conditional_jump_through_ast() {
        let state = run_ast(&[0x74, 0x10], |s, _| s.set_zero(true));
        assert_eq!(state.ip(), 0x12);
        let state = run_ast(&[0x74, 0x10], |s, _| s.set_zero(false));
        assert_eq!(state.ip(), 0x02);
    }

    #[test]
    fn xchg_uses_declared_temp() {
        let state = run_ast(&[0x87, 0xD8], |s, _| {
            // xchg ax, bx
            s.set_ax(1);
            s.set_bx(2);
        });
        assert_eq!(state.ax(), 2);
        assert_eq!(state.bx(), 1);
    }

    #[test]
    fn push_pop_through_ast() {
        let state = run_ast(&[0x50], |s, _| s.set_ax(0xBEEF)); // push ax
        assert_eq!(state.sp(), 0x00FE);
        let state = run_ast(&[0x58], |s, m| {
            // pop ax
            s.set_sp(0x00FE);
            m.write_u16(0x400FE, 0xCAFE);
        });
        assert_eq!(state.ax(), 0xCAFE);
        assert_eq!(state.sp(), 0x0100);
    }

    #[test]
    fn division_error_surfaces_as_exception() {
        let mut state = CpuState::new();
        let mut mem = FlatMemory::new(0x10_0000);
        state.set_seg(SegReg::Cs, 0x1000);
        mem.load_bytes(0x10000, &[0xF7, 0xF1]); // div cx
        state.set_ax(1);
        state.set_cx(0);
        let inst = Parser::new()
            .parse(&mem, SegmentedAddress::new(0x1000, 0))
            .unwrap();
        let ast = inst.generate_execution_ast(&AstBuilder::new());
        let err = AstInterpreter::new(&mut state, &mut mem, 2)
            .run(&ast)
            .unwrap_err();
        assert_eq!(
            err,
            AstError::Exception(crate::error::CpuException::division_error())
        );
    }
}
