//! Imperative executors for every catalog operation.
//!
//! Each arm mutates the machine through the [`ExecutionHelper`] and
//! reports how control leaves the instruction. The AST lowering in
//! `ast::lower` expresses the same effects declaratively; the two are kept
//! equivalent by a sampled property test.

use crate::alu;
use crate::error::CpuException;
use crate::exec::helper::{ExecutionHelper, Transition};
use crate::inst::{
    AluForm, AluOp, Grp3Op, Grp45Op, LoopKind, Op, ParsedInstruction, RepKind, ShiftCount,
    ShiftOp, StringOp,
};
use crate::mem::MemoryPort;
use crate::state::{AddrWidth, CpuState, Gpr, SegReg, SegmentedAddress, Width};

/// Executes one parsed instruction against the machine.
pub fn execute<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
) -> Result<Transition, CpuException> {
    let w = inst.op_width();
    match *inst.op() {
        Op::MovRegImm { width, reg } => {
            let value = imm_val(inst, h);
            h.state.set_reg(width, reg, value);
            Ok(Transition::FallThrough)
        }
        Op::MovRmImm { width } => {
            let value = imm_val(inst, h);
            h.rm_write(inst.modrm().unwrap(), width, value);
            Ok(Transition::FallThrough)
        }
        Op::MovRmReg { width, to_reg } => {
            let modrm = inst.modrm().unwrap();
            if to_reg {
                let value = h.rm_read(modrm, width);
                h.reg_write(modrm, width, value);
            } else {
                let value = h.reg_read(modrm, width);
                h.rm_write(modrm, width, value);
            }
            Ok(Transition::FallThrough)
        }
        Op::MovSegRm { to_seg } => {
            let modrm = inst.modrm().unwrap();
            let seg = SegReg::from_index(modrm.reg);
            if to_seg {
                let value = h.rm_read(modrm, Width::W16) as u16;
                h.state.set_seg(seg, value);
            } else {
                let value = h.state.seg(seg);
                h.rm_write(modrm, Width::W16, value as u64);
            }
            Ok(Transition::FallThrough)
        }
        Op::MovAccMoffs { width, to_acc } => {
            let seg = h.data_segment(inst);
            let offset = imm_val(inst, h) as u32;
            let addr = linear(h.state.seg(seg), offset);
            if to_acc {
                let value = h.mem.read_sized(addr, width);
                h.state.set_reg(width, 0, value);
            } else {
                let value = h.state.reg(width, 0);
                h.mem.write_sized(addr, width, value);
            }
            Ok(Transition::FallThrough)
        }
        Op::Lea => {
            let modrm = inst.modrm().unwrap();
            let offset = modrm.effective_offset(h.state, h.mem);
            h.state.set_reg(w, modrm.reg, offset as u64);
            Ok(Transition::FallThrough)
        }
        Op::Lfp { seg } => {
            let modrm = inst.modrm().unwrap();
            let addr = h.effective_address(modrm);
            let offset = h.mem.read_sized(addr, w);
            let segment = h.mem.read_u16(addr.wrapping_add(w.bytes() as u32));
            h.state.set_reg(w, modrm.reg, offset);
            h.state.set_seg(seg, segment);
            Ok(Transition::FallThrough)
        }
        Op::Xchg { width } => {
            let modrm = inst.modrm().unwrap();
            let a = h.rm_read(modrm, width);
            let b = h.reg_read(modrm, width);
            h.rm_write(modrm, width, b);
            h.reg_write(modrm, width, a);
            Ok(Transition::FallThrough)
        }
        Op::XchgAccReg { reg } => {
            let a = h.state.reg(w, 0);
            let b = h.state.reg(w, reg);
            h.state.set_reg(w, 0, b);
            h.state.set_reg(w, reg, a);
            Ok(Transition::FallThrough)
        }
        Op::Xlat => {
            let seg = h.data_segment(inst);
            let offset = h.state.bx().wrapping_add(h.state.al() as u16);
            let addr = linear(h.state.seg(seg), offset as u32);
            let value = h.mem.read_u8(addr);
            h.state.set_al(value);
            Ok(Transition::FallThrough)
        }
        Op::Lahf => {
            let image = h.state.flags16() as u8;
            h.state.set_ah(image);
            Ok(Transition::FallThrough)
        }
        Op::Sahf => {
            let image = (h.state.flags16() & 0xFF00) | h.state.ah() as u16;
            h.state.set_flags16(image);
            Ok(Transition::FallThrough)
        }
        Op::Cbw => {
            match w {
                Width::W16 => {
                    let v = h.state.al() as i8 as i16;
                    h.state.set_ax(v as u16);
                }
                _ => {
                    let v = h.state.ax() as i16 as i32;
                    h.state.set_reg32(Gpr::Ax, v as u32);
                }
            }
            Ok(Transition::FallThrough)
        }
        Op::Cwd => {
            match w {
                Width::W16 => {
                    let fill = if h.state.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                    h.state.set_dx(fill);
                }
                _ => {
                    let fill = if h.state.reg32(Gpr::Ax) & 0x8000_0000 != 0 {
                        0xFFFF_FFFF
                    } else {
                        0
                    };
                    h.state.set_reg32(Gpr::Dx, fill);
                }
            }
            Ok(Transition::FallThrough)
        }

        Op::Alu { op, width, form } => {
            exec_alu(inst, h, op, width, form);
            Ok(Transition::FallThrough)
        }
        Op::TestRmReg { width } => {
            let modrm = inst.modrm().unwrap();
            let a = h.rm_read(modrm, width);
            let b = h.reg_read(modrm, width);
            alu::test(h.state, width, a, b);
            Ok(Transition::FallThrough)
        }
        Op::TestAccImm { width } => {
            let a = h.state.reg(width, 0);
            let b = imm_val(inst, h);
            alu::test(h.state, width, a, b);
            Ok(Transition::FallThrough)
        }
        Op::IncDecReg { width, reg, dec } => {
            let a = h.state.reg(width, reg);
            let r = if dec {
                alu::dec(h.state, width, a)
            } else {
                alu::inc(h.state, width, a)
            };
            h.state.set_reg(width, reg, r);
            Ok(Transition::FallThrough)
        }
        Op::Grp2 { op, width, count } => {
            let modrm = inst.modrm().unwrap();
            let n = match count {
                ShiftCount::One => 1,
                ShiftCount::Cl => h.state.reg8(1),
                ShiftCount::Imm => imm_val(inst, h) as u8,
            };
            let a = h.rm_read(modrm, width);
            let r = apply_shift(h.state, op, width, a, n);
            h.rm_write(modrm, width, r);
            Ok(Transition::FallThrough)
        }
        Op::Grp3 { op, width } => exec_grp3(inst, h, op, width),
        Op::Grp45 { op, width } => exec_grp45(inst, h, op, width),

        Op::PushReg { reg } => {
            let value = h.state.reg(w, reg);
            h.push(w, value);
            Ok(Transition::FallThrough)
        }
        Op::PopReg { reg } => {
            let value = h.pop(w);
            h.state.set_reg(w, reg, value);
            Ok(Transition::FallThrough)
        }
        Op::PushSeg { seg } => {
            let value = h.state.seg(seg);
            h.push16(value);
            Ok(Transition::FallThrough)
        }
        Op::PopSeg { seg } => {
            let value = h.pop16();
            h.state.set_seg(seg, value);
            Ok(Transition::FallThrough)
        }
        Op::PushImm { .. } => {
            let value = imm_val(inst, h);
            h.push(w, value);
            Ok(Transition::FallThrough)
        }
        Op::Pushf => {
            match w {
                Width::W32 => {
                    let bits = h.state.flags().bits();
                    h.push32(bits);
                }
                _ => {
                    let image = h.state.flags16();
                    h.push16(image);
                }
            }
            Ok(Transition::FallThrough)
        }
        Op::Popf => {
            match w {
                Width::W32 => {
                    let bits = h.pop32();
                    h.state.set_flags16(bits as u16);
                }
                _ => {
                    let image = h.pop16();
                    h.state.set_flags16(image);
                }
            }
            Ok(Transition::FallThrough)
        }

        Op::JmpShort | Op::JmpNear => Ok(Transition::Taken(rel_target(inst, h))),
        Op::JmpFar => Ok(Transition::Taken(far_target(inst, h))),
        Op::Jcc { cond, .. } => {
            if h.condition(cond) {
                Ok(Transition::Taken(rel_target(inst, h)))
            } else {
                Ok(Transition::FallThrough)
            }
        }
        Op::Loop { kind } => {
            let aw = inst.addr_width();
            let count = h.count_reg(aw).wrapping_sub(1);
            h.set_count_reg(aw, count);
            let mask = count_mask(aw);
            let go = count & mask != 0
                && match kind {
                    LoopKind::Loop => true,
                    LoopKind::Loope => h.state.zero(),
                    LoopKind::Loopne => !h.state.zero(),
                };
            if go {
                Ok(Transition::Taken(rel_target(inst, h)))
            } else {
                Ok(Transition::FallThrough)
            }
        }
        Op::Jcxz => {
            if h.count_reg(inst.addr_width()) == 0 {
                Ok(Transition::Taken(rel_target(inst, h)))
            } else {
                Ok(Transition::FallThrough)
            }
        }
        Op::CallNear => {
            let ret = inst.next_address().offset;
            h.push(w, ret as u64);
            Ok(Transition::Taken(rel_target(inst, h)))
        }
        Op::CallFar => {
            let next = inst.next_address();
            h.push16(next.segment);
            h.push16(next.offset);
            Ok(Transition::Taken(far_target(inst, h)))
        }
        Op::RetNear { pop } => {
            let ip = h.pop(w) as u16;
            if pop {
                let extra = imm_val(inst, h) as u16;
                let sp = h.state.sp().wrapping_add(extra);
                h.state.set_sp(sp);
            }
            let cs = h.state.seg(SegReg::Cs);
            Ok(Transition::Return(SegmentedAddress::new(cs, ip)))
        }
        Op::RetFar { pop } => {
            let ip = h.pop(w) as u16;
            let cs = h.pop16();
            if pop {
                let extra = imm_val(inst, h) as u16;
                let sp = h.state.sp().wrapping_add(extra);
                h.state.set_sp(sp);
            }
            Ok(Transition::Return(SegmentedAddress::new(cs, ip)))
        }
        Op::RetInterrupt => {
            let ip = h.pop16();
            let cs = h.pop16();
            let flags = h.pop16();
            h.state.set_flags16(flags);
            Ok(Transition::Return(SegmentedAddress::new(cs, ip)))
        }
        Op::Int { vector } => {
            let ret = inst.next_address().offset;
            let target = h.interrupt_entry(vector, ret);
            Ok(Transition::Taken(target))
        }
        Op::Into => {
            if h.state.overflow() {
                let ret = inst.next_address().offset;
                let target = h.interrupt_entry(4, ret);
                Ok(Transition::Taken(target))
            } else {
                Ok(Transition::FallThrough)
            }
        }

        Op::Str { op, width } => {
            exec_string(inst, h, op, width);
            Ok(Transition::FallThrough)
        }

        Op::Clc => {
            h.state.set_carry(false);
            Ok(Transition::FallThrough)
        }
        Op::Stc => {
            h.state.set_carry(true);
            Ok(Transition::FallThrough)
        }
        Op::Cmc => {
            let c = h.state.carry();
            h.state.set_carry(!c);
            Ok(Transition::FallThrough)
        }
        Op::Cld => {
            h.state.set_direction(false);
            Ok(Transition::FallThrough)
        }
        Op::Std => {
            h.state.set_direction(true);
            Ok(Transition::FallThrough)
        }
        Op::Cli => {
            h.state.set_interrupt(false);
            Ok(Transition::FallThrough)
        }
        Op::Sti => {
            h.state.set_interrupt(true);
            Ok(Transition::FallThrough)
        }
        Op::Nop => Ok(Transition::FallThrough),
        Op::Hlt => Ok(Transition::Halt),
        Op::Callback { index } => Ok(Transition::Callback { index }),
    }
}

fn linear(segment: u16, offset: u32) -> u32 {
    ((segment as u32) << 4).wrapping_add(offset) & 0xF_FFFF
}

fn count_mask(aw: AddrWidth) -> u64 {
    match aw {
        AddrWidth::A16 => 0xFFFF,
        AddrWidth::A32 => 0xFFFF_FFFF,
    }
}

/// Current value of the primary immediate (re-read from memory while the
/// field is non-final).
fn imm_val<M: MemoryPort + ?Sized>(inst: &ParsedInstruction, h: &ExecutionHelper<'_, M>) -> u64 {
    inst.imm().expect("operation carries an immediate").live_value(h.mem)
}

/// Target of a relative branch: next IP plus the displacement, 16-bit
/// wrapped within CS.
fn rel_target<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &ExecutionHelper<'_, M>,
) -> SegmentedAddress {
    let rel = imm_val(inst, h) as i64;
    let next = inst.next_address();
    SegmentedAddress::new(next.segment, next.offset.wrapping_add(rel as u16))
}

/// Target of a `ptr16:16` far transfer.
fn far_target<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &ExecutionHelper<'_, M>,
) -> SegmentedAddress {
    let offset = imm_val(inst, h) as u16;
    let segment = inst
        .imm2()
        .expect("far transfer carries a segment immediate")
        .live_value(h.mem) as u16;
    SegmentedAddress::new(segment, offset)
}

fn exec_alu<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
    op: AluOp,
    width: Width,
    form: AluForm,
) {
    match form {
        AluForm::RmReg { to_reg } => {
            let modrm = inst.modrm().unwrap();
            let rm = h.rm_read(modrm, width);
            let reg = h.reg_read(modrm, width);
            if to_reg {
                if let Some(r) = alu_apply(h.state, op, width, reg, rm) {
                    h.reg_write(modrm, width, r);
                }
            } else if let Some(r) = alu_apply(h.state, op, width, rm, reg) {
                h.rm_write(modrm, width, r);
            }
        }
        AluForm::AccImm => {
            let a = h.state.reg(width, 0);
            let b = imm_val(inst, h);
            if let Some(r) = alu_apply(h.state, op, width, a, b) {
                h.state.set_reg(width, 0, r);
            }
        }
        AluForm::RmImm { .. } => {
            let modrm = inst.modrm().unwrap();
            let a = h.rm_read(modrm, width);
            let b = imm_val(inst, h);
            if let Some(r) = alu_apply(h.state, op, width, a, b) {
                h.rm_write(modrm, width, r);
            }
        }
    }
}

/// Runs a two-operand ALU op; `None` means no write-back (CMP).
pub(crate) fn alu_apply(
    state: &mut CpuState,
    op: AluOp,
    width: Width,
    a: u64,
    b: u64,
) -> Option<u64> {
    match op {
        AluOp::Add => Some(alu::add(state, width, a, b)),
        AluOp::Or => Some(alu::or(state, width, a, b)),
        AluOp::Adc => Some(alu::adc(state, width, a, b)),
        AluOp::Sbb => Some(alu::sbb(state, width, a, b)),
        AluOp::And => Some(alu::and(state, width, a, b)),
        AluOp::Sub => Some(alu::sub(state, width, a, b)),
        AluOp::Xor => Some(alu::xor(state, width, a, b)),
        AluOp::Cmp => {
            alu::cmp(state, width, a, b);
            None
        }
    }
}

pub(crate) fn apply_shift(state: &mut CpuState, op: ShiftOp, width: Width, a: u64, n: u8) -> u64 {
    match op {
        ShiftOp::Rol => alu::rol(state, width, a, n),
        ShiftOp::Ror => alu::ror(state, width, a, n),
        ShiftOp::Rcl => alu::rcl(state, width, a, n),
        ShiftOp::Rcr => alu::rcr(state, width, a, n),
        ShiftOp::Shl => alu::shl(state, width, a, n),
        ShiftOp::Shr => alu::shr(state, width, a, n),
        ShiftOp::Sar => alu::sar(state, width, a, n),
    }
}

fn exec_grp3<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
    op: Grp3Op,
    width: Width,
) -> Result<Transition, CpuException> {
    let modrm = inst.modrm().unwrap();
    let rm = h.rm_read(modrm, width);
    match op {
        Grp3Op::TestImm => {
            let imm = imm_val(inst, h);
            alu::test(h.state, width, rm, imm);
        }
        Grp3Op::Not => {
            let r = alu::not(width, rm);
            h.rm_write(modrm, width, r);
        }
        Grp3Op::Neg => {
            let r = alu::neg(h.state, width, rm);
            h.rm_write(modrm, width, r);
        }
        Grp3Op::Mul | Grp3Op::Imul => {
            let a = h.state.reg(width, 0);
            let (lo, hi) = if op == Grp3Op::Mul {
                alu::mul(h.state, width, a, rm)
            } else {
                alu::imul(h.state, width, a, rm)
            };
            write_wide_result(h.state, width, lo, hi);
        }
        Grp3Op::Div | Grp3Op::Idiv => {
            let (hi, lo) = read_wide_dividend(h.state, width);
            let (q, r) = if op == Grp3Op::Div {
                alu::div(width, hi, lo, rm)?
            } else {
                alu::idiv(width, hi, lo, rm)?
            };
            write_div_result(h.state, width, q, r);
        }
    }
    Ok(Transition::FallThrough)
}

/// `lo:hi` into AX / DX:AX / EDX:EAX.
pub(crate) fn write_wide_result(state: &mut CpuState, width: Width, lo: u64, hi: u64) {
    match width {
        Width::W8 => state.set_ax(((hi as u16) << 8) | lo as u16),
        Width::W16 => {
            state.set_ax(lo as u16);
            state.set_dx(hi as u16);
        }
        Width::W32 => {
            state.set_reg32(Gpr::Ax, lo as u32);
            state.set_reg32(Gpr::Dx, hi as u32);
        }
    }
}

pub(crate) fn read_wide_dividend(state: &CpuState, width: Width) -> (u64, u64) {
    match width {
        Width::W8 => ((state.ah()) as u64, state.al() as u64),
        Width::W16 => (state.dx() as u64, state.ax() as u64),
        Width::W32 => (
            state.reg32(Gpr::Dx) as u64,
            state.reg32(Gpr::Ax) as u64,
        ),
    }
}

pub(crate) fn write_div_result(state: &mut CpuState, width: Width, quotient: u64, remainder: u64) {
    match width {
        Width::W8 => {
            state.set_al(quotient as u8);
            state.set_ah(remainder as u8);
        }
        Width::W16 => {
            state.set_ax(quotient as u16);
            state.set_dx(remainder as u16);
        }
        Width::W32 => {
            state.set_reg32(Gpr::Ax, quotient as u32);
            state.set_reg32(Gpr::Dx, remainder as u32);
        }
    }
}

fn exec_grp45<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
    op: Grp45Op,
    width: Width,
) -> Result<Transition, CpuException> {
    let modrm = inst.modrm().unwrap();
    match op {
        Grp45Op::IncRm | Grp45Op::DecRm => {
            let a = h.rm_read(modrm, width);
            let r = if op == Grp45Op::DecRm {
                alu::dec(h.state, width, a)
            } else {
                alu::inc(h.state, width, a)
            };
            h.rm_write(modrm, width, r);
            Ok(Transition::FallThrough)
        }
        Grp45Op::CallRm => {
            let target = h.rm_read(modrm, width) as u16;
            let ret = inst.next_address().offset;
            h.push(width, ret as u64);
            let cs = h.state.seg(SegReg::Cs);
            Ok(Transition::Taken(SegmentedAddress::new(cs, target)))
        }
        Grp45Op::JmpRm => {
            let target = h.rm_read(modrm, width) as u16;
            let cs = h.state.seg(SegReg::Cs);
            Ok(Transition::Taken(SegmentedAddress::new(cs, target)))
        }
        Grp45Op::CallFarRm => {
            let addr = h.effective_address(modrm);
            let offset = h.mem.read_sized(addr, width) as u16;
            let segment = h.mem.read_u16(addr.wrapping_add(width.bytes() as u32));
            let next = inst.next_address();
            h.push16(next.segment);
            h.push16(next.offset);
            Ok(Transition::Taken(SegmentedAddress::new(segment, offset)))
        }
        Grp45Op::JmpFarRm => {
            let addr = h.effective_address(modrm);
            let offset = h.mem.read_sized(addr, width) as u16;
            let segment = h.mem.read_u16(addr.wrapping_add(width.bytes() as u32));
            Ok(Transition::Taken(SegmentedAddress::new(segment, offset)))
        }
        Grp45Op::PushRm => {
            let value = h.rm_read(modrm, width);
            h.push(width, value);
            Ok(Transition::FallThrough)
        }
    }
}

fn exec_string<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
    op: StringOp,
    width: Width,
) {
    let aw = inst.addr_width();
    match inst.rep() {
        None => string_once(inst, h, op, width),
        Some(kind) => loop {
            let count = h.count_reg(aw);
            if count == 0 {
                break;
            }
            string_once(inst, h, op, width);
            h.set_count_reg(aw, count.wrapping_sub(1) & count_mask(aw));
            // REPE/REPNE polarity only applies to the comparing ops.
            if matches!(op, StringOp::Cmps | StringOp::Scas) {
                let stop = match kind {
                    RepKind::Rep => !h.state.zero(),
                    RepKind::Repne => h.state.zero(),
                };
                if stop {
                    break;
                }
            }
        },
    }
}

fn string_once<M: MemoryPort + ?Sized>(
    inst: &ParsedInstruction,
    h: &mut ExecutionHelper<'_, M>,
    op: StringOp,
    width: Width,
) {
    let src_seg = h.data_segment(inst);
    let src = linear(h.state.seg(src_seg), h.state.si() as u32);
    let dst = linear(h.state.seg(SegReg::Es), h.state.di() as u32);
    let step = width.bytes();
    let aw = inst.addr_width();
    match op {
        StringOp::Movs => {
            let value = h.mem.read_sized(src, width);
            h.mem.write_sized(dst, width, value);
            h.advance_index(Gpr::Si, step, aw);
            h.advance_index(Gpr::Di, step, aw);
        }
        StringOp::Cmps => {
            let a = h.mem.read_sized(src, width);
            let b = h.mem.read_sized(dst, width);
            alu::cmp(h.state, width, a, b);
            h.advance_index(Gpr::Si, step, aw);
            h.advance_index(Gpr::Di, step, aw);
        }
        StringOp::Stos => {
            let value = h.state.reg(width, 0);
            h.mem.write_sized(dst, width, value);
            h.advance_index(Gpr::Di, step, aw);
        }
        StringOp::Lods => {
            let value = h.mem.read_sized(src, width);
            h.state.set_reg(width, 0, value);
            h.advance_index(Gpr::Si, step, aw);
        }
        StringOp::Scas => {
            let a = h.state.reg(width, 0);
            let b = h.mem.read_sized(dst, width);
            alu::cmp(h.state, width, a, b);
            h.advance_index(Gpr::Di, step, aw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatMemory;
    use crate::parser::Parser;

    fn setup(bytes: &[u8]) -> (CpuState, FlatMemory, ParsedInstruction) {
        let mut state = CpuState::new();
        let mut mem = FlatMemory::new(0x10_0000);
        state.set_seg(SegReg::Cs, 0x1000);
        state.set_seg(SegReg::Ds, 0x2000);
        state.set_seg(SegReg::Es, 0x3000);
        state.set_seg(SegReg::Ss, 0x4000);
        state.set_sp(0x0100);
        mem.load_bytes(0x10000, bytes);
        let inst = Parser::new()
            .parse(&mem, SegmentedAddress::new(0x1000, 0))
            .unwrap();
        (state, mem, inst)
    }

    fn run(state: &mut CpuState, mem: &mut FlatMemory, inst: &ParsedInstruction) -> Transition {
        let mut h = ExecutionHelper::new(state, mem);
        execute(inst, &mut h).unwrap()
    }

    #[test]
    fn mov_ax_imm() {
        let (mut state, mut mem, inst) = setup(&[0xB8, 0x34, 0x12]);
        let t = run(&mut state, &mut mem, &inst);
        assert_eq!(t, Transition::FallThrough);
        assert_eq!(state.ax(), 0x1234);
    }

    #[test]
    fn add_mem_reg() {
        let (mut state, mut mem, inst) = setup(&[0x01, 0x1E, 0x00, 0x05]); // add [0x500], bx
        state.set_bx(0x0101);
        mem.write_u16(0x20500, 0x0F0F);
        run(&mut state, &mut mem, &inst);
        assert_eq!(mem.read_u16(0x20500), 0x1010);
        assert!(!state.carry());
    }

    #[test]
    fn cmp_does_not_write_back() {
        let (mut state, mut mem, inst) = setup(&[0x39, 0xD8]); // cmp ax, bx
        state.set_ax(5);
        state.set_bx(5);
        run(&mut state, &mut mem, &inst);
        assert!(state.zero());
        assert_eq!(state.ax(), 5);
    }

    #[test]
    fn conditional_jump_taken_and_not() {
        let (mut state, mut mem, inst) = setup(&[0x74, 0x10]); // je +0x10
        state.set_zero(true);
        assert_eq!(
            run(&mut state, &mut mem, &inst),
            Transition::Taken(SegmentedAddress::new(0x1000, 0x0012))
        );
        state.set_zero(false);
        assert_eq!(run(&mut state, &mut mem, &inst), Transition::FallThrough);
    }

    #[test]
    fn call_pushes_return() {
        let (mut state, mut mem, inst) = setup(&[0xE8, 0x10, 0x00]); // call +0x10
        let t = run(&mut state, &mut mem, &inst);
        assert_eq!(t, Transition::Taken(SegmentedAddress::new(0x1000, 0x0013)));
        assert_eq!(state.sp(), 0x00FE);
        assert_eq!(mem.read_u16(0x400FE), 0x0003);
    }

    #[test]
    fn ret_pops_target() {
        let (mut state, mut mem, inst) = setup(&[0xC3]);
        state.set_sp(0x00FE);
        mem.write_u16(0x400FE, 0x1234);
        let t = run(&mut state, &mut mem, &inst);
        assert_eq!(t, Transition::Return(SegmentedAddress::new(0x1000, 0x1234)));
        assert_eq!(state.sp(), 0x0100);
    }

    #[test]
    fn div_by_zero_raises() {
        let (mut state, mut mem, inst) = setup(&[0xF7, 0xF1]); // div cx
        state.set_ax(1);
        state.set_cx(0);
        let mut h = ExecutionHelper::new(&mut state, &mut mem);
        let err = execute(&inst, &mut h).unwrap_err();
        assert_eq!(err, CpuException::division_error());
    }

    #[test]
    fn mul_widens_into_dx_ax() {
        let (mut state, mut mem, inst) = setup(&[0xF7, 0xE1]); // mul cx
        state.set_ax(0x8000);
        state.set_cx(0x0004);
        run(&mut state, &mut mem, &inst);
        assert_eq!(state.ax(), 0x0000);
        assert_eq!(state.dx(), 0x0002);
        assert!(state.carry());
    }

    #[test]
    fn rep_movsb_copies_and_advances() {
        let (mut state, mut mem, inst) = setup(&[0xF3, 0xA4]); // rep movsb
        state.set_cx(4);
        state.set_si(0x0010);
        state.set_di(0x0020);
        mem.load_bytes(0x20010, b"ABCD");
        run(&mut state, &mut mem, &inst);
        assert_eq!(state.cx(), 0);
        assert_eq!(state.si(), 0x0014);
        assert_eq!(state.di(), 0x0024);
        assert_eq!(mem.read_span(0x30020, 4), b"ABCD");
    }

    #[test]
    fn repne_scasb_stops_on_match() {
        let (mut state, mut mem, inst) = setup(&[0xF2, 0xAE]); // repne scasb
        state.set_al(b'C');
        state.set_cx(10);
        state.set_di(0x0000);
        mem.load_bytes(0x30000, b"ABCDEF");
        run(&mut state, &mut mem, &inst);
        // Stopped after comparing 'C' (three iterations).
        assert_eq!(state.di(), 0x0003);
        assert_eq!(state.cx(), 7);
        assert!(state.zero());
    }

    #[test]
    fn int_pushes_frame_and_vectors() {
        let (mut state, mut mem, inst) = setup(&[0xCD, 0x03]);
        mem.set_ivt_entry(3, SegmentedAddress::new(0xF000, 0x0100));
        state.set_interrupt(true);
        state.set_trap(true);
        let t = run(&mut state, &mut mem, &inst);
        assert_eq!(t, Transition::Taken(SegmentedAddress::new(0xF000, 0x0100)));
        assert!(!state.interrupt());
        assert!(!state.trap());
        assert_eq!(state.sp(), 0x00FA);
        assert_eq!(mem.read_u16(0x400FA), 0x0002); // return IP past CD 03
    }

    #[test]
    fn iret_restores_flags() {
        let (mut state, mut mem, inst) = setup(&[0xCF]);
        state.set_sp(0x00FA);
        mem.write_u16(0x400FA, 0x0002); // IP
        mem.write_u16(0x400FC, 0x1000); // CS
        mem.write_u16(0x400FE, 0x0202); // FLAGS with IF
        let t = run(&mut state, &mut mem, &inst);
        assert_eq!(t, Transition::Return(SegmentedAddress::new(0x1000, 0x0002)));
        assert!(state.interrupt());
        assert_eq!(state.sp(), 0x0100);
    }

    #[test]
    fn xlat_translates_through_bx() {
        let (mut state, mut mem, inst) = setup(&[0xD7]);
        state.set_bx(0x0100);
        state.set_al(0x05);
        mem.write_u8(0x20105, 0x7E);
        run(&mut state, &mut mem, &inst);
        assert_eq!(state.al(), 0x7E);
    }

    #[test]
    fn les_loads_pointer_and_segment() {
        let (mut state, mut mem, inst) = setup(&[0xC4, 0x1E, 0x00, 0x06]); // les bx, [0x600]
        mem.write_u16(0x20600, 0xBEEF);
        mem.write_u16(0x20602, 0x5000);
        run(&mut state, &mut mem, &inst);
        assert_eq!(state.bx(), 0xBEEF);
        assert_eq!(state.seg(SegReg::Es), 0x5000);
    }

    #[test]
    fn shifts_through_modrm() {
        let (mut state, mut mem, inst) = setup(&[0xD1, 0xE3]); // shl bx, 1
        state.set_bx(0x8001);
        run(&mut state, &mut mem, &inst);
        assert_eq!(state.bx(), 0x0002);
        assert!(state.carry());
    }

    #[test]
    fn loop_decrements_and_branches() {
        let (mut state, mut mem, inst) = setup(&[0xE2, 0xFE]); // loop $
        state.set_cx(2);
        assert_eq!(
            run(&mut state, &mut mem, &inst),
            Transition::Taken(SegmentedAddress::new(0x1000, 0x0000))
        );
        assert_eq!(state.cx(), 1);
        assert_eq!(run(&mut state, &mut mem, &inst), Transition::FallThrough);
        assert_eq!(state.cx(), 0);
    }

    #[test]
    fn callback_surfaces_index() {
        let (mut state, mut mem, inst) = setup(&[0xFE, 0x38, 0x42]);
        assert_eq!(
            run(&mut state, &mut mem, &inst),
            Transition::Callback { index: 0x42 }
        );
    }
}
