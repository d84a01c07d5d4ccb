//! Lowering of parsed instructions into the AST: the disassembly form and
//! the execution form, kept adjacent per operation.

use crate::ast::{AstBuilder, BinOp, StmtNode, UnOp, ValueNode};
use crate::dtype::{BitWidth, DataType};
use crate::inst::{
    AluForm, AluOp, Grp3Op, Grp45Op, LoopKind, Op, ParsedInstruction, RepKind, ShiftCount,
    StringOp,
};
use crate::modrm::{MemoryOffset16, MemoryOffset32, MemoryOffsetKind, ModRmContext};
use crate::state::{Flags, Gpr, SegReg, Width};

fn w_suffix(width: Width) -> &'static str {
    match width {
        Width::W8 => "8",
        Width::W16 => "16",
        Width::W32 => "32",
    }
}

fn stack_suffix(width: Width) -> &'static str {
    match width {
        Width::W32 => "32",
        _ => "16",
    }
}

impl ParsedInstruction {
    /// The disassembly form: one [`StmtNode::Instruction`] naming the
    /// operation with operand sub-trees.
    ///
    /// # Examples
    /// ```
    /// use cfg86::{AstBuilder, Parser, SegmentedAddress};
    /// let inst = Parser::new()
    ///     .parse_slice(&[0xB8, 0x34, 0x12], SegmentedAddress::new(0x1000, 0))
    ///     .unwrap();
    /// let ast = inst.to_instruction_ast(&AstBuilder::new());
    /// assert_eq!(ast.to_string(), "mov ax, 0x1234");
    /// ```
    pub fn to_instruction_ast(&self, b: &AstBuilder) -> StmtNode {
        let w = self.op_width();
        match *self.op() {
            Op::MovRegImm { width, reg } => {
                b.inst("mov", vec![b.reg(reg, width), self.imm_operand(b)])
            }
            Op::MovRmImm { width } => b.inst(
                "mov",
                vec![self.rm_operand(width, b), self.imm_operand(b)],
            ),
            Op::MovRmReg { width, to_reg } => {
                let rm = self.rm_operand(width, b);
                let reg = self.reg_operand(width, b);
                if to_reg {
                    b.inst("mov", vec![reg, rm])
                } else {
                    b.inst("mov", vec![rm, reg])
                }
            }
            Op::MovSegRm { to_seg } => {
                let modrm = self.modrm().unwrap();
                let seg = b.seg(SegReg::from_index(modrm.reg));
                let rm = self.rm_operand(Width::W16, b);
                if to_seg {
                    b.inst("mov", vec![seg, rm])
                } else {
                    b.inst("mov", vec![rm, seg])
                }
            }
            Op::MovAccMoffs { width, to_acc } => {
                let mem = self.moffs_operand(width, b);
                let acc = b.reg(0, width);
                if to_acc {
                    b.inst("mov", vec![acc, mem])
                } else {
                    b.inst("mov", vec![mem, acc])
                }
            }
            Op::Lea => b.inst(
                "lea",
                vec![
                    self.reg_operand(w, b),
                    self.rm_operand(w, b),
                ],
            ),
            Op::Lfp { seg } => {
                let name = if seg == SegReg::Es { "les" } else { "lds" };
                b.inst(name, vec![self.reg_operand(w, b), self.rm_operand(w, b)])
            }
            Op::Xchg { width } => b.inst(
                "xchg",
                vec![self.rm_operand(width, b), self.reg_operand(width, b)],
            ),
            Op::XchgAccReg { reg } => b.inst("xchg", vec![b.reg(0, w), b.reg(reg, w)]),
            Op::Xlat => b.inst("xlat", vec![]),
            Op::Lahf => b.inst("lahf", vec![]),
            Op::Sahf => b.inst("sahf", vec![]),
            Op::Cbw => b.inst(if w == Width::W16 { "cbw" } else { "cwde" }, vec![]),
            Op::Cwd => b.inst(if w == Width::W16 { "cwd" } else { "cdq" }, vec![]),
            Op::Alu { op, width, form } => {
                let (dst, src) = self.alu_operands(op, width, form, b);
                b.inst(op.mnemonic(), vec![dst, src])
            }
            Op::TestRmReg { width } => b.inst(
                "test",
                vec![self.rm_operand(width, b), self.reg_operand(width, b)],
            ),
            Op::TestAccImm { width } => {
                b.inst("test", vec![b.reg(0, width), self.imm_operand(b)])
            }
            Op::IncDecReg { width, reg, dec } => {
                b.inst(if dec { "dec" } else { "inc" }, vec![b.reg(reg, width)])
            }
            Op::Grp2 { op, width, count } => {
                let count = self.shift_count_operand(count, b);
                b.inst(op.mnemonic(), vec![self.rm_operand(width, b), count])
            }
            Op::Grp3 { op, width } => match op {
                Grp3Op::TestImm => b.inst(
                    "test",
                    vec![self.rm_operand(width, b), self.imm_operand(b)],
                ),
                _ => b.inst(op.mnemonic(), vec![self.rm_operand(width, b)]),
            },
            Op::Grp45 { op, width } => b.inst(op.mnemonic(), vec![self.rm_operand(width, b)]),
            Op::PushReg { reg } => b.inst("push", vec![b.reg(reg, w)]),
            Op::PopReg { reg } => b.inst("pop", vec![b.reg(reg, w)]),
            Op::PushSeg { seg } => b.inst("push", vec![b.seg(seg)]),
            Op::PopSeg { seg } => b.inst("pop", vec![b.seg(seg)]),
            Op::PushImm { .. } => b.inst("push", vec![self.imm_operand(b)]),
            Op::Pushf => b.inst("pushf", vec![]),
            Op::Popf => b.inst("popf", vec![]),
            Op::JmpShort | Op::JmpNear => b.inst("jmp", vec![self.branch_target(b)]),
            Op::JmpFar => {
                let (seg, off) = self.far_operands(b);
                b.inst("jmp", vec![seg, off])
            }
            Op::Jcc { cond, .. } => b.inst(cond.mnemonic(), vec![self.branch_target(b)]),
            Op::Loop { kind } => b.inst(kind.mnemonic(), vec![self.branch_target(b)]),
            Op::Jcxz => b.inst("jcxz", vec![self.branch_target(b)]),
            Op::CallNear => b.inst("call", vec![self.branch_target(b)]),
            Op::CallFar => {
                let (seg, off) = self.far_operands(b);
                b.inst("call", vec![seg, off])
            }
            Op::RetNear { pop } => {
                let ops = if pop { vec![self.imm_operand(b)] } else { vec![] };
                b.inst("ret", ops)
            }
            Op::RetFar { pop } => {
                let ops = if pop { vec![self.imm_operand(b)] } else { vec![] };
                b.inst("retf", ops)
            }
            Op::RetInterrupt => b.inst("iret", vec![]),
            Op::Int { vector } => b.inst("int", vec![b.imm(DataType::U8, vector as u64)]),
            Op::Into => b.inst("into", vec![]),
            Op::Str { op, width } => {
                let name = match self.rep() {
                    Some(RepKind::Rep) => format!("rep {}", op.mnemonic(width)),
                    Some(RepKind::Repne) => format!("repne {}", op.mnemonic(width)),
                    None => op.mnemonic(width).to_owned(),
                };
                b.inst(&name, vec![])
            }
            Op::Clc => b.inst("clc", vec![]),
            Op::Stc => b.inst("stc", vec![]),
            Op::Cmc => b.inst("cmc", vec![]),
            Op::Cld => b.inst("cld", vec![]),
            Op::Std => b.inst("std", vec![]),
            Op::Cli => b.inst("cli", vec![]),
            Op::Sti => b.inst("sti", vec![]),
            Op::Nop => b.inst("nop", vec![]),
            Op::Hlt => b.inst("hlt", vec![]),
            Op::Callback { index } => {
                b.inst("callback", vec![b.imm(DataType::U8, index as u64)])
            }
        }
    }

    /// The execution form: a statement tree expressing the operation's
    /// full effect, ending in an IP advance unless the operation is a
    /// control-flow terminator.
    pub fn generate_execution_ast(&self, b: &AstBuilder) -> StmtNode {
        let w = self.op_width();
        let stmts = match *self.op() {
            Op::MovRegImm { width, reg } => {
                vec![b.assign(b.reg(reg, width), self.imm_operand(b)), b.move_ip_next()]
            }
            Op::MovRmImm { width } => vec![
                b.assign(self.rm_operand(width, b), self.imm_operand(b)),
                b.move_ip_next(),
            ],
            Op::MovRmReg { width, to_reg } => {
                let rm = self.rm_operand(width, b);
                let reg = self.reg_operand(width, b);
                let stmt = if to_reg {
                    b.assign(reg, rm)
                } else {
                    b.assign(rm, reg)
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::MovSegRm { to_seg } => {
                let modrm = self.modrm().unwrap();
                let seg = b.seg(SegReg::from_index(modrm.reg));
                let rm = self.rm_operand(Width::W16, b);
                let stmt = if to_seg {
                    b.assign(seg, rm)
                } else {
                    b.assign(rm, seg)
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::MovAccMoffs { width, to_acc } => {
                let mem = self.moffs_operand(width, b);
                let acc = b.reg(0, width);
                let stmt = if to_acc {
                    b.assign(acc, mem)
                } else {
                    b.assign(mem, acc)
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::Lea => {
                let modrm = self.modrm().unwrap();
                vec![
                    b.assign(self.reg_operand(w, b), offset_expr(modrm, b)),
                    b.move_ip_next(),
                ]
            }
            Op::Lfp { seg } => {
                let modrm = self.modrm().unwrap();
                let ptr_off = offset_expr(modrm, b);
                let seg_off = b.add(
                    DataType::U16,
                    ptr_off.clone(),
                    b.imm(DataType::U16, w.bytes() as u64),
                );
                let seg_node = b.seg(modrm.segment);
                vec![
                    b.assign(
                        self.reg_operand(w, b),
                        b.seg_ptr(DataType::of(w, false), seg_node.clone(), ptr_off),
                    ),
                    b.assign(b.seg(seg), b.seg_ptr(DataType::U16, seg_node, seg_off)),
                    b.move_ip_next(),
                ]
            }
            Op::Xchg { width } => {
                let ty = DataType::of(width, false);
                vec![
                    b.decl("tmp", ty, self.rm_operand(width, b)),
                    b.assign(self.rm_operand(width, b), self.reg_operand(width, b)),
                    b.assign(self.reg_operand(width, b), b.var("tmp", ty)),
                    b.move_ip_next(),
                ]
            }
            Op::XchgAccReg { reg } => {
                let ty = DataType::of(w, false);
                vec![
                    b.decl("tmp", ty, b.reg(0, w)),
                    b.assign(b.reg(0, w), b.reg(reg, w)),
                    b.assign(b.reg(reg, w), b.var("tmp", ty)),
                    b.move_ip_next(),
                ]
            }
            Op::Xlat => {
                let seg = b.seg(self.data_segment());
                let off = b.add(
                    DataType::U16,
                    b.reg(Gpr::Bx.index(), Width::W16),
                    b.conv(DataType::U16, b.reg(0, Width::W8)),
                );
                vec![
                    b.assign(b.reg(0, Width::W8), b.seg_ptr(DataType::U8, seg, off)),
                    b.move_ip_next(),
                ]
            }
            Op::Lahf => vec![b.call("flags.lahf", vec![]), b.move_ip_next()],
            Op::Sahf => vec![b.call("flags.sahf", vec![]), b.move_ip_next()],
            Op::Cbw => {
                let stmt = match w {
                    Width::W16 => b.assign(
                        b.reg(0, Width::W16),
                        b.conv(DataType::I16, b.conv(DataType::I8, b.reg(0, Width::W8))),
                    ),
                    _ => b.assign(
                        b.reg(0, Width::W32),
                        b.conv(DataType::I32, b.conv(DataType::I16, b.reg(0, Width::W16))),
                    ),
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::Cwd => {
                // DX = sign-fill of AX (shift the sign through the widened
                // value).
                let stmt = match w {
                    Width::W16 => b.assign(
                        b.reg(Gpr::Dx.index(), Width::W16),
                        b.conv(
                            DataType::U16,
                            b.bin(
                                DataType::I32,
                                b.conv(DataType::I32, b.conv(DataType::I16, b.reg(0, Width::W16))),
                                BinOp::Shr,
                                b.imm(DataType::unsigned(BitWidth::B5), 16),
                            ),
                        ),
                    ),
                    _ => b.assign(
                        b.reg(Gpr::Dx.index(), Width::W32),
                        b.conv(
                            DataType::U32,
                            b.bin(
                                DataType::signed(BitWidth::B64),
                                b.conv(
                                    DataType::signed(BitWidth::B64),
                                    b.conv(DataType::I32, b.reg(0, Width::W32)),
                                ),
                                BinOp::Shr,
                                b.imm(DataType::unsigned(BitWidth::B8), 32),
                            ),
                        ),
                    ),
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::Alu { op, width, form } => {
                let (dst, src) = self.alu_operands(op, width, form, b);
                let name = format!("alu.{}{}", op.mnemonic(), w_suffix(width));
                let stmt = if op.writes_back() {
                    b.assign(dst.clone(), b.call_value(&name, vec![dst, src]))
                } else {
                    b.call(&name, vec![dst, src])
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::TestRmReg { width } => {
                let name = format!("alu.test{}", w_suffix(width));
                vec![
                    b.call(
                        &name,
                        vec![self.rm_operand(width, b), self.reg_operand(width, b)],
                    ),
                    b.move_ip_next(),
                ]
            }
            Op::TestAccImm { width } => {
                let name = format!("alu.test{}", w_suffix(width));
                vec![
                    b.call(&name, vec![b.reg(0, width), self.imm_operand(b)]),
                    b.move_ip_next(),
                ]
            }
            Op::IncDecReg { width, reg, dec } => {
                let name = format!("alu.{}{}", if dec { "dec" } else { "inc" }, w_suffix(width));
                vec![
                    b.assign(
                        b.reg(reg, width),
                        b.call_value(&name, vec![b.reg(reg, width)]),
                    ),
                    b.move_ip_next(),
                ]
            }
            Op::Grp2 { op, width, count } => {
                let name = format!("alu.{}{}", op.mnemonic(), w_suffix(width));
                let rm = self.rm_operand(width, b);
                let count = self.shift_count_operand(count, b);
                vec![
                    b.assign(rm.clone(), b.call_value(&name, vec![rm, count])),
                    b.move_ip_next(),
                ]
            }
            Op::Grp3 { op, width } => {
                let rm = self.rm_operand(width, b);
                let stmt = match op {
                    Grp3Op::TestImm => b.call(
                        &format!("alu.test{}", w_suffix(width)),
                        vec![rm, self.imm_operand(b)],
                    ),
                    Grp3Op::Not => b.assign(
                        rm.clone(),
                        b.un(DataType::of(width, false), UnOp::Not, rm),
                    ),
                    Grp3Op::Neg => b.assign(
                        rm.clone(),
                        b.call_value(&format!("alu.neg{}", w_suffix(width)), vec![rm]),
                    ),
                    Grp3Op::Mul | Grp3Op::Imul | Grp3Op::Div | Grp3Op::Idiv => b.call(
                        &format!("alu.{}{}", op.mnemonic(), w_suffix(width)),
                        vec![rm],
                    ),
                };
                vec![stmt, b.move_ip_next()]
            }
            Op::Grp45 { op, width } => {
                let rm = self.rm_operand(width, b);
                match op {
                    Grp45Op::IncRm | Grp45Op::DecRm => {
                        let name = format!(
                            "alu.{}{}",
                            if op == Grp45Op::DecRm { "dec" } else { "inc" },
                            w_suffix(width)
                        );
                        vec![
                            b.assign(rm.clone(), b.call_value(&name, vec![rm])),
                            b.move_ip_next(),
                        ]
                    }
                    Grp45Op::CallRm => vec![b.call_near(rm)],
                    Grp45Op::JmpRm => vec![b.jump_near(rm)],
                    Grp45Op::CallFarRm | Grp45Op::JmpFarRm => {
                        let modrm = self.modrm().unwrap();
                        let off_expr = offset_expr(modrm, b);
                        let seg_expr = b.add(
                            DataType::U16,
                            off_expr.clone(),
                            b.imm(DataType::U16, width.bytes() as u64),
                        );
                        let seg_node = b.seg(modrm.segment);
                        let offset = b.seg_ptr(
                            DataType::of(width, false),
                            seg_node.clone(),
                            off_expr,
                        );
                        let segment = b.seg_ptr(DataType::U16, seg_node, seg_expr);
                        if op == Grp45Op::CallFarRm {
                            vec![b.call_far(segment, offset)]
                        } else {
                            vec![b.jump_far(segment, offset)]
                        }
                    }
                    Grp45Op::PushRm => vec![
                        b.call(&format!("stack.push{}", stack_suffix(width)), vec![rm]),
                        b.move_ip_next(),
                    ],
                }
            }
            Op::PushReg { reg } => vec![
                b.call(&format!("stack.push{}", stack_suffix(w)), vec![b.reg(reg, w)]),
                b.move_ip_next(),
            ],
            Op::PopReg { reg } => vec![
                b.assign(
                    b.reg(reg, w),
                    b.call_value(&format!("stack.pop{}", stack_suffix(w)), vec![]),
                ),
                b.move_ip_next(),
            ],
            Op::PushSeg { seg } => vec![
                b.call("stack.push16", vec![b.seg(seg)]),
                b.move_ip_next(),
            ],
            Op::PopSeg { seg } => vec![
                b.assign(b.seg(seg), b.call_value("stack.pop16", vec![])),
                b.move_ip_next(),
            ],
            Op::PushImm { .. } => vec![
                b.call(
                    &format!("stack.push{}", stack_suffix(w)),
                    vec![self.imm_operand(b)],
                ),
                b.move_ip_next(),
            ],
            Op::Pushf => vec![
                b.call(&format!("stack.pushf{}", stack_suffix(w)), vec![]),
                b.move_ip_next(),
            ],
            Op::Popf => vec![
                b.call(&format!("stack.popf{}", stack_suffix(w)), vec![]),
                b.move_ip_next(),
            ],
            Op::JmpShort | Op::JmpNear => vec![b.jump_near(self.branch_target(b))],
            Op::JmpFar => {
                let (seg, off) = self.far_operands(b);
                vec![b.jump_far(seg, off)]
            }
            Op::Jcc { cond, .. } => vec![b.if_else(
                condition_expr(cond, b),
                b.jump_near(self.branch_target(b)),
                b.move_ip_next(),
            )],
            Op::Loop { kind } => {
                let cx = b.reg(Gpr::Cx.index(), Width::W16);
                let dec = b.assign(
                    cx.clone(),
                    b.sub(DataType::U16, cx.clone(), b.u16(1)),
                );
                let nonzero = b.ne(cx, b.u16(0));
                let cond = match kind {
                    LoopKind::Loop => nonzero,
                    LoopKind::Loope => b.both(nonzero, b.flag(Flags::ZERO)),
                    LoopKind::Loopne => b.both(nonzero, b.not(b.flag(Flags::ZERO))),
                };
                vec![
                    dec,
                    b.if_else(cond, b.jump_near(self.branch_target(b)), b.move_ip_next()),
                ]
            }
            Op::Jcxz => vec![b.if_else(
                b.eq(b.reg(Gpr::Cx.index(), Width::W16), b.u16(0)),
                b.jump_near(self.branch_target(b)),
                b.move_ip_next(),
            )],
            Op::CallNear => vec![b.call_near(self.branch_target(b))],
            Op::CallFar => {
                let (seg, off) = self.far_operands(b);
                vec![b.call_far(seg, off)]
            }
            Op::RetNear { pop } => {
                vec![b.return_near(pop.then(|| self.imm_operand(b)))]
            }
            Op::RetFar { pop } => {
                vec![b.return_far(pop.then(|| self.imm_operand(b)))]
            }
            Op::RetInterrupt => vec![b.return_interrupt()],
            Op::Int { vector } => vec![b.interrupt(b.imm(DataType::U8, vector as u64))],
            Op::Into => vec![b.if_else(
                b.flag(Flags::OVERFLOW),
                b.interrupt(b.imm(DataType::U8, 4)),
                b.move_ip_next(),
            )],
            Op::Str { op, width } => {
                let name = match op {
                    StringOp::Movs => "string.movs",
                    StringOp::Cmps => "string.cmps",
                    StringOp::Stos => "string.stos",
                    StringOp::Lods => "string.lods",
                    StringOp::Scas => "string.scas",
                };
                let rep = match self.rep() {
                    None => 0u64,
                    Some(RepKind::Rep) => 1,
                    Some(RepKind::Repne) => 2,
                };
                vec![
                    b.call(
                        &format!("{name}{}", w_suffix(width)),
                        vec![b.imm(DataType::U8, rep)],
                    ),
                    b.move_ip_next(),
                ]
            }
            Op::Clc => vec![
                b.assign(b.flag(Flags::CARRY), b.imm(DataType::U8, 0)),
                b.move_ip_next(),
            ],
            Op::Stc => vec![
                b.assign(b.flag(Flags::CARRY), b.imm(DataType::U8, 1)),
                b.move_ip_next(),
            ],
            Op::Cmc => vec![
                b.assign(b.flag(Flags::CARRY), b.not(b.flag(Flags::CARRY))),
                b.move_ip_next(),
            ],
            Op::Cld => vec![
                b.assign(b.flag(Flags::DIRECTION), b.imm(DataType::U8, 0)),
                b.move_ip_next(),
            ],
            Op::Std => vec![
                b.assign(b.flag(Flags::DIRECTION), b.imm(DataType::U8, 1)),
                b.move_ip_next(),
            ],
            Op::Cli => vec![
                b.assign(b.flag(Flags::INTERRUPT), b.imm(DataType::U8, 0)),
                b.move_ip_next(),
            ],
            Op::Sti => vec![
                b.assign(b.flag(Flags::INTERRUPT), b.imm(DataType::U8, 1)),
                b.move_ip_next(),
            ],
            Op::Nop => vec![b.move_ip_next()],
            Op::Hlt => vec![b.call("cpu.halt", vec![]), b.move_ip_next()],
            Op::Callback { index } => vec![
                b.call("host.callback", vec![b.imm(DataType::U8, index as u64)]),
                b.move_ip_next(),
            ],
        };
        b.block(stmts)
    }

    /// Intel-syntax rendering of the disassembly form.
    pub fn disassemble(&self) -> String {
        self.to_instruction_ast(&AstBuilder::new()).to_string()
    }

    fn data_segment(&self) -> SegReg {
        self.segment_override().unwrap_or(SegReg::Ds)
    }

    /// The r/m operand as a value node: a register for `mod == 11`, a
    /// segmented pointer otherwise.
    fn rm_operand(&self, width: Width, b: &AstBuilder) -> ValueNode {
        let modrm = self.modrm().expect("operation carries a ModR/M operand");
        if modrm.is_register() {
            b.reg(modrm.rm, width)
        } else {
            b.seg_ptr(
                DataType::of(width, false),
                b.seg(modrm.segment),
                offset_expr(modrm, b),
            )
        }
    }

    fn reg_operand(&self, width: Width, b: &AstBuilder) -> ValueNode {
        let modrm = self.modrm().expect("operation carries a ModR/M operand");
        b.reg(modrm.reg, width)
    }

    /// The primary immediate as a constant of its field type.
    fn imm_operand(&self, b: &AstBuilder) -> ValueNode {
        let field = self.imm().expect("operation carries an immediate");
        b.imm(field.data_type(), field.parsed_value())
    }

    fn moffs_operand(&self, width: Width, b: &AstBuilder) -> ValueNode {
        let field = self.imm().expect("moffs operand");
        b.seg_ptr(
            DataType::of(width, false),
            b.seg(self.data_segment()),
            b.imm(field.data_type(), field.parsed_value()),
        )
    }

    /// Absolute in-segment target of a relative branch.
    fn branch_target(&self, b: &AstBuilder) -> ValueNode {
        let rel = self.imm().expect("branch displacement").parsed_value() as i64;
        let target = self.next_address().offset.wrapping_add(rel as u16);
        b.imm(DataType::U16, target as u64)
    }

    fn far_operands(&self, b: &AstBuilder) -> (ValueNode, ValueNode) {
        let off = self.imm().expect("far offset");
        let seg = self.imm2().expect("far segment");
        (
            b.imm(DataType::U16, seg.parsed_value()),
            b.imm(off.data_type(), off.parsed_value()),
        )
    }

    fn shift_count_operand(&self, count: ShiftCount, b: &AstBuilder) -> ValueNode {
        match count {
            ShiftCount::One => b.imm(DataType::unsigned(BitWidth::B5), 1),
            ShiftCount::Cl => b.reg(1, Width::W8),
            ShiftCount::Imm => {
                let field = self.imm().expect("shift count immediate");
                b.imm(DataType::unsigned(BitWidth::B5), field.parsed_value() & 0x1F)
            }
        }
    }

    fn alu_operands(
        &self,
        _op: AluOp,
        width: Width,
        form: AluForm,
        b: &AstBuilder,
    ) -> (ValueNode, ValueNode) {
        match form {
            AluForm::RmReg { to_reg } => {
                let rm = self.rm_operand(width, b);
                let reg = self.reg_operand(width, b);
                if to_reg {
                    (reg, rm)
                } else {
                    (rm, reg)
                }
            }
            AluForm::AccImm => (b.reg(0, width), self.imm_operand(b)),
            AluForm::RmImm { .. } => (self.rm_operand(width, b), self.imm_operand(b)),
        }
    }
}

/// Effective-offset expression of a memory ModR/M operand: base and index
/// registers plus the parsed displacement.
fn offset_expr(modrm: &ModRmContext, b: &AstBuilder) -> ValueNode {
    let ty16 = DataType::U16;
    let mut expr = match modrm.offset {
        MemoryOffsetKind::Register => return b.imm(ty16, 0),
        MemoryOffsetKind::Off16(off) => {
            let r = |g: Gpr| b.reg(g.index(), Width::W16);
            match off {
                MemoryOffset16::BxSi => Some(b.add(ty16, r(Gpr::Bx), r(Gpr::Si))),
                MemoryOffset16::BxDi => Some(b.add(ty16, r(Gpr::Bx), r(Gpr::Di))),
                MemoryOffset16::BpSi => Some(b.add(ty16, r(Gpr::Bp), r(Gpr::Si))),
                MemoryOffset16::BpDi => Some(b.add(ty16, r(Gpr::Bp), r(Gpr::Di))),
                MemoryOffset16::Si => Some(r(Gpr::Si)),
                MemoryOffset16::Di => Some(r(Gpr::Di)),
                MemoryOffset16::Bx => Some(r(Gpr::Bx)),
                MemoryOffset16::Bp => Some(r(Gpr::Bp)),
                MemoryOffset16::Disp16 => None,
            }
        }
        MemoryOffsetKind::Off32(off) => match off {
            MemoryOffset32::Reg(g) => Some(b.reg(g.index(), Width::W32)),
            MemoryOffset32::Disp32 => None,
            MemoryOffset32::Sib => {
                let sib = modrm.sib.as_ref().expect("SIB context");
                let base = sib.base.map(|g| b.reg(g.index(), Width::W32));
                let index = sib.index.map(|g| {
                    b.bin(
                        DataType::U32,
                        b.reg(g.index(), Width::W32),
                        BinOp::Shl,
                        b.imm(DataType::unsigned(BitWidth::B5), sib.scale as u64),
                    )
                });
                match (base, index) {
                    (Some(base), Some(index)) => Some(b.add(DataType::U32, base, index)),
                    (Some(base), None) => Some(base),
                    (None, Some(index)) => Some(index),
                    (None, None) => None,
                }
            }
        },
    };

    if let Some(disp) = &modrm.disp {
        let value = disp.parsed_value() as i64;
        let ty = match modrm.addr_width {
            crate::state::AddrWidth::A16 => ty16,
            crate::state::AddrWidth::A32 => DataType::U32,
        };
        expr = Some(match expr {
            None => b.imm(ty, value as u64 & ty.width.mask()),
            Some(e) if value < 0 => {
                b.sub(ty, e, b.imm(ty, value.unsigned_abs() & ty.width.mask()))
            }
            Some(e) => b.add(ty, e, b.imm(ty, value as u64 & ty.width.mask())),
        });
    }

    expr.unwrap_or_else(|| b.imm(ty16, 0))
}

/// Flag tree for a Jcc condition.
fn condition_expr(cond: crate::inst::Cond, b: &AstBuilder) -> ValueNode {
    use crate::inst::Cond;
    let cf = || b.flag(Flags::CARRY);
    let zf = || b.flag(Flags::ZERO);
    let sf = || b.flag(Flags::SIGN);
    let of = || b.flag(Flags::OVERFLOW);
    let pf = || b.flag(Flags::PARITY);
    match cond {
        Cond::O => of(),
        Cond::No => b.not(of()),
        Cond::B => cf(),
        Cond::Ae => b.not(cf()),
        Cond::E => zf(),
        Cond::Ne => b.not(zf()),
        Cond::Be => b.either(cf(), zf()),
        Cond::A => b.not(b.either(cf(), zf())),
        Cond::S => sf(),
        Cond::Ns => b.not(sf()),
        Cond::P => pf(),
        Cond::Np => b.not(pf()),
        Cond::L => b.ne(sf(), of()),
        Cond::Ge => b.eq(sf(), of()),
        Cond::Le => b.either(zf(), b.ne(sf(), of())),
        Cond::G => b.not(b.either(zf(), b.ne(sf(), of()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::state::SegmentedAddress;

    fn parse(bytes: &[u8]) -> ParsedInstruction {
        Parser::new()
            .parse_slice(bytes, SegmentedAddress::new(0x1000, 0))
            .unwrap()
    }

    #[test]
    fn disassembly_samples() {
        let cases: &[(&[u8], &str)] = &[
            (&[0xB8, 0x34, 0x12], "mov ax, 0x1234"),
            (&[0x01, 0xD8], "add ax, bx"),
            (&[0x8B, 0x47, 0x06], "mov ax, word ptr ds:[bx + 0x6]"),
            (&[0x8B, 0x46, 0xFE], "mov ax, word ptr ss:[bp - 0x2]"),
            (&[0xCD, 0x21], "int 0x21"),
            (&[0xF3, 0xA4], "rep movsb"),
            (&[0x74, 0x10], "je 0x12"),
            (&[0xC3], "ret"),
            (&[0xEB, 0xFE], "jmp 0x0"),
            (&[0xD1, 0xE3], "shl bx, 0x1"),
            (&[0xF7, 0xF1], "div cx"),
            (&[0x50], "push ax"),
            (&[0x8E, 0xD8], "mov ds, ax"),
        ];
        for (bytes, expected) in cases {
            assert_eq!(parse(bytes).disassemble(), *expected, "{bytes:02X?}");
        }
    }

    #[test]
    fn execution_ast_ends_with_ip_advance_unless_terminator() {
        let b = AstBuilder::new();
        let samples: &[&[u8]] = &[
            &[0xB8, 0x34, 0x12],
            &[0x01, 0xD8],
            &[0x50],
            &[0xF8],
            &[0x74, 0x10],
            &[0xEB, 0xFE],
            &[0xC3],
            &[0xCD, 0x21],
        ];
        for bytes in samples {
            let inst = parse(bytes);
            let ast = inst.generate_execution_ast(&b);
            let stmts = match ast {
                StmtNode::Block(stmts) => stmts,
                other => panic!("execution ast is not a block: {other:?}"),
            };
            let last = stmts.last().unwrap();
            if inst.op().is_terminator() {
                assert!(
                    !matches!(last, StmtNode::MoveIpNext),
                    "terminator ends in ip advance: {bytes:02X?}"
                );
            } else {
                assert!(
                    matches!(last, StmtNode::MoveIpNext | StmtNode::IfElse(..)),
                    "missing ip advance: {bytes:02X?}"
                );
            }
        }
    }

    #[test]
    fn the_two_forms_name_the_same_operation() {
        let b = AstBuilder::new();
        let inst = parse(&[0x01, 0xD8]); // add ax, bx
        let dis = inst.to_instruction_ast(&b);
        assert_eq!(dis.to_string(), "add ax, bx");
        let exec = inst.generate_execution_ast(&b).to_string();
        assert!(exec.contains("alu.add16"), "{exec}");
        assert!(exec.contains("ip = next"), "{exec}");
    }
}
