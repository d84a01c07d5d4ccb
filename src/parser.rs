//! Variable-length instruction parsing: byte stream in, [`ParsedInstruction`]
//! out.

use crate::dtype::DataType;
use crate::error::ParseError;
use crate::field::InstrField;
use crate::inst::{
    AluForm, AluOp, Cond, Grp3Op, Grp45Op, LoopKind, Op, ParsedInstruction, RepKind, ShiftCount,
    ShiftOp, StringOp,
};
use crate::mem::MemoryPort;
use crate::modrm::{MemoryOffset16, MemoryOffset32, MemoryOffsetKind, ModRmContext, SibContext};
use crate::state::{AddrWidth, SegReg, SegmentedAddress, Width};

/// x86 caps instructions at 15 bytes regardless of prefix count.
const MAX_INSTRUCTION_LEN: u32 = 15;

/// Walks guest memory byte by byte, minting fields with correct addresses
/// and intra-instruction indices.
struct Cursor<'a, M: MemoryPort + ?Sized> {
    mem: &'a M,
    start: u32,
    pos: u32,
    field_index: u8,
    limit: Option<u32>,
}

impl<'a, M: MemoryPort + ?Sized> Cursor<'a, M> {
    fn new(mem: &'a M, start: u32, limit: Option<u32>) -> Self {
        Self {
            mem,
            start,
            pos: 0,
            field_index: 0,
            limit,
        }
    }

    fn len(&self) -> u8 {
        self.pos as u8
    }

    fn peek(&self) -> u8 {
        self.mem.read_u8(self.start.wrapping_add(self.pos))
    }

    fn take_span(&mut self, len: u32) -> Result<(u32, Vec<u8>), ParseError> {
        if self.pos + len > MAX_INSTRUCTION_LEN {
            return Err(ParseError::TooLong {
                address: self.start,
            });
        }
        if let Some(limit) = self.limit {
            if self.pos + len > limit {
                return Err(ParseError::Truncated {
                    address: self.start,
                    got: self.pos as u8,
                });
            }
        }
        let addr = self.start.wrapping_add(self.pos);
        let bytes = self.mem.read_span(addr, len);
        self.pos += len;
        Ok((addr, bytes))
    }

    fn next_index(&mut self) -> u8 {
        let index = self.field_index;
        self.field_index += 1;
        index
    }

    /// Consumes `len` bytes as a signature-bearing field.
    fn structural(&mut self, ty: DataType, len: u32) -> Result<InstrField, ParseError> {
        let (addr, bytes) = self.take_span(len)?;
        let index = self.next_index();
        Ok(InstrField::structural(addr, index, ty, bytes))
    }

    /// Consumes `len` bytes as a payload (wildcard) field.
    fn value(&mut self, ty: DataType, len: u32) -> Result<InstrField, ParseError> {
        let (addr, bytes) = self.take_span(len)?;
        let index = self.next_index();
        Ok(InstrField::value_field(addr, index, ty, bytes))
    }
}

/// The instruction parser. Stateless; one per machine is conventional.
///
/// # Examples
/// ```
/// use cfg86::{FlatMemory, MemoryPort, Parser, SegmentedAddress};
/// let mut mem = FlatMemory::new(0x10_0000);
/// mem.load_bytes(0x10000, &[0xB8, 0x34, 0x12]); // mov ax, 0x1234
/// let inst = Parser::new()
///     .parse(&mem, SegmentedAddress::new(0x1000, 0x0000))
///     .unwrap();
/// assert_eq!(inst.len(), 3);
/// ```
#[derive(Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Parser
    }

    /// Parses one instruction at `addr` directly out of guest memory.
    pub fn parse<M: MemoryPort + ?Sized>(
        &self,
        mem: &M,
        addr: SegmentedAddress,
    ) -> Result<ParsedInstruction, ParseError> {
        self.parse_inner(mem, addr, None)
    }

    /// Parses out of a byte slice positioned at `addr`; running off the
    /// end of the slice reports [`ParseError::Truncated`].
    pub fn parse_slice(
        &self,
        bytes: &[u8],
        addr: SegmentedAddress,
    ) -> Result<ParsedInstruction, ParseError> {
        let slice = SliceMemory {
            base: addr.linear(),
            bytes,
        };
        self.parse_inner(&slice, addr, Some(bytes.len() as u32))
    }

    fn parse_inner<M: MemoryPort + ?Sized>(
        &self,
        mem: &M,
        addr: SegmentedAddress,
        limit: Option<u32>,
    ) -> Result<ParsedInstruction, ParseError> {
        let mut cur = Cursor::new(mem, addr.linear(), limit);

        let mut seg_override = None;
        let mut rep = None;
        let mut op_size = false;
        let mut addr_size = false;
        let mut prefix_fields = Vec::new();

        loop {
            let byte = cur.peek();
            let override_seg = match byte {
                0x26 => Some(SegReg::Es),
                0x2E => Some(SegReg::Cs),
                0x36 => Some(SegReg::Ss),
                0x3E => Some(SegReg::Ds),
                0x64 => Some(SegReg::Fs),
                0x65 => Some(SegReg::Gs),
                _ => None,
            };
            match byte {
                _ if override_seg.is_some() => seg_override = override_seg,
                0x66 => op_size = true,
                0x67 => addr_size = true,
                0xF0 => {} // LOCK: accepted, single-CPU semantics are a no-op
                0xF3 => rep = Some(RepKind::Rep),
                0xF2 => rep = Some(RepKind::Repne),
                _ => break,
            }
            prefix_fields.push(cur.structural(DataType::U8, 1)?);
        }

        let width = if op_size { Width::W32 } else { Width::W16 };
        let addr_width = if addr_size {
            AddrWidth::A32
        } else {
            AddrWidth::A16
        };

        let mut ctx = Builder {
            cur: &mut cur,
            width,
            addr_width,
            seg_override,
        };
        let (op, opcode, modrm, imm, imm2) = ctx.dispatch()?;

        Ok(ParsedInstruction {
            address: addr,
            op,
            op_width: width,
            addr_width,
            seg_override,
            rep,
            prefix_fields,
            opcode,
            modrm,
            imm,
            imm2,
            len: cur.len(),
        })
    }
}

type Decoded = (
    Op,
    InstrField,
    Option<ModRmContext>,
    Option<InstrField>,
    Option<InstrField>,
);

/// Per-instruction decode state shared by the opcode arms.
struct Builder<'a, 'm, M: MemoryPort + ?Sized> {
    cur: &'a mut Cursor<'m, M>,
    width: Width,
    addr_width: AddrWidth,
    seg_override: Option<SegReg>,
}

impl<M: MemoryPort + ?Sized> Builder<'_, '_, M> {
    fn invalid(&self, bytes: Vec<u8>) -> ParseError {
        ParseError::InvalidOpcode {
            address: self.cur.start,
            bytes,
        }
    }

    /// Immediate of the effective operand width.
    fn imm_op_width(&mut self) -> Result<InstrField, ParseError> {
        match self.width {
            Width::W32 => self.cur.value(DataType::U32, 4),
            _ => self.cur.value(DataType::U16, 2),
        }
    }

    /// Relative branch displacement of the effective operand width.
    fn rel_op_width(&mut self) -> Result<InstrField, ParseError> {
        match self.width {
            Width::W32 => self.cur.value(DataType::I32, 4),
            _ => self.cur.value(DataType::I16, 2),
        }
    }

    fn modrm(&mut self) -> Result<ModRmContext, ParseError> {
        let field = self.cur.structural(DataType::U8, 1)?;
        let byte = field.parsed_value() as u8;
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;

        let mut sib_field = None;
        let mut sib = None;
        let mut disp = None;
        let offset;
        let default_seg;

        match self.addr_width {
            AddrWidth::A16 => {
                let off = if mode == 3 {
                    None
                } else {
                    Some(MemoryOffset16::from_rm(mode, rm))
                };
                disp = match (mode, rm) {
                    (0, 6) => Some(self.cur.value(DataType::I16, 2)?),
                    (1, _) => Some(self.cur.value(DataType::I8, 1)?),
                    (2, _) => Some(self.cur.value(DataType::I16, 2)?),
                    _ => None,
                };
                default_seg = off.map_or(SegReg::Ds, |o| o.default_segment());
                offset = off.map_or(MemoryOffsetKind::Register, MemoryOffsetKind::Off16);
            }
            AddrWidth::A32 => {
                let mut seg = SegReg::Ds;
                offset = if mode == 3 {
                    MemoryOffsetKind::Register
                } else if rm == 4 {
                    let f = self.cur.structural(DataType::U8, 1)?;
                    let decoded = SibContext::decode(f.parsed_value() as u8, mode);
                    if decoded.base.is_none() {
                        disp = Some(self.cur.value(DataType::I32, 4)?);
                    }
                    if matches!(
                        decoded.base,
                        Some(crate::state::Gpr::Bp) | Some(crate::state::Gpr::Sp)
                    ) {
                        seg = SegReg::Ss;
                    }
                    sib_field = Some(f);
                    sib = Some(decoded);
                    MemoryOffsetKind::Off32(MemoryOffset32::Sib)
                } else if mode == 0 && rm == 5 {
                    disp = Some(self.cur.value(DataType::I32, 4)?);
                    MemoryOffsetKind::Off32(MemoryOffset32::Disp32)
                } else {
                    let gpr = crate::state::Gpr::from_index(rm);
                    if gpr == crate::state::Gpr::Bp {
                        seg = SegReg::Ss;
                    }
                    MemoryOffsetKind::Off32(MemoryOffset32::Reg(gpr))
                };
                if mode != 3 && disp.is_none() {
                    disp = match mode {
                        1 => Some(self.cur.value(DataType::I8, 1)?),
                        2 => Some(self.cur.value(DataType::I32, 4)?),
                        _ => None,
                    };
                }
                default_seg = seg;
            }
        }

        Ok(ModRmContext {
            field,
            mode,
            reg,
            rm,
            addr_width: self.addr_width,
            offset,
            sib_field,
            sib,
            disp,
            segment: self.seg_override.unwrap_or(default_seg),
        })
    }

    fn dispatch(&mut self) -> Result<Decoded, ParseError> {
        let opcode = self.cur.structural(DataType::U8, 1)?;
        let byte = opcode.parsed_value() as u8;
        let w = self.width;

        // The eight two-operand ALU ops share one encoding block:
        // 00+8*op..05+8*op, with push/pop-seg and prefixes in the gaps.
        if byte < 0x40 && (byte & 7) < 6 {
            let alu = AluOp::from_index(byte >> 3);
            return match byte & 7 {
                0 => self.with_modrm(opcode, |_| Op::Alu {
                    op: alu,
                    width: Width::W8,
                    form: AluForm::RmReg { to_reg: false },
                }),
                1 => self.with_modrm(opcode, |s| Op::Alu {
                    op: alu,
                    width: s.width,
                    form: AluForm::RmReg { to_reg: false },
                }),
                2 => self.with_modrm(opcode, |_| Op::Alu {
                    op: alu,
                    width: Width::W8,
                    form: AluForm::RmReg { to_reg: true },
                }),
                3 => self.with_modrm(opcode, |s| Op::Alu {
                    op: alu,
                    width: s.width,
                    form: AluForm::RmReg { to_reg: true },
                }),
                4 => {
                    let imm = self.cur.value(DataType::U8, 1)?;
                    Ok((
                        Op::Alu {
                            op: alu,
                            width: Width::W8,
                            form: AluForm::AccImm,
                        },
                        opcode,
                        None,
                        Some(imm),
                        None,
                    ))
                }
                _ => {
                    let imm = self.imm_op_width()?;
                    Ok((
                        Op::Alu {
                            op: alu,
                            width: w,
                            form: AluForm::AccImm,
                        },
                        opcode,
                        None,
                        Some(imm),
                        None,
                    ))
                }
            };
        }

        match byte {
            0x06 | 0x0E | 0x16 | 0x1E => {
                let seg = SegReg::from_index(byte >> 3);
                Ok((Op::PushSeg { seg }, opcode, None, None, None))
            }
            0x07 | 0x17 | 0x1F => {
                let seg = SegReg::from_index(byte >> 3);
                Ok((Op::PopSeg { seg }, opcode, None, None, None))
            }
            0x0F => self.dispatch_0f(opcode),

            0x40..=0x47 => Ok((
                Op::IncDecReg {
                    width: w,
                    reg: byte & 7,
                    dec: false,
                },
                opcode,
                None,
                None,
                None,
            )),
            0x48..=0x4F => Ok((
                Op::IncDecReg {
                    width: w,
                    reg: byte & 7,
                    dec: true,
                },
                opcode,
                None,
                None,
                None,
            )),
            0x50..=0x57 => Ok((Op::PushReg { reg: byte & 7 }, opcode, None, None, None)),
            0x58..=0x5F => Ok((Op::PopReg { reg: byte & 7 }, opcode, None, None, None)),

            0x68 => {
                let imm = self.imm_op_width()?;
                Ok((Op::PushImm { sext: false }, opcode, None, Some(imm), None))
            }
            0x6A => {
                let imm = self.cur.value(DataType::I8, 1)?;
                Ok((Op::PushImm { sext: true }, opcode, None, Some(imm), None))
            }

            0x70..=0x7F => {
                let imm = self.cur.value(DataType::I8, 1)?;
                Ok((
                    Op::Jcc {
                        cond: Cond::from_index(byte),
                        near: false,
                    },
                    opcode,
                    None,
                    Some(imm),
                    None,
                ))
            }

            // Grp1: op r/m, imm. 0x82 is the legacy alias of 0x80.
            0x80 | 0x82 => {
                let modrm = self.modrm()?;
                let imm = self.cur.value(DataType::U8, 1)?;
                Ok((
                    Op::Alu {
                        op: AluOp::from_index(modrm.reg),
                        width: Width::W8,
                        form: AluForm::RmImm { sext: false },
                    },
                    opcode,
                    Some(modrm),
                    Some(imm),
                    None,
                ))
            }
            0x81 => {
                let modrm = self.modrm()?;
                let imm = self.imm_op_width()?;
                Ok((
                    Op::Alu {
                        op: AluOp::from_index(modrm.reg),
                        width: w,
                        form: AluForm::RmImm { sext: false },
                    },
                    opcode,
                    Some(modrm),
                    Some(imm),
                    None,
                ))
            }
            0x83 => {
                let modrm = self.modrm()?;
                let imm = self.cur.value(DataType::I8, 1)?;
                Ok((
                    Op::Alu {
                        op: AluOp::from_index(modrm.reg),
                        width: w,
                        form: AluForm::RmImm { sext: true },
                    },
                    opcode,
                    Some(modrm),
                    Some(imm),
                    None,
                ))
            }

            0x84 => self.with_modrm(opcode, |_| Op::TestRmReg { width: Width::W8 }),
            0x85 => self.with_modrm(opcode, |s| Op::TestRmReg { width: s.width }),
            0x86 => self.with_modrm(opcode, |_| Op::Xchg { width: Width::W8 }),
            0x87 => self.with_modrm(opcode, |s| Op::Xchg { width: s.width }),
            0x88 => self.with_modrm(opcode, |_| Op::MovRmReg {
                width: Width::W8,
                to_reg: false,
            }),
            0x89 => self.with_modrm(opcode, |s| Op::MovRmReg {
                width: s.width,
                to_reg: false,
            }),
            0x8A => self.with_modrm(opcode, |_| Op::MovRmReg {
                width: Width::W8,
                to_reg: true,
            }),
            0x8B => self.with_modrm(opcode, |s| Op::MovRmReg {
                width: s.width,
                to_reg: true,
            }),
            0x8C | 0x8E => {
                let modrm = self.modrm()?;
                if modrm.reg > 5 {
                    return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]));
                }
                Ok((
                    Op::MovSegRm {
                        to_seg: byte == 0x8E,
                    },
                    opcode,
                    Some(modrm),
                    None,
                    None,
                ))
            }
            0x8D => {
                let modrm = self.modrm()?;
                if modrm.is_register() {
                    return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]));
                }
                Ok((Op::Lea, opcode, Some(modrm), None, None))
            }

            0x90 => Ok((Op::Nop, opcode, None, None, None)),
            0x91..=0x97 => Ok((Op::XchgAccReg { reg: byte & 7 }, opcode, None, None, None)),
            0x98 => Ok((Op::Cbw, opcode, None, None, None)),
            0x99 => Ok((Op::Cwd, opcode, None, None, None)),
            0x9A => {
                let off = self.imm_op_width()?;
                let seg = self.cur.value(DataType::U16, 2)?;
                Ok((Op::CallFar, opcode, None, Some(off), Some(seg)))
            }
            0x9C => Ok((Op::Pushf, opcode, None, None, None)),
            0x9D => Ok((Op::Popf, opcode, None, None, None)),
            0x9E => Ok((Op::Sahf, opcode, None, None, None)),
            0x9F => Ok((Op::Lahf, opcode, None, None, None)),

            0xA0..=0xA3 => {
                let moffs = match self.addr_width {
                    AddrWidth::A16 => self.cur.value(DataType::U16, 2)?,
                    AddrWidth::A32 => self.cur.value(DataType::U32, 4)?,
                };
                let width = if byte & 1 == 0 { Width::W8 } else { w };
                Ok((
                    Op::MovAccMoffs {
                        width,
                        to_acc: byte < 0xA2,
                    },
                    opcode,
                    None,
                    Some(moffs),
                    None,
                ))
            }
            0xA4 | 0xA5 => Ok((
                Op::Str {
                    op: StringOp::Movs,
                    width: if byte & 1 == 0 { Width::W8 } else { w },
                },
                opcode,
                None,
                None,
                None,
            )),
            0xA6 | 0xA7 => Ok((
                Op::Str {
                    op: StringOp::Cmps,
                    width: if byte & 1 == 0 { Width::W8 } else { w },
                },
                opcode,
                None,
                None,
                None,
            )),
            0xA8 => {
                let imm = self.cur.value(DataType::U8, 1)?;
                Ok((
                    Op::TestAccImm { width: Width::W8 },
                    opcode,
                    None,
                    Some(imm),
                    None,
                ))
            }
            0xA9 => {
                let imm = self.imm_op_width()?;
                Ok((Op::TestAccImm { width: w }, opcode, None, Some(imm), None))
            }
            0xAA | 0xAB => Ok((
                Op::Str {
                    op: StringOp::Stos,
                    width: if byte & 1 == 0 { Width::W8 } else { w },
                },
                opcode,
                None,
                None,
                None,
            )),
            0xAC | 0xAD => Ok((
                Op::Str {
                    op: StringOp::Lods,
                    width: if byte & 1 == 0 { Width::W8 } else { w },
                },
                opcode,
                None,
                None,
                None,
            )),
            0xAE | 0xAF => Ok((
                Op::Str {
                    op: StringOp::Scas,
                    width: if byte & 1 == 0 { Width::W8 } else { w },
                },
                opcode,
                None,
                None,
                None,
            )),

            0xB0..=0xB7 => {
                let imm = self.cur.value(DataType::U8, 1)?;
                Ok((
                    Op::MovRegImm {
                        width: Width::W8,
                        reg: byte & 7,
                    },
                    opcode,
                    None,
                    Some(imm),
                    None,
                ))
            }
            0xB8..=0xBF => {
                let imm = self.imm_op_width()?;
                Ok((
                    Op::MovRegImm {
                        width: w,
                        reg: byte & 7,
                    },
                    opcode,
                    None,
                    Some(imm),
                    None,
                ))
            }

            0xC0 | 0xC1 => {
                let width = if byte == 0xC0 { Width::W8 } else { w };
                let modrm = self.modrm()?;
                let imm = self.cur.value(DataType::U8, 1)?;
                Ok((
                    Op::Grp2 {
                        op: ShiftOp::from_index(modrm.reg),
                        width,
                        count: ShiftCount::Imm,
                    },
                    opcode,
                    Some(modrm),
                    Some(imm),
                    None,
                ))
            }
            0xC2 => {
                let imm = self.cur.value(DataType::U16, 2)?;
                Ok((Op::RetNear { pop: true }, opcode, None, Some(imm), None))
            }
            0xC3 => Ok((Op::RetNear { pop: false }, opcode, None, None, None)),
            0xC4 | 0xC5 => {
                let modrm = self.modrm()?;
                if modrm.is_register() {
                    return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]));
                }
                let seg = if byte == 0xC4 { SegReg::Es } else { SegReg::Ds };
                Ok((Op::Lfp { seg }, opcode, Some(modrm), None, None))
            }
            0xC6 | 0xC7 => {
                let width = if byte == 0xC6 { Width::W8 } else { w };
                let modrm = self.modrm()?;
                if modrm.reg != 0 {
                    return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]));
                }
                let imm = match width {
                    Width::W8 => self.cur.value(DataType::U8, 1)?,
                    _ => self.imm_op_width()?,
                };
                Ok((
                    Op::MovRmImm { width },
                    opcode,
                    Some(modrm),
                    Some(imm),
                    None,
                ))
            }
            0xCA => {
                let imm = self.cur.value(DataType::U16, 2)?;
                Ok((Op::RetFar { pop: true }, opcode, None, Some(imm), None))
            }
            0xCB => Ok((Op::RetFar { pop: false }, opcode, None, None, None)),
            0xCC => Ok((Op::Int { vector: 3 }, opcode, None, None, None)),
            0xCD => {
                // The vector selects the handler, so it discriminates.
                let field = self.cur.structural(DataType::U8, 1)?;
                let vector = field.parsed_value() as u8;
                Ok((Op::Int { vector }, opcode, None, Some(field), None))
            }
            0xCE => Ok((Op::Into, opcode, None, None, None)),
            0xCF => Ok((Op::RetInterrupt, opcode, None, None, None)),

            0xD0 | 0xD1 => {
                let width = if byte == 0xD0 { Width::W8 } else { w };
                let modrm = self.modrm()?;
                Ok((
                    Op::Grp2 {
                        op: ShiftOp::from_index(modrm.reg),
                        width,
                        count: ShiftCount::One,
                    },
                    opcode,
                    Some(modrm),
                    None,
                    None,
                ))
            }
            0xD2 | 0xD3 => {
                let width = if byte == 0xD2 { Width::W8 } else { w };
                let modrm = self.modrm()?;
                Ok((
                    Op::Grp2 {
                        op: ShiftOp::from_index(modrm.reg),
                        width,
                        count: ShiftCount::Cl,
                    },
                    opcode,
                    Some(modrm),
                    None,
                    None,
                ))
            }
            0xD7 => Ok((Op::Xlat, opcode, None, None, None)),

            0xE0..=0xE2 => {
                let imm = self.cur.value(DataType::I8, 1)?;
                let kind = match byte {
                    0xE0 => LoopKind::Loopne,
                    0xE1 => LoopKind::Loope,
                    _ => LoopKind::Loop,
                };
                Ok((Op::Loop { kind }, opcode, None, Some(imm), None))
            }
            0xE3 => {
                let imm = self.cur.value(DataType::I8, 1)?;
                Ok((Op::Jcxz, opcode, None, Some(imm), None))
            }
            0xE8 => {
                let imm = self.rel_op_width()?;
                Ok((Op::CallNear, opcode, None, Some(imm), None))
            }
            0xE9 => {
                let imm = self.rel_op_width()?;
                Ok((Op::JmpNear, opcode, None, Some(imm), None))
            }
            0xEA => {
                let off = self.imm_op_width()?;
                let seg = self.cur.value(DataType::U16, 2)?;
                Ok((Op::JmpFar, opcode, None, Some(off), Some(seg)))
            }
            0xEB => {
                let imm = self.cur.value(DataType::I8, 1)?;
                Ok((Op::JmpShort, opcode, None, Some(imm), None))
            }

            0xF4 => Ok((Op::Hlt, opcode, None, None, None)),
            0xF5 => Ok((Op::Cmc, opcode, None, None, None)),
            0xF6 | 0xF7 => {
                let width = if byte == 0xF6 { Width::W8 } else { w };
                let modrm = self.modrm()?;
                let op = match modrm.reg {
                    0 | 1 => Grp3Op::TestImm,
                    2 => Grp3Op::Not,
                    3 => Grp3Op::Neg,
                    4 => Grp3Op::Mul,
                    5 => Grp3Op::Imul,
                    6 => Grp3Op::Div,
                    _ => Grp3Op::Idiv,
                };
                let imm = if op == Grp3Op::TestImm {
                    Some(match width {
                        Width::W8 => self.cur.value(DataType::U8, 1)?,
                        _ => self.imm_op_width()?,
                    })
                } else {
                    None
                };
                Ok((Op::Grp3 { op, width }, opcode, Some(modrm), imm, None))
            }
            0xF8 => Ok((Op::Clc, opcode, None, None, None)),
            0xF9 => Ok((Op::Stc, opcode, None, None, None)),
            0xFA => Ok((Op::Cli, opcode, None, None, None)),
            0xFB => Ok((Op::Sti, opcode, None, None, None)),
            0xFC => Ok((Op::Cld, opcode, None, None, None)),
            0xFD => Ok((Op::Std, opcode, None, None, None)),

            0xFE if self.cur.peek() == 0x38 => {
                // Reserved host-callback encoding FE 38 nn. Both the
                // marker and the index discriminate.
                let tail = self.cur.structural(DataType::U16, 2)?;
                let index = (tail.parsed_value() >> 8) as u8;
                Ok((Op::Callback { index }, opcode, None, Some(tail), None))
            }
            0xFE => {
                let modrm = self.modrm()?;
                let op = match modrm.reg {
                    0 => Grp45Op::IncRm,
                    1 => Grp45Op::DecRm,
                    _ => {
                        return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]))
                    }
                };
                Ok((
                    Op::Grp45 {
                        op,
                        width: Width::W8,
                    },
                    opcode,
                    Some(modrm),
                    None,
                    None,
                ))
            }
            0xFF => {
                let modrm = self.modrm()?;
                let op = match modrm.reg {
                    0 => Grp45Op::IncRm,
                    1 => Grp45Op::DecRm,
                    2 => Grp45Op::CallRm,
                    3 => Grp45Op::CallFarRm,
                    4 => Grp45Op::JmpRm,
                    5 => Grp45Op::JmpFarRm,
                    6 => Grp45Op::PushRm,
                    _ => {
                        return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]))
                    }
                };
                if matches!(op, Grp45Op::CallFarRm | Grp45Op::JmpFarRm) && modrm.is_register() {
                    return Err(self.invalid(vec![byte, modrm.field.parsed_value() as u8]));
                }
                Ok((Op::Grp45 { op, width: w }, opcode, Some(modrm), None, None))
            }

            _ => Err(self.invalid(vec![byte])),
        }
    }

    fn dispatch_0f(&mut self, escape: InstrField) -> Result<Decoded, ParseError> {
        let second = self.cur.structural(DataType::U8, 1)?;
        let byte = second.parsed_value() as u8;
        match byte {
            0x80..=0x8F => {
                let imm = self.rel_op_width()?;
                Ok((
                    Op::Jcc {
                        cond: Cond::from_index(byte),
                        near: true,
                    },
                    marker_join(escape, second),
                    None,
                    Some(imm),
                    None,
                ))
            }
            _ => Err(self.invalid(vec![0x0F, byte])),
        }
    }

    /// Shorthand for `opcode + modrm` instructions without immediates.
    fn with_modrm(
        &mut self,
        opcode: InstrField,
        make: impl FnOnce(&Self) -> Op,
    ) -> Result<Decoded, ParseError> {
        let modrm = self.modrm()?;
        let op = make(self);
        Ok((op, opcode, Some(modrm), None, None))
    }
}

/// Merges two adjacent structural single-byte fields into one two-byte
/// opcode field (0F escapes).
fn marker_join(first: InstrField, second: InstrField) -> InstrField {
    debug_assert_eq!(first.address() + 1, second.address());
    let bytes = vec![first.bytes()[0], second.bytes()[0]];
    InstrField::structural(first.address(), first.index(), DataType::U16, bytes)
}

/// Adapter so slice parsing reuses the port-based cursor.
struct SliceMemory<'a> {
    base: u32,
    bytes: &'a [u8],
}

impl MemoryPort for SliceMemory<'_> {
    fn read_u8(&self, addr: u32) -> u8 {
        self.bytes
            .get(addr.wrapping_sub(self.base) as usize)
            .copied()
            .unwrap_or(0)
    }

    fn write_u8(&mut self, _addr: u32, _value: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatMemory;

    const CS: u16 = 0x1000;

    fn parse(bytes: &[u8]) -> ParsedInstruction {
        Parser::new()
            .parse_slice(bytes, SegmentedAddress::new(CS, 0))
            .unwrap()
    }

    #[test]
    fn mov_reg_imm16() {
        let inst = parse(&[0xB8, 0x34, 0x12]);
        assert_eq!(inst.len(), 3);
        assert!(matches!(
            inst.op(),
            Op::MovRegImm {
                width: Width::W16,
                reg: 0
            }
        ));
        assert_eq!(inst.imm().unwrap().parsed_value(), 0x1234);
        assert!(!inst.imm().unwrap().is_final());
    }

    #[test]
    fn fields_cover_footprint_without_gaps() {
        let samples: &[&[u8]] = &[
            &[0xB8, 0x34, 0x12],
            &[0x01, 0xD8],                   // add ax, bx
            &[0x81, 0x86, 0x00, 0x10, 0x34, 0x12], // add [bp+0x1000], 0x1234
            &[0x2E, 0x8B, 0x44, 0x02],       // mov ax, cs:[si+2]
            &[0xF3, 0xA4],                   // rep movsb
            &[0xEA, 0x00, 0x01, 0x00, 0xF0], // jmp far f000:0100
            &[0xCD, 0x21],                   // int 21h
            &[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12],
        ];
        for bytes in samples {
            let inst = parse(bytes);
            assert_eq!(inst.len() as usize, bytes.len(), "{bytes:02X?}");
            let mut expected = inst.address().linear();
            let mut total = 0u32;
            for field in inst.fields() {
                assert_eq!(field.address(), expected, "{bytes:02X?}");
                expected += field.len() as u32;
                total += field.len() as u32;
            }
            assert_eq!(total, bytes.len() as u32);
            assert_eq!(inst.encode_bytes(), *bytes);
        }
    }

    #[test]
    fn prefix_stack() {
        let inst = parse(&[0x66, 0x2E, 0xA1, 0x00, 0x20]);
        assert_eq!(inst.op_width(), Width::W32);
        assert_eq!(inst.segment_override(), Some(SegReg::Cs));
        assert!(matches!(
            inst.op(),
            Op::MovAccMoffs {
                width: Width::W32,
                to_acc: true
            }
        ));
    }

    #[test]
    fn grp1_sign_extended() {
        let inst = parse(&[0x83, 0xC3, 0xFF]); // add bx, -1
        match inst.op() {
            Op::Alu {
                op: AluOp::Add,
                width: Width::W16,
                form: AluForm::RmImm { sext: true },
            } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(inst.imm().unwrap().parsed_value() as i64, -1);
    }

    #[test]
    fn modrm_disp_variants() {
        // mov ax, [0x1234]
        let inst = parse(&[0x8B, 0x06, 0x34, 0x12]);
        let modrm = inst.modrm().unwrap();
        assert_eq!(
            modrm.offset,
            MemoryOffsetKind::Off16(MemoryOffset16::Disp16)
        );
        assert_eq!(modrm.disp.as_ref().unwrap().parsed_value(), 0x1234);

        // mov ax, [bp-2]: BP defaults to SS
        let inst = parse(&[0x8B, 0x46, 0xFE]);
        let modrm = inst.modrm().unwrap();
        assert_eq!(modrm.segment, SegReg::Ss);
        assert_eq!(modrm.disp.as_ref().unwrap().parsed_value() as i64, -2);
    }

    #[test]
    fn sib_with_disp8() {
        // 67 8B 44 8B 04: mov ax, [ebx + ecx*4 + 4]
        let inst = parse(&[0x67, 0x8B, 0x44, 0x8B, 0x04]);
        let modrm = inst.modrm().unwrap();
        assert_eq!(modrm.addr_width, AddrWidth::A32);
        let sib = modrm.sib.unwrap();
        assert_eq!(sib.scale, 2);
        assert_eq!(sib.index, Some(crate::state::Gpr::Cx));
        assert_eq!(sib.base, Some(crate::state::Gpr::Bx));
    }

    #[test]
    fn int_vector_is_structural() {
        let inst = parse(&[0xCD, 0x21]);
        assert!(matches!(inst.op(), Op::Int { vector: 0x21 }));
        let sig = inst.signature();
        assert!(sig.matches(&[0xCD, 0x21]));
        assert!(!sig.matches(&[0xCD, 0x10]));
    }

    #[test]
    fn immediates_are_wildcards_in_signature() {
        let inst = parse(&[0xB8, 0x34, 0x12]);
        let sig = inst.signature();
        // Truncated before the non-final immediate.
        assert_eq!(sig.len(), 1);
        assert!(sig.matches(&[0xB8, 0x99, 0x99]));
    }

    #[test]
    fn callback_encoding() {
        let inst = parse(&[0xFE, 0x38, 0x07]);
        assert!(matches!(inst.op(), Op::Callback { index: 7 }));
        assert_eq!(inst.len(), 3);
        let sig = inst.signature();
        assert_eq!(sig.len(), 3);
        assert!(sig.matches(&[0xFE, 0x38, 0x07]));
        assert!(!sig.matches(&[0xFE, 0x38, 0x08]));
    }

    #[test]
    fn two_byte_jcc() {
        let inst = parse(&[0x0F, 0x84, 0x10, 0x00]); // je +0x10 (near)
        assert!(matches!(
            inst.op(),
            Op::Jcc {
                cond: Cond::E,
                near: true
            }
        ));
        assert_eq!(inst.len(), 4);
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let err = Parser::new()
            .parse_slice(&[0xD8, 0x00], SegmentedAddress::new(CS, 0))
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidOpcode { .. }));
    }

    #[test]
    fn truncated_slice() {
        let err = Parser::new()
            .parse_slice(&[0xB8, 0x34], SegmentedAddress::new(CS, 0))
            .unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn runaway_prefixes_hit_length_cap() {
        let bytes = [0x66; 16];
        let err = Parser::new()
            .parse_slice(&bytes, SegmentedAddress::new(CS, 0))
            .unwrap_err();
        assert!(matches!(err, ParseError::TooLong { .. }));
    }

    #[test]
    fn parse_from_memory_port() {
        let mut mem = FlatMemory::new(0x10_0000);
        mem.load_bytes(0x10000, &[0xEB, 0xFE]);
        let inst = Parser::new()
            .parse(&mem, SegmentedAddress::new(CS, 0))
            .unwrap();
        assert!(matches!(inst.op(), Op::JmpShort));
        assert_eq!(inst.imm().unwrap().parsed_value() as i64, -2);
    }
}
