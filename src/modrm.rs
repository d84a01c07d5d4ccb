//! ModR/M and SIB addressing-mode context.

use crate::field::InstrField;
use crate::mem::MemoryPort;
use crate::state::{AddrWidth, CpuState, Gpr, SegReg};

/// The memory-offset shape selected by a 16-bit ModR/M `r/m` encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryOffset16 {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    /// `mod == 00, r/m == 110`: direct 16-bit displacement.
    Disp16,
    Bx,
    /// `r/m == 110` with a non-zero mod: BP plus displacement.
    Bp,
}

impl MemoryOffset16 {
    pub fn from_rm(mode: u8, rm: u8) -> MemoryOffset16 {
        match rm & 7 {
            0 => MemoryOffset16::BxSi,
            1 => MemoryOffset16::BxDi,
            2 => MemoryOffset16::BpSi,
            3 => MemoryOffset16::BpDi,
            4 => MemoryOffset16::Si,
            5 => MemoryOffset16::Di,
            6 if mode == 0 => MemoryOffset16::Disp16,
            6 => MemoryOffset16::Bp,
            _ => MemoryOffset16::Bx,
        }
    }

    /// Stack-segment-relative offsets default to SS, everything else DS.
    pub fn default_segment(self) -> SegReg {
        match self {
            MemoryOffset16::BpSi | MemoryOffset16::BpDi | MemoryOffset16::Bp => SegReg::Ss,
            _ => SegReg::Ds,
        }
    }

    fn base_index(self, state: &CpuState) -> u16 {
        match self {
            MemoryOffset16::BxSi => state.bx().wrapping_add(state.si()),
            MemoryOffset16::BxDi => state.bx().wrapping_add(state.di()),
            MemoryOffset16::BpSi => state.bp().wrapping_add(state.si()),
            MemoryOffset16::BpDi => state.bp().wrapping_add(state.di()),
            MemoryOffset16::Si => state.si(),
            MemoryOffset16::Di => state.di(),
            MemoryOffset16::Disp16 => 0,
            MemoryOffset16::Bx => state.bx(),
            MemoryOffset16::Bp => state.bp(),
        }
    }
}

/// The memory-offset shape selected by a 32-bit ModR/M `r/m` encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryOffset32 {
    /// A plain base register.
    Reg(Gpr),
    /// `r/m == 100`: a SIB byte follows.
    Sib,
    /// `mod == 00, r/m == 101`: direct 32-bit displacement.
    Disp32,
}

/// Decoded SIB byte: `base + (index << scale)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct SibContext {
    pub scale: u8,
    /// `None` when the index encoding is 100 (no index).
    pub index: Option<Gpr>,
    /// `None` for `mod == 00, base == 101`: the base is a disp32 instead.
    pub base: Option<Gpr>,
}

impl SibContext {
    pub fn decode(byte: u8, mode: u8) -> SibContext {
        let scale = byte >> 6;
        let index_bits = (byte >> 3) & 7;
        let base_bits = byte & 7;
        SibContext {
            scale,
            index: (index_bits != 4).then(|| Gpr::from_index(index_bits)),
            base: (!(mode == 0 && base_bits == 5)).then(|| Gpr::from_index(base_bits)),
        }
    }

    fn base_index(&self, state: &CpuState) -> u32 {
        let base = self.base.map_or(0, |r| state.reg32(r));
        let index = self.index.map_or(0, |r| state.reg32(r) << self.scale);
        base.wrapping_add(index)
    }
}

/// One of the two address-width-specific offset shapes, or none at all for
/// `mod == 11` register operands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryOffsetKind {
    Register,
    Off16(MemoryOffset16),
    Off32(MemoryOffset32),
}

/// Everything the executor needs to resolve a ModR/M operand.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ModRmContext {
    pub field: InstrField,
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
    pub addr_width: AddrWidth,
    pub offset: MemoryOffsetKind,
    pub sib_field: Option<InstrField>,
    pub sib: Option<SibContext>,
    pub disp: Option<InstrField>,
    /// Default segment for the offset shape, or the prefix override.
    pub segment: SegReg,
}

impl ModRmContext {
    /// True when the operand is a register (`mod == 11`).
    pub fn is_register(&self) -> bool {
        self.mode == 3
    }

    fn displacement<M: MemoryPort + ?Sized>(&self, mem: &M) -> i64 {
        self.disp.as_ref().map_or(0, |d| d.live_value(mem) as i64)
    }

    /// Effective in-segment offset of a memory operand.
    ///
    /// 16-bit addressing wraps to 16 bits; 32-bit addressing wraps to 32.
    pub fn effective_offset<M: MemoryPort + ?Sized>(&self, state: &CpuState, mem: &M) -> u32 {
        let disp = self.displacement(mem);
        match self.offset {
            MemoryOffsetKind::Register => 0,
            MemoryOffsetKind::Off16(off) => {
                (off.base_index(state) as i64 + disp) as u16 as u32
            }
            MemoryOffsetKind::Off32(off) => {
                let base = match off {
                    MemoryOffset32::Reg(r) => state.reg32(r),
                    MemoryOffset32::Sib => {
                        self.sib.as_ref().map_or(0, |s| s.base_index(state))
                    }
                    MemoryOffset32::Disp32 => 0,
                };
                (base as i64 + disp) as u32
            }
        }
    }

    /// Linear address of a memory operand: `segment * 16 + offset`.
    pub fn effective_address<M: MemoryPort + ?Sized>(&self, state: &CpuState, mem: &M) -> u32 {
        let seg = state.seg(self.segment) as u32;
        (seg << 4).wrapping_add(self.effective_offset(state, mem)) & 0xF_FFFF
    }

    /// Fields of this context in byte order: ModR/M, SIB, displacement.
    pub fn fields(&self) -> impl Iterator<Item = &InstrField> {
        core::iter::once(&self.field)
            .chain(self.sib_field.iter())
            .chain(self.disp.iter())
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = &mut InstrField> {
        core::iter::once(&mut self.field)
            .chain(self.sib_field.iter_mut())
            .chain(self.disp.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::mem::FlatMemory;

    fn ctx16(mode: u8, rm: u8, disp: Option<InstrField>, segment: SegReg) -> ModRmContext {
        let byte = (mode << 6) | rm;
        ModRmContext {
            field: InstrField::structural(0x101, 1, DataType::U8, vec![byte]),
            mode,
            reg: 0,
            rm,
            addr_width: AddrWidth::A16,
            offset: MemoryOffsetKind::Off16(MemoryOffset16::from_rm(mode, rm)),
            sib_field: None,
            sib: None,
            disp,
            segment,
        }
    }

    #[test]
    fn bx_si_with_disp8_wraps_16_bit() {
        let mem = FlatMemory::new(0x100);
        let mut state = CpuState::new();
        state.set_bx(0xFFFF);
        state.set_si(0x0001);
        let disp = InstrField::value_field(0x102, 2, DataType::I8, vec![0x02]);
        let ctx = ctx16(1, 0, Some(disp), SegReg::Ds);
        assert_eq!(ctx.effective_offset(&state, &mem), 0x0002);
    }

    #[test]
    fn bp_defaults_to_stack_segment() {
        assert_eq!(MemoryOffset16::from_rm(1, 6), MemoryOffset16::Bp);
        assert_eq!(MemoryOffset16::Bp.default_segment(), SegReg::Ss);
        assert_eq!(MemoryOffset16::from_rm(0, 6), MemoryOffset16::Disp16);
        assert_eq!(MemoryOffset16::Disp16.default_segment(), SegReg::Ds);
    }

    #[test]
    fn negative_disp_subtracts() {
        let mem = FlatMemory::new(0x100);
        let mut state = CpuState::new();
        state.set_bx(0x1000);
        let disp = InstrField::value_field(0x102, 2, DataType::I8, vec![0xFE]);
        let ctx = ctx16(1, 7, Some(disp), SegReg::Ds);
        assert_eq!(ctx.effective_offset(&state, &mem), 0x0FFE);
    }

    #[test]
    fn sib_scales_index() {
        let mem = FlatMemory::new(0x100);
        let mut state = CpuState::new();
        state.set_reg32(Gpr::Bx, 0x1000);
        state.set_reg32(Gpr::Cx, 0x10);
        let sib = SibContext::decode(0b10_001_011, 1); // scale 4, index ECX, base EBX
        assert_eq!(sib.scale, 2);
        assert_eq!(sib.index, Some(Gpr::Cx));
        assert_eq!(sib.base, Some(Gpr::Bx));
        let ctx = ModRmContext {
            field: InstrField::structural(0x101, 1, DataType::U8, vec![0x44]),
            mode: 1,
            reg: 0,
            rm: 4,
            addr_width: AddrWidth::A32,
            offset: MemoryOffsetKind::Off32(MemoryOffset32::Sib),
            sib_field: Some(InstrField::structural(0x102, 2, DataType::U8, vec![0b10_001_011])),
            sib: Some(sib),
            disp: None,
            segment: SegReg::Ds,
        };
        assert_eq!(ctx.effective_offset(&state, &mem), 0x1040);
    }
}
