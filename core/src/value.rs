use crate::arm;
use crate::block::InstId;

/// An argument slot of an IR instruction: either a typed immediate or a
/// reference into the owning block's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Unset argument slot.
    Void,
    /// Reference to the result of another instruction in the same block.
    Inst(InstId),
    ImmU1(bool),
    ImmU8(u8),
    ImmU32(u32),
    ImmU64(u64),
    Reg(arm::Reg),
    ExtReg(arm::ExtReg),
    /// Packed coprocessor instruction fields, decoded by the emitter.
    CoprocInfo([u8; 8]),
}

impl Value {
    #[inline]
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Value::Inst(_))
    }

    pub fn inst(&self) -> InstId {
        match *self {
            Value::Inst(id) => id,
            _ => panic!("value is not an instruction reference: {self:?}"),
        }
    }

    pub fn u1(&self) -> bool {
        match *self {
            Value::ImmU1(v) => v,
            _ => panic!("value is not a U1 immediate: {self:?}"),
        }
    }

    pub fn u8_(&self) -> u8 {
        match *self {
            Value::ImmU8(v) => v,
            _ => panic!("value is not a U8 immediate: {self:?}"),
        }
    }

    pub fn u32_(&self) -> u32 {
        match *self {
            Value::ImmU32(v) => v,
            _ => panic!("value is not a U32 immediate: {self:?}"),
        }
    }

    pub fn u64_(&self) -> u64 {
        match *self {
            Value::ImmU64(v) => v,
            _ => panic!("value is not a U64 immediate: {self:?}"),
        }
    }

    pub fn reg(&self) -> arm::Reg {
        match *self {
            Value::Reg(r) => r,
            _ => panic!("value is not a register reference: {self:?}"),
        }
    }

    pub fn ext_reg(&self) -> arm::ExtReg {
        match *self {
            Value::ExtReg(r) => r,
            _ => panic!("value is not an extended-register reference: {self:?}"),
        }
    }

    pub fn coproc_info(&self) -> [u8; 8] {
        match *self {
            Value::CoprocInfo(info) => info,
            _ => panic!("value is not coprocessor info: {self:?}"),
        }
    }

    /// The immediate zero-extended to 64 bits, whatever its width.
    /// Used when materialising an immediate into a host register.
    pub fn imm_bits(&self) -> u64 {
        match *self {
            Value::ImmU1(v) => v as u64,
            Value::ImmU8(v) => v as u64,
            Value::ImmU32(v) => v as u64,
            Value::ImmU64(v) => v,
            _ => panic!("value is not an immediate: {self:?}"),
        }
    }
}
