//! The flat bytecode instruction set. Numeric values follow `lir.h`'s
//! `enum bytecode` / `runtime.h`'s `enum rt_bytecode` exactly — both the
//! interpreter (`crate::interpreter`) and every JIT backend (`crate::jit`)
//! switch on these values, so they are part of this crate's wire format
//! even though no external tool reads our bytecode files.
//!
//! Every multi-byte immediate is big-endian (`spec.md` §4.2); a `Tmpvar`
//! operand is a `u16` register index, an `Imm32` a 4-byte integer or IEEE
//! float bit pattern, and a `CStr` operand a NUL-terminated byte string.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0x00,
    Assign = 0x01,
    IConst = 0x02,
    FConst = 0x03,
    SConst = 0x04,
    AConst = 0x05,
    DConst = 0x06,
    Inc = 0x07,
    Neg = 0x08,
    Add = 0x09,
    Sub = 0x0a,
    Mul = 0x0b,
    Div = 0x0c,
    Mod = 0x0d,
    And = 0x0e,
    Or = 0x0f,
    Xor = 0x10,
    Lt = 0x11,
    Lte = 0x12,
    Gt = 0x13,
    Gte = 0x14,
    Eq = 0x15,
    Neq = 0x16,
    EqI = 0x17,
    LoadArray = 0x18,
    StoreArray = 0x19,
    Len = 0x1a,
    GetDictKeyByIndex = 0x1b,
    GetDictValByIndex = 0x1c,
    StoreDot = 0x1d,
    LoadDot = 0x1e,
    StoreSymbol = 0x1f,
    LoadSymbol = 0x20,
    Call = 0x21,
    ThisCall = 0x22,
    Jmp = 0x23,
    JmpIfTrue = 0x24,
    JmpIfFalse = 0x25,
    JmpIfEq = 0x26,
    LineInfo = 0x27,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match b {
            0x00 => Nop,
            0x01 => Assign,
            0x02 => IConst,
            0x03 => FConst,
            0x04 => SConst,
            0x05 => AConst,
            0x06 => DConst,
            0x07 => Inc,
            0x08 => Neg,
            0x09 => Add,
            0x0a => Sub,
            0x0b => Mul,
            0x0c => Div,
            0x0d => Mod,
            0x0e => And,
            0x0f => Or,
            0x10 => Xor,
            0x11 => Lt,
            0x12 => Lte,
            0x13 => Gt,
            0x14 => Gte,
            0x15 => Eq,
            0x16 => Neq,
            0x17 => EqI,
            0x18 => LoadArray,
            0x19 => StoreArray,
            0x1a => Len,
            0x1b => GetDictKeyByIndex,
            0x1c => GetDictValByIndex,
            0x1d => StoreDot,
            0x1e => LoadDot,
            0x1f => StoreSymbol,
            0x20 => LoadSymbol,
            0x21 => Call,
            0x22 => ThisCall,
            0x23 => Jmp,
            0x24 => JmpIfTrue,
            0x25 => JmpIfFalse,
            0x26 => JmpIfEq,
            0x27 => LineInfo,
            _ => return None,
        };
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_round_trips_every_variant() {
        let all = [
            Opcode::Nop, Opcode::Assign, Opcode::IConst, Opcode::FConst, Opcode::SConst, Opcode::AConst,
            Opcode::DConst, Opcode::Inc, Opcode::Neg, Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div,
            Opcode::Mod, Opcode::And, Opcode::Or, Opcode::Xor, Opcode::Lt, Opcode::Lte, Opcode::Gt,
            Opcode::Gte, Opcode::Eq, Opcode::Neq, Opcode::EqI, Opcode::LoadArray, Opcode::StoreArray,
            Opcode::Len, Opcode::GetDictKeyByIndex, Opcode::GetDictValByIndex, Opcode::StoreDot,
            Opcode::LoadDot, Opcode::StoreSymbol, Opcode::LoadSymbol, Opcode::Call, Opcode::ThisCall,
            Opcode::Jmp, Opcode::JmpIfTrue, Opcode::JmpIfFalse, Opcode::JmpIfEq, Opcode::LineInfo,
        ];
        for op in all {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
    }

    #[test]
    fn from_u8_rejects_unknown_bytes() {
        assert_eq!(Opcode::from_u8(0x28), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn eqi_and_jmpifeq_are_kept_alongside_eq_and_jmpiftrue() {
        // spec.md requires these either both kept or both dropped together.
        assert_ne!(Opcode::Eq as u8, Opcode::EqI as u8);
        assert_ne!(Opcode::JmpIfTrue as u8, Opcode::JmpIfEq as u8);
    }
}
