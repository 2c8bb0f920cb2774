//! Failure modes for single-function JIT compilation (`spec.md` §4.6:
//! "any failure during emission aborts the single function's compilation
//! and marks it interpreter-only").

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The target architecture has no real encoder (`spec.md` §2 names
    /// seven ISAs; only two are implemented, see `SPEC_FULL.md` §D).
    UnsupportedArch,
    /// An opcode this backend declines to JIT. `CALL`/`THISCALL` always
    /// land here (see `DESIGN.md`); a stub backend returns it for every
    /// opcode.
    UnsupportedInstruction(&'static str),
    /// The process-wide code region is full.
    CodeTooBig,
    /// The bytecode stream ended mid-instruction.
    BrokenBytecode,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::UnsupportedArch => write!(f, "no JIT encoder for this architecture"),
            CodegenError::UnsupportedInstruction(op) => write!(f, "opcode '{op}' is not JIT-compiled"),
            CodegenError::CodeTooBig => write!(f, "JIT code region exhausted"),
            CodegenError::BrokenBytecode => write!(f, "broken bytecode"),
        }
    }
}

impl std::error::Error for CodegenError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_offending_opcode() {
        let e = CodegenError::UnsupportedInstruction("CALL");
        assert_eq!(e.to_string(), "opcode 'CALL' is not JIT-compiled");
    }

    #[test]
    fn display_messages_are_distinct_per_variant() {
        let variants = [
            CodegenError::UnsupportedArch,
            CodegenError::UnsupportedInstruction("THISCALL"),
            CodegenError::CodeTooBig,
            CodegenError::BrokenBytecode,
        ];
        let mut seen = Vec::new();
        for v in &variants {
            let msg = v.to_string();
            assert!(!seen.contains(&msg), "duplicate message: {msg}");
            seen.push(msg);
        }
    }

    #[test]
    fn equality_is_by_variant_and_payload() {
        assert_eq!(CodegenError::UnsupportedArch, CodegenError::UnsupportedArch);
        assert_ne!(CodegenError::UnsupportedInstruction("CALL"), CodegenError::UnsupportedInstruction("THISCALL"));
    }
}
