//! Placeholder encoder for the five architectures `spec.md` §2 lists but
//! this rewrite does not encode for: `X86`, `Arm32`, `Mips64`, `Ppc32`,
//! `Ppc64`. Registering them (rather than omitting them from [`crate::jit::arch::Arch`])
//! matches `raya-engine`'s own backend table, which lists every
//! `TargetArch` variant even where only two have a working encoder.

use crate::jit::emitter::{Emitter, HelperArg, JmpPatch};
use crate::jit::error::CodegenError;

pub(crate) struct StubEmitter;

impl Emitter for StubEmitter {
    fn supports(&self) -> Result<(), CodegenError> {
        Err(CodegenError::UnsupportedInstruction("<no encoder for this architecture>"))
    }

    fn offset(&self) -> u32 {
        0
    }

    fn emit_prologue(&mut self) {}
    fn emit_success_epilogue(&mut self) {}
    fn emit_lineinfo(&mut self, _line: i32) {}
    fn emit_assign(&mut self, _dst: u16, _src: u16) {}
    fn emit_iconst(&mut self, _dst: u16, _v: i32) {}
    fn emit_fconst(&mut self, _dst: u16, _bits: u32) {}
    fn emit_inc(&mut self, _dst: u16) {}
    fn emit_helper_call(&mut self, _helper: usize, _args: &[HelperArg]) {}
    fn emit_truthy_call(&mut self, _src: u16) {}

    fn emit_jmp(&mut self) -> JmpPatch {
        JmpPatch(0)
    }

    fn emit_jmp_if(&mut self, _jump_if_true: bool) -> JmpPatch {
        JmpPatch(0)
    }

    fn patch_jmp(&mut self, _patch: JmpPatch, _target_offset: u32) {}

    fn into_code(self: Box<Self>) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::emitter::compile_function;

    #[test]
    fn stub_rejects_every_function() {
        let emitter: Box<dyn Emitter> = Box::new(StubEmitter);
        let err = compile_function(emitter, &[0x00, 0x27, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedInstruction(_)));
    }
}
