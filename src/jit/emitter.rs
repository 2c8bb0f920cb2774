//! The architecture-independent half of code generation: the opcode
//! visitor that walks one function's bytecode once (`spec.md` §4.6, "a
//! single-pass emitter walks the same bytecode stream") and drives an
//! [`Emitter`] implementation. Each target architecture supplies only the
//! byte-level encoding; the control-flow shape (which opcodes are trivial,
//! which go through a helper call, how jump targets get patched) lives
//! here once.
//!
//! Grounded on `jit-x86_64.c`'s `jit_visit_bytecode` dispatch loop and its
//! `pc_entry`/`branch_patch` tables (`examples/original_source/src/jit-x86_64.c`),
//! generalized across backends the way `ASM_BINARY_OP`/`ASM_UNARY_OP`
//! generalize across opcodes within one backend.

use crate::interpreter::Cursor;
use crate::jit::error::CodegenError;
use crate::jit::helpers;
use crate::lir::opcode::Opcode;

/// An argument to a helper call: either a 16-bit register index/small
/// immediate, or a 64-bit pointer/length baked in for string operands.
#[derive(Clone, Copy)]
pub(crate) enum HelperArg {
    U16(u16),
    U64(u64),
}

/// An unresolved jump: the code offset of the instruction's relative
/// displacement field, recorded so [`compile_function`] can patch it once
/// every bytecode offset has a known native-code address.
#[derive(Clone, Copy)]
pub(crate) struct JmpPatch(pub(crate) u32);

/// Per-architecture machine code emission. Implementors only encode
/// bytes; [`compile_function`] below owns the bytecode walk, the
/// `CALL`/`THISCALL` bailout, and jump-target bookkeeping.
pub(crate) trait Emitter {
    /// Checked once, before any opcode is visited. The five architectures
    /// with no real encoder implement this trait only to report
    /// [`CodegenError::UnsupportedInstruction`] here rather than duplicate
    /// that failure into every method below (see `DESIGN.md`).
    fn supports(&self) -> Result<(), CodegenError> {
        Ok(())
    }
    fn offset(&self) -> u32;
    fn emit_prologue(&mut self);
    /// Emits `return true` at the current position.
    fn emit_success_epilogue(&mut self);
    fn emit_lineinfo(&mut self, line: i32);
    fn emit_assign(&mut self, dst: u16, src: u16);
    fn emit_iconst(&mut self, dst: u16, v: i32);
    fn emit_fconst(&mut self, dst: u16, bits: u32);
    fn emit_inc(&mut self, dst: u16);
    /// `call helper(env, frame_base, ...args)`; if it returns false, the
    /// compiled function returns false immediately (`ASM_BINARY_OP`'s
    /// `jne next` / `jmp *%r13` pattern, inlined per call site rather
    /// than routed through one shared trampoline).
    fn emit_helper_call(&mut self, helper: usize, args: &[HelperArg]);
    /// `call jit_truthy_helper(env, frame_base, src)`, leaving the
    /// condition available for the immediately following conditional
    /// jump — unlike [`Emitter::emit_helper_call`], a `false` result is
    /// not a failure.
    fn emit_truthy_call(&mut self, src: u16);
    /// Unconditional jump. Returns the patch handle for the displacement
    /// field so the caller can resolve it once the target's offset is
    /// known (immediately, for a backward jump).
    fn emit_jmp(&mut self) -> JmpPatch;
    /// Conditional jump testing the result of the immediately preceding
    /// [`Emitter::emit_truthy_call`].
    fn emit_jmp_if(&mut self, jump_if_true: bool) -> JmpPatch;
    fn patch_jmp(&mut self, patch: JmpPatch, target_offset: u32);
    fn into_code(self: Box<Self>) -> Vec<u8>;
}

fn opcode_name(op: Opcode) -> &'static str {
    match op {
        Opcode::Call => "CALL",
        Opcode::ThisCall => "THISCALL",
        _ => "unknown",
    }
}

/// Scans `code` once for `CALL`/`THISCALL` without emitting anything.
/// `spec.md` §4.6 sanctions per-function emission failure as a normal
/// outcome; argument marshalling for a variable-length call is
/// disproportionate to build on top of a helper-call-only model (see
/// `DESIGN.md`), so both opcodes are an unconditional bailout on every
/// backend, including the two with real encoders.
fn reject_calls(code: &[u8]) -> Result<(), CodegenError> {
    let mut cur = Cursor { code, pc: 0 };
    while cur.pc < code.len() {
        let opb = cur.u8().ok_or(CodegenError::BrokenBytecode)?;
        let op = Opcode::from_u8(opb).ok_or(CodegenError::BrokenBytecode)?;
        match op {
            Opcode::Call | Opcode::ThisCall => return Err(CodegenError::UnsupportedInstruction(opcode_name(op))),
            _ => skip_operands(&mut cur, op)?,
        }
    }
    Ok(())
}

fn skip_operands(cur: &mut Cursor, op: Opcode) -> Result<(), CodegenError> {
    let bad = || CodegenError::BrokenBytecode;
    match op {
        Opcode::Nop => {}
        Opcode::Assign | Opcode::Neg => {
            cur.u16().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
        }
        Opcode::IConst => {
            cur.u16().ok_or_else(bad)?;
            cur.i32().ok_or_else(bad)?;
        }
        Opcode::FConst => {
            cur.u16().ok_or_else(bad)?;
            cur.u32().ok_or_else(bad)?;
        }
        Opcode::SConst | Opcode::AConst | Opcode::DConst | Opcode::Inc => {
            cur.u16().ok_or_else(bad)?;
            if op == Opcode::SConst {
                cur.cstr().ok_or_else(bad)?;
            }
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Lt
        | Opcode::Lte | Opcode::Gt | Opcode::Gte | Opcode::Eq | Opcode::Neq | Opcode::EqI | Opcode::LoadArray | Opcode::StoreArray
        | Opcode::GetDictKeyByIndex | Opcode::GetDictValByIndex => {
            cur.u16().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
        }
        Opcode::Len => {
            cur.u16().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
        }
        Opcode::StoreDot => {
            cur.u16().ok_or_else(bad)?;
            cur.cstr().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
        }
        Opcode::LoadDot => {
            cur.u16().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
            cur.cstr().ok_or_else(bad)?;
        }
        Opcode::StoreSymbol => {
            cur.cstr().ok_or_else(bad)?;
            cur.u16().ok_or_else(bad)?;
        }
        Opcode::LoadSymbol => {
            cur.u16().ok_or_else(bad)?;
            cur.cstr().ok_or_else(bad)?;
        }
        Opcode::Call | Opcode::ThisCall => unreachable!("handled by the caller"),
        Opcode::Jmp => {
            cur.u32().ok_or_else(bad)?;
        }
        Opcode::JmpIfTrue | Opcode::JmpIfEq | Opcode::JmpIfFalse => {
            cur.u16().ok_or_else(bad)?;
            cur.u32().ok_or_else(bad)?;
        }
        Opcode::LineInfo => {
            cur.i32().ok_or_else(bad)?;
        }
    }
    Ok(())
}

/// Translates one function's bytecode with `emitter`, returning the
/// finished machine code on success. Mirrors `jit_build`'s
/// `jit_visit_bytecode` + branch-patch pass
/// (`examples/original_source/src/jit-x86_64.c`).
pub(crate) fn compile_function(mut emitter: Box<dyn Emitter>, code: &[u8]) -> Result<Vec<u8>, CodegenError> {
    reject_calls(code)?;
    emitter.supports()?;

    emitter.emit_prologue();

    let mut pc_map: Vec<(u32, u32)> = Vec::new();
    let mut pending: Vec<(JmpPatch, u32)> = Vec::new();

    let mut cur = Cursor { code, pc: 0 };
    let bad = || CodegenError::BrokenBytecode;

    while cur.pc < code.len() {
        let lpc = cur.pc as u32;
        pc_map.push((lpc, emitter.offset()));

        let opb = cur.u8().ok_or_else(bad)?;
        let op = Opcode::from_u8(opb).ok_or_else(bad)?;

        match op {
            Opcode::Nop => {}
            Opcode::Assign => {
                let dst = cur.u16().ok_or_else(bad)?;
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_assign(dst, src);
            }
            Opcode::IConst => {
                let dst = cur.u16().ok_or_else(bad)?;
                let v = cur.i32().ok_or_else(bad)?;
                emitter.emit_iconst(dst, v);
            }
            Opcode::FConst => {
                let dst = cur.u16().ok_or_else(bad)?;
                let bits = cur.u32().ok_or_else(bad)?;
                emitter.emit_fconst(dst, bits);
            }
            Opcode::Inc => {
                let dst = cur.u16().ok_or_else(bad)?;
                emitter.emit_inc(dst);
            }
            Opcode::SConst => {
                let dst = cur.u16().ok_or_else(bad)?;
                let start = cur.pc;
                let s = cur.cstr().ok_or_else(bad)?;
                let ptr = code[start..].as_ptr();
                emitter.emit_helper_call(
                    helpers::jit_makestring_helper as usize,
                    &[HelperArg::U16(dst), HelperArg::U64(ptr as u64), HelperArg::U64(s.len() as u64)],
                );
            }
            Opcode::AConst => {
                let dst = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_makearray_helper as usize, &[HelperArg::U16(dst)]);
            }
            Opcode::DConst => {
                let dst = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_makedict_helper as usize, &[HelperArg::U16(dst)]);
            }
            Opcode::Neg => {
                let dst = cur.u16().ok_or_else(bad)?;
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_neg_helper as usize, &[HelperArg::U16(dst), HelperArg::U16(src)]);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Lt
            | Opcode::Lte | Opcode::Gt | Opcode::Gte | Opcode::Eq | Opcode::Neq | Opcode::EqI => {
                let dst = cur.u16().ok_or_else(bad)?;
                let a = cur.u16().ok_or_else(bad)?;
                let b = cur.u16().ok_or_else(bad)?;
                let helper = binop_helper(op);
                emitter.emit_helper_call(helper, &[HelperArg::U16(dst), HelperArg::U16(a), HelperArg::U16(b)]);
            }
            Opcode::LoadArray => {
                let dst = cur.u16().ok_or_else(bad)?;
                let arr = cur.u16().ok_or_else(bad)?;
                let idx = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_loadarray_helper as usize, &[HelperArg::U16(dst), HelperArg::U16(arr), HelperArg::U16(idx)]);
            }
            Opcode::StoreArray => {
                let arr = cur.u16().ok_or_else(bad)?;
                let idx = cur.u16().ok_or_else(bad)?;
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_storearray_helper as usize, &[HelperArg::U16(arr), HelperArg::U16(idx), HelperArg::U16(src)]);
            }
            Opcode::Len => {
                let dst = cur.u16().ok_or_else(bad)?;
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(helpers::jit_len_helper as usize, &[HelperArg::U16(dst), HelperArg::U16(src)]);
            }
            Opcode::GetDictKeyByIndex | Opcode::GetDictValByIndex => {
                let dst = cur.u16().ok_or_else(bad)?;
                let dreg = cur.u16().ok_or_else(bad)?;
                let ireg = cur.u16().ok_or_else(bad)?;
                let helper = if op == Opcode::GetDictKeyByIndex { helpers::jit_dictkeyat_helper as usize } else { helpers::jit_dictvalat_helper as usize };
                emitter.emit_helper_call(helper, &[HelperArg::U16(dst), HelperArg::U16(dreg), HelperArg::U16(ireg)]);
            }
            Opcode::StoreDot => {
                let obj = cur.u16().ok_or_else(bad)?;
                let start = cur.pc;
                let name = cur.cstr().ok_or_else(bad)?;
                let ptr = code[start..].as_ptr();
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(
                    helpers::jit_storedot_helper as usize,
                    &[HelperArg::U16(obj), HelperArg::U64(ptr as u64), HelperArg::U64(name.len() as u64), HelperArg::U16(src)],
                );
            }
            Opcode::LoadDot => {
                let dst = cur.u16().ok_or_else(bad)?;
                let obj = cur.u16().ok_or_else(bad)?;
                let start = cur.pc;
                let name = cur.cstr().ok_or_else(bad)?;
                let ptr = code[start..].as_ptr();
                emitter.emit_helper_call(
                    helpers::jit_loaddot_helper as usize,
                    &[HelperArg::U16(dst), HelperArg::U16(obj), HelperArg::U64(ptr as u64), HelperArg::U64(name.len() as u64)],
                );
            }
            Opcode::StoreSymbol => {
                let start = cur.pc;
                let name = cur.cstr().ok_or_else(bad)?;
                let ptr = code[start..].as_ptr();
                let src = cur.u16().ok_or_else(bad)?;
                emitter.emit_helper_call(
                    helpers::jit_storesymbol_helper as usize,
                    &[HelperArg::U64(ptr as u64), HelperArg::U64(name.len() as u64), HelperArg::U16(src)],
                );
            }
            Opcode::LoadSymbol => {
                let dst = cur.u16().ok_or_else(bad)?;
                let start = cur.pc;
                let name = cur.cstr().ok_or_else(bad)?;
                let ptr = code[start..].as_ptr();
                emitter.emit_helper_call(
                    helpers::jit_loadsymbol_helper as usize,
                    &[HelperArg::U16(dst), HelperArg::U64(ptr as u64), HelperArg::U64(name.len() as u64)],
                );
            }
            Opcode::Call | Opcode::ThisCall => unreachable!("rejected by reject_calls"),
            Opcode::Jmp => {
                let target = cur.u32().ok_or_else(bad)?;
                resolve_jump(&mut emitter, &mut pc_map, &mut pending, target, |e| e.emit_jmp());
            }
            Opcode::JmpIfTrue | Opcode::JmpIfEq => {
                let src = cur.u16().ok_or_else(bad)?;
                let target = cur.u32().ok_or_else(bad)?;
                emitter.emit_truthy_call(src);
                resolve_jump(&mut emitter, &mut pc_map, &mut pending, target, |e| e.emit_jmp_if(true));
            }
            Opcode::JmpIfFalse => {
                let src = cur.u16().ok_or_else(bad)?;
                let target = cur.u32().ok_or_else(bad)?;
                emitter.emit_truthy_call(src);
                resolve_jump(&mut emitter, &mut pc_map, &mut pending, target, |e| e.emit_jmp_if(false));
            }
            Opcode::LineInfo => {
                let line = cur.i32().ok_or_else(bad)?;
                emitter.emit_lineinfo(line);
            }
        }
    }

    emitter.emit_success_epilogue();

    for (patch, target_lpc) in pending {
        let target_offset = pc_map
            .iter()
            .find(|(lpc, _)| *lpc == target_lpc)
            .map(|(_, off)| *off)
            .ok_or(CodegenError::BrokenBytecode)?;
        emitter.patch_jmp(patch, target_offset);
    }

    Ok(emitter.into_code())
}

fn resolve_jump(
    emitter: &mut Box<dyn Emitter>,
    pc_map: &mut Vec<(u32, u32)>,
    pending: &mut Vec<(JmpPatch, u32)>,
    target_lpc: u32,
    emit: impl FnOnce(&mut Box<dyn Emitter>) -> JmpPatch,
) {
    let known = pc_map.iter().find(|(lpc, _)| *lpc == target_lpc).map(|(_, off)| *off);
    let patch = emit(emitter);
    match known {
        Some(offset) => emitter.patch_jmp(patch, offset),
        None => pending.push((patch, target_lpc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockEmitter {
        offset: u32,
        supports_ok: bool,
        next_patch: u32,
        patches: Vec<(u32, u32)>,
    }

    impl MockEmitter {
        fn new() -> Self {
            MockEmitter { offset: 0, supports_ok: true, next_patch: 0, patches: Vec::new() }
        }

        fn unsupported() -> Self {
            MockEmitter { supports_ok: false, ..MockEmitter::new() }
        }
    }

    impl Emitter for MockEmitter {
        fn supports(&self) -> Result<(), CodegenError> {
            if self.supports_ok { Ok(()) } else { Err(CodegenError::UnsupportedArch) }
        }
        fn offset(&self) -> u32 {
            self.offset
        }
        fn emit_prologue(&mut self) {
            self.offset += 1;
        }
        fn emit_success_epilogue(&mut self) {
            self.offset += 1;
        }
        fn emit_lineinfo(&mut self, _line: i32) {
            self.offset += 1;
        }
        fn emit_assign(&mut self, _dst: u16, _src: u16) {
            self.offset += 1;
        }
        fn emit_iconst(&mut self, _dst: u16, _v: i32) {
            self.offset += 1;
        }
        fn emit_fconst(&mut self, _dst: u16, _bits: u32) {
            self.offset += 1;
        }
        fn emit_inc(&mut self, _dst: u16) {
            self.offset += 1;
        }
        fn emit_helper_call(&mut self, _helper: usize, _args: &[HelperArg]) {
            self.offset += 1;
        }
        fn emit_truthy_call(&mut self, _src: u16) {
            self.offset += 1;
        }
        fn emit_jmp(&mut self) -> JmpPatch {
            let p = self.next_patch;
            self.next_patch += 1;
            self.offset += 1;
            JmpPatch(p)
        }
        fn emit_jmp_if(&mut self, _jump_if_true: bool) -> JmpPatch {
            let p = self.next_patch;
            self.next_patch += 1;
            self.offset += 1;
            JmpPatch(p)
        }
        fn patch_jmp(&mut self, patch: JmpPatch, target_offset: u32) {
            self.patches.push((patch.0, target_offset));
        }
        fn into_code(self: Box<Self>) -> Vec<u8> {
            vec![self.offset as u8]
        }
    }

    fn nop() -> Vec<u8> {
        vec![Opcode::Nop as u8]
    }

    #[test]
    fn opcode_name_covers_both_bailout_opcodes() {
        assert_eq!(opcode_name(Opcode::Call), "CALL");
        assert_eq!(opcode_name(Opcode::ThisCall), "THISCALL");
    }

    #[test]
    fn rejects_call_before_checking_architecture_support() {
        let code = vec![Opcode::Call as u8, 0, 0, 0, 0, 0, 0];
        let err = compile_function(Box::new(MockEmitter::unsupported()), &code).unwrap_err();
        assert_eq!(err, CodegenError::UnsupportedInstruction("CALL"));
    }

    #[test]
    fn unsupported_architecture_is_reported_for_otherwise_valid_code() {
        let err = compile_function(Box::new(MockEmitter::unsupported()), &nop()).unwrap_err();
        assert_eq!(err, CodegenError::UnsupportedArch);
    }

    #[test]
    fn truncated_instruction_is_broken_bytecode() {
        let code = vec![Opcode::IConst as u8, 0, 0]; // dst register present, i32 operand missing
        let err = compile_function(Box::new(MockEmitter::new()), &code).unwrap_err();
        assert_eq!(err, CodegenError::BrokenBytecode);
    }

    #[test]
    fn unknown_opcode_byte_is_broken_bytecode() {
        let code = vec![0xff];
        let err = compile_function(Box::new(MockEmitter::new()), &code).unwrap_err();
        assert_eq!(err, CodegenError::BrokenBytecode);
    }

    #[test]
    fn a_backward_jump_patches_immediately() {
        // Jmp back to offset 0 (the only bytecode offset that exists).
        let mut code = vec![Opcode::Jmp as u8];
        code.extend_from_slice(&0u32.to_be_bytes());
        let boxed: Box<MockEmitter> = Box::new(MockEmitter::new());
        let code_out = compile_function(boxed, &code).unwrap();
        assert!(!code_out.is_empty());
    }

    #[test]
    fn a_forward_jump_resolves_once_its_target_is_visited() {
        // Jmp forward to the Nop at bytecode offset 5, visited after this one.
        let mut code = vec![Opcode::Jmp as u8];
        code.extend_from_slice(&5u32.to_be_bytes());
        code.push(Opcode::Nop as u8);
        code.push(Opcode::LineInfo as u8);
        code.extend_from_slice(&7i32.to_be_bytes());
        let result = compile_function(Box::new(MockEmitter::new()), &code);
        assert!(result.is_ok());
    }

    #[test]
    fn jump_to_a_nonexistent_offset_is_broken_bytecode() {
        let mut code = vec![Opcode::Jmp as u8];
        code.extend_from_slice(&999u32.to_be_bytes());
        let err = compile_function(Box::new(MockEmitter::new()), &code).unwrap_err();
        assert_eq!(err, CodegenError::BrokenBytecode);
    }
}

fn binop_helper(op: Opcode) -> usize {
    match op {
        Opcode::Add => helpers::jit_add_helper as usize,
        Opcode::Sub => helpers::jit_sub_helper as usize,
        Opcode::Mul => helpers::jit_mul_helper as usize,
        Opcode::Div => helpers::jit_div_helper as usize,
        Opcode::Mod => helpers::jit_mod_helper as usize,
        Opcode::And => helpers::jit_and_helper as usize,
        Opcode::Or => helpers::jit_or_helper as usize,
        Opcode::Xor => helpers::jit_xor_helper as usize,
        Opcode::Lt => helpers::jit_lt_helper as usize,
        Opcode::Lte => helpers::jit_lte_helper as usize,
        Opcode::Gt => helpers::jit_gt_helper as usize,
        Opcode::Gte => helpers::jit_gte_helper as usize,
        Opcode::Eq | Opcode::EqI => helpers::jit_eq_helper as usize,
        Opcode::Neq => helpers::jit_neq_helper as usize,
        _ => unreachable!(),
    }
}
