//! x86_64 machine code encoder, grounded on
//! `examples/original_source/src/jit-x86_64.c`'s `ASM_BINARY_OP`/
//! `ASM_UNARY_OP` macros: load the fixed argument registers, `movabs` the
//! helper address into a scratch register, `call`, then branch on `%al`.
//!
//! Register assignment (stable for a whole function body):
//! * `r14` — `env` (callee-saved, loaded from `rdi` in the prologue)
//! * `r15` — `frame_base` (callee-saved, loaded from `rsi` in the prologue)
//! * `r11` — scratch holding the helper address before `call`
//! * `rdi, rsi, rdx, rcx, r8, r9` — the System V argument registers; every
//!   helper call writes `env`/`frame_base` into the first two and the
//!   opcode's own operands into the rest (at most four more, `StoreDot`'s
//!   `(obj, name_ptr, name_len, src)`).
//!
//! A compiled function has the C signature
//! `extern "C" fn(env: *mut Environment, frame_base: *mut Value) -> bool`
//! (`crate::object::NativeEntry`), matching `rdi`/`rsi` on entry.

use crate::jit::emitter::{Emitter, HelperArg, JmpPatch};

pub(crate) struct X86_64Emitter {
    code: Vec<u8>,
}

const ARG_REGS: [u8; 6] = [
    7, // rdi
    6, // rsi
    2, // rdx
    1, // rcx
    8, // r8  (needs REX.B)
    9, // r9  (needs REX.B)
];

impl X86_64Emitter {
    pub(crate) fn new() -> Self {
        X86_64Emitter { code: Vec::new() }
    }

    fn push_r14_r15(&mut self) {
        self.code.extend_from_slice(&[0x41, 0x56]); // push r14
        self.code.extend_from_slice(&[0x41, 0x57]); // push r15
    }

    fn pop_r14_r15(&mut self) {
        self.code.extend_from_slice(&[0x41, 0x5f]); // pop r15
        self.code.extend_from_slice(&[0x41, 0x5e]); // pop r14
    }

    /// `mov r14, rdi`
    fn mov_r14_rdi(&mut self) {
        self.code.extend_from_slice(&[0x49, 0x89, 0xfe]);
    }

    /// `mov r15, rsi`
    fn mov_r15_rsi(&mut self) {
        self.code.extend_from_slice(&[0x49, 0x89, 0xf7]);
    }

    /// Loads a 16-bit register window value (`dst <- *(frame_base + idx*16)`)
    /// is not needed here: helper args pass the register *index*, not its
    /// value — the helper itself dereferences `frame_base`. So "loading an
    /// arg" below just means materializing a small integer or pointer into
    /// an argument register.

    fn mov_reg32_imm32(&mut self, reg: u8, imm: u32) {
        // mov r32, imm32 (B8+rd id), REX.B set when reg >= 8
        if reg >= 8 {
            self.code.push(0x41);
        }
        self.code.push(0xb8 + (reg & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `movabs reg64, imm64` into r14/r15-style extended registers too.
    fn movabs_reg64_imm64(&mut self, reg: u8, imm: u64) {
        let rex = 0x48 | if reg >= 8 { 0x01 } else { 0x00 };
        self.code.push(rex);
        self.code.push(0xb8 + (reg & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov rdi, r14` / `mov rsi, r15` — the first two argument registers
    /// are always env/frame_base, copied from the callee-saved scratch.
    fn load_env_framebase_args(&mut self) {
        self.code.extend_from_slice(&[0x4c, 0x89, 0xf7]); // mov rdi, r14
        self.code.extend_from_slice(&[0x4c, 0x89, 0xfe]); // mov rsi, r15
    }

    fn load_arg(&mut self, slot: usize, arg: HelperArg) {
        let reg = ARG_REGS[slot];
        match arg {
            HelperArg::U16(v) => self.mov_reg32_imm32(reg, v as u32),
            HelperArg::U64(v) => self.movabs_reg64_imm64(reg, v),
        }
    }

    /// `call r11` (FF /2, REX.B)
    fn call_r11(&mut self) {
        self.code.extend_from_slice(&[0x41, 0xff, 0xd3]);
    }

    /// `test al, al`
    fn test_al_al(&mut self) {
        self.code.extend_from_slice(&[0x84, 0xc0]);
    }

    fn ret_bool(&mut self, success: bool) {
        // mov eax, 0/1 ; pop r15 ; pop r14 ; ret
        self.mov_reg32_imm32(0, success as u32);
        self.pop_r14_r15();
        self.code.push(0xc3);
    }
}

impl Emitter for X86_64Emitter {
    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit_prologue(&mut self) {
        self.push_r14_r15();
        self.mov_r14_rdi();
        self.mov_r15_rsi();
    }

    fn emit_success_epilogue(&mut self) {
        self.ret_bool(true);
    }

    fn emit_lineinfo(&mut self, line: i32) {
        // mov dword [r14 + 8], imm32 — Environment::line is documented to
        // sit at offset 8 (`crate::frame::Environment`).
        self.code.extend_from_slice(&[0x41, 0xc7, 0x46, 0x08]);
        self.code.extend_from_slice(&(line as u32).to_le_bytes());
    }

    fn emit_assign(&mut self, dst: u16, src: u16) {
        // Each tmpvar slot is a 16-byte Value; load then store through r15.
        // mov rax, [r15 + src*16] ; mov [r15 + dst*16], rax  (two 8-byte
        // halves, since Value is 16 bytes: tag/padding + payload).
        let src_off = (src as i32) * 16;
        let dst_off = (dst as i32) * 16;
        for word in 0..2 {
            // mov rax, [r15 + off]
            self.code.extend_from_slice(&[0x49, 0x8b, 0x87]);
            self.code.extend_from_slice(&(src_off + word * 8).to_le_bytes());
            // mov [r15 + off], rax
            self.code.extend_from_slice(&[0x49, 0x89, 0x87]);
            self.code.extend_from_slice(&(dst_off + word * 8).to_le_bytes());
        }
    }

    fn emit_iconst(&mut self, dst: u16, v: i32) {
        let off = (dst as i32) * 16;
        // tag word: ValueTag::Int == 0
        self.code.extend_from_slice(&[0x49, 0xc7, 0x87]);
        self.code.extend_from_slice(&off.to_le_bytes());
        self.code.extend_from_slice(&0u32.to_le_bytes());
        // payload word (low 32 bits of the 8-byte payload slot)
        self.code.extend_from_slice(&[0x41, 0xc7, 0x87]);
        self.code.extend_from_slice(&(off + 8).to_le_bytes());
        self.code.extend_from_slice(&(v as u32).to_le_bytes());
    }

    fn emit_fconst(&mut self, dst: u16, bits: u32) {
        let off = (dst as i32) * 16;
        self.code.extend_from_slice(&[0x49, 0xc7, 0x87]);
        self.code.extend_from_slice(&off.to_le_bytes());
        self.code.extend_from_slice(&1u32.to_le_bytes()); // ValueTag::Float
        self.code.extend_from_slice(&[0x41, 0xc7, 0x87]);
        self.code.extend_from_slice(&(off + 8).to_le_bytes());
        self.code.extend_from_slice(&bits.to_le_bytes());
    }

    fn emit_inc(&mut self, dst: u16) {
        let off = (dst as i32) * 16 + 8;
        // inc dword [r15 + off]
        self.code.extend_from_slice(&[0x41, 0xff, 0x87]);
        self.code.extend_from_slice(&off.to_le_bytes());
    }

    fn emit_helper_call(&mut self, helper: usize, args: &[HelperArg]) {
        self.load_env_framebase_args();
        for (i, arg) in args.iter().enumerate() {
            self.load_arg(2 + i, *arg);
        }
        self.movabs_reg64_imm64(3, helper as u64); // r11
        self.call_r11();
        self.test_al_al();
        // jne +5 (skip the failure return, which is 7 bytes: mov eax,0;
        // pop r15; pop r14; ret — encoded below as a fixed-size sequence)
        self.code.extend_from_slice(&[0x0f, 0x85, 0x00, 0x00, 0x00, 0x00]);
        let jcc_operand_at = self.code.len() - 4;
        let fail_start = self.code.len();
        self.ret_bool(false);
        let fail_len = (self.code.len() - fail_start) as i32;
        let rel = fail_len - 0; // jump lands exactly after the failure block
        self.code[jcc_operand_at..jcc_operand_at + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn emit_truthy_call(&mut self, src: u16) {
        self.load_env_framebase_args();
        self.load_arg(2, HelperArg::U16(src));
        self.movabs_reg64_imm64(3, crate::jit::helpers::jit_truthy_helper as u64);
        self.call_r11();
        self.test_al_al();
    }

    fn emit_jmp(&mut self) -> JmpPatch {
        self.code.extend_from_slice(&[0xe9, 0x00, 0x00, 0x00, 0x00]);
        JmpPatch((self.code.len() - 4) as u32)
    }

    fn emit_jmp_if(&mut self, jump_if_true: bool) -> JmpPatch {
        // test_al_al already ran in emit_truthy_call; jnz/jz here.
        let opcode = if jump_if_true { 0x85 } else { 0x84 };
        self.code.extend_from_slice(&[0x0f, opcode, 0x00, 0x00, 0x00, 0x00]);
        JmpPatch((self.code.len() - 4) as u32)
    }

    fn patch_jmp(&mut self, patch: JmpPatch, target_offset: u32) {
        let instr_end = patch.0 + 4;
        let rel = target_offset as i64 - instr_end as i64;
        self.code[patch.0 as usize..patch.0 as usize + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    fn into_code(self: Box<Self>) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_pushes_callee_saved_registers_and_loads_env_framebase() {
        let mut e = X86_64Emitter::new();
        e.emit_prologue();
        assert_eq!(e.code, vec![0x41, 0x56, 0x41, 0x57, 0x49, 0x89, 0xfe, 0x49, 0x89, 0xf7]);
    }

    #[test]
    fn success_epilogue_returns_true_before_restoring_registers() {
        let mut e = X86_64Emitter::new();
        e.emit_success_epilogue();
        assert_eq!(e.code, vec![0xb8, 1, 0, 0, 0, 0x41, 0x5f, 0x41, 0x5e, 0xc3]);
    }

    #[test]
    fn iconst_writes_the_int_tag_and_the_payload() {
        let mut e = X86_64Emitter::new();
        e.emit_iconst(1, -1);
        let off = 16i32; // register 1 at 16 bytes/slot
        let mut expected = vec![0x49, 0xc7, 0x87];
        expected.extend_from_slice(&off.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&[0x41, 0xc7, 0x87]);
        expected.extend_from_slice(&(off + 8).to_le_bytes());
        expected.extend_from_slice(&(-1i32 as u32).to_le_bytes());
        assert_eq!(e.code, expected);
    }

    #[test]
    fn jmp_reserves_a_relative_displacement_patched_later() {
        let mut e = X86_64Emitter::new();
        let patch = e.emit_jmp();
        assert_eq!(e.code[0], 0xe9);
        assert_eq!(patch.0, 1);
        e.patch_jmp(patch, 20);
        let rel = i32::from_le_bytes(e.code[1..5].try_into().unwrap());
        assert_eq!(rel, 20 - 5); // target minus address of the next instruction
    }

    #[test]
    fn offset_tracks_emitted_byte_count() {
        let mut e = X86_64Emitter::new();
        assert_eq!(e.offset(), 0);
        e.emit_inc(0);
        assert_eq!(e.offset(), e.code.len() as u32);
    }
}
