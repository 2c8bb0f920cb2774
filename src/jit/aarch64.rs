//! AArch64 machine code encoder, grounded on
//! `examples/original_source/src/jit-arm64.c`: helper addresses don't fit
//! in any single immediate field, so every call site builds the 64-bit
//! address across four `MOVZ`/`MOVK` instructions before `BLR`.
//!
//! Register assignment:
//! * `x19` — `env` (callee-saved, loaded from `x0` in the prologue)
//! * `x20` — `frame_base` (callee-saved, loaded from `x1` in the prologue)
//! * `x9`  — scratch holding the helper address before `blr`
//! * `x0..x5` — argument registers for the helper call, `x0`/`x1` always
//!   `env`/`frame_base`

use crate::jit::emitter::{Emitter, HelperArg, JmpPatch};

pub(crate) struct Aarch64Emitter {
    code: Vec<u8>,
}

impl Aarch64Emitter {
    pub(crate) fn new() -> Self {
        Aarch64Emitter { code: Vec::new() }
    }

    fn push_u32(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    /// `STP x19, x20, [sp, #-16]!`
    fn stp_x19_x20_predec(&mut self) {
        self.push_u32(0xa9bf53f3);
    }

    /// `LDP x19, x20, [sp], #16`
    fn ldp_x19_x20_postinc(&mut self) {
        self.push_u32(0xa8c153f3);
    }

    /// `MOV xd, xn` encoded as `ORR xd, xzr, xn`.
    fn mov_reg(&mut self, xd: u32, xn: u32) {
        self.push_u32(0xaa0003e0 | (xn << 16) | xd);
    }

    /// `MOVZ xd, #imm16, LSL #shift` (shift in {0,16,32,48})
    fn movz(&mut self, xd: u32, imm16: u16, shift: u32) {
        let hw = shift / 16;
        self.push_u32(0xd2800000 | (hw << 21) | ((imm16 as u32) << 5) | xd);
    }

    /// `MOVK xd, #imm16, LSL #shift`
    fn movk(&mut self, xd: u32, imm16: u16, shift: u32) {
        let hw = shift / 16;
        self.push_u32(0xf2800000 | (hw << 21) | ((imm16 as u32) << 5) | xd);
    }

    fn mov_imm64(&mut self, xd: u32, imm: u64) {
        self.movz(xd, (imm & 0xffff) as u16, 0);
        self.movk(xd, ((imm >> 16) & 0xffff) as u16, 16);
        self.movk(xd, ((imm >> 32) & 0xffff) as u16, 32);
        self.movk(xd, ((imm >> 48) & 0xffff) as u16, 48);
    }

    /// `BLR x9`
    fn blr_x9(&mut self) {
        self.push_u32(0xd63f0120);
    }

    /// `CMP w0, #0` (w0 holds the helper's bool return, zero-extended)
    fn cmp_w0_zero(&mut self) {
        self.push_u32(0x7100001f);
    }

    fn ret_bool(&mut self, success: bool) {
        self.movz(0, success as u16, 0); // mov x0, #0/1
        self.ldp_x19_x20_postinc();
        self.push_u32(0xd65f03c0); // RET
    }

    fn load_env_framebase_args(&mut self) {
        self.mov_reg(0, 19); // mov x0, x19
        self.mov_reg(1, 20); // mov x1, x20
    }

    fn load_arg(&mut self, slot: u32, arg: HelperArg) {
        match arg {
            HelperArg::U16(v) => self.movz(slot, v, 0),
            HelperArg::U64(v) => self.mov_imm64(slot, v),
        }
    }
}

impl Emitter for Aarch64Emitter {
    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit_prologue(&mut self) {
        self.stp_x19_x20_predec();
        self.mov_reg(19, 0); // x19 <- x0 (env)
        self.mov_reg(20, 1); // x20 <- x1 (frame_base)
    }

    fn emit_success_epilogue(&mut self) {
        self.ret_bool(true);
    }

    fn emit_lineinfo(&mut self, line: i32) {
        // Environment::line sits at byte offset 8; STR requires an
        // unsigned scaled immediate for 32-bit stores (offset/4).
        self.mov_imm64(9, line as u32 as u64);
        self.push_u32(0xb9000a69); // str w9, [x19, #8]
    }

    fn emit_assign(&mut self, dst: u16, src: u16) {
        let src_off = (src as u32) * 16;
        let dst_off = (dst as u32) * 16;
        // LDP x9, x10, [x20, #src_off] ; STP x9, x10, [x20, #dst_off]
        // STP/LDP (post-index form not needed: signed offset, imm7 scaled by 8)
        let ldp = 0xa9400289u32 | ((src_off / 8) << 15);
        let stp = 0xa9000289u32 | ((dst_off / 8) << 15);
        self.push_u32(ldp);
        self.push_u32(stp);
    }

    fn emit_iconst(&mut self, dst: u16, v: i32) {
        let off = (dst as u32) * 16;
        self.mov_imm64(9, 0); // tag = Int (0), also clears the padding word
        self.push_u32(0xf9000289 | ((off / 8) << 10)); // str x9, [x20, #off]
        self.mov_imm64(9, v as u32 as u64);
        self.push_u32(0xf9000289 | (((off + 8) / 8) << 10)); // str x9, [x20, #off+8]
    }

    fn emit_fconst(&mut self, dst: u16, bits: u32) {
        let off = (dst as u32) * 16;
        self.mov_imm64(9, 1); // tag = Float (1)
        self.push_u32(0xf9000289 | ((off / 8) << 10));
        self.mov_imm64(9, bits as u64);
        self.push_u32(0xf9000289 | (((off + 8) / 8) << 10));
    }

    fn emit_inc(&mut self, dst: u16) {
        let off = (dst as u32) * 16 + 8;
        self.push_u32(0xb9400289 | ((off / 4) << 10)); // ldr w9, [x20, #off]
        self.push_u32(0x11000529); // add w9, w9, #1
        self.push_u32(0xb9000289 | ((off / 4) << 10)); // str w9, [x20, #off]
    }

    fn emit_helper_call(&mut self, helper: usize, args: &[HelperArg]) {
        self.load_env_framebase_args();
        for (i, arg) in args.iter().enumerate() {
            self.load_arg(2 + i as u32, *arg);
        }
        self.mov_imm64(9, helper as u64);
        self.blr_x9();
        self.cmp_w0_zero();
        // B.NE past the inline failure path (success case)
        let fail_start_patch_at = self.code.len();
        self.push_u32(0x54000001); // b.ne #8 (patched below once fail length is known)
        let fail_start = self.code.len();
        self.ret_bool(false);
        let words = ((self.code.len() - fail_start) / 4) as u32;
        let encoded = 0x54000000 | (words << 5) | 0x1;
        self.code[fail_start_patch_at..fail_start_patch_at + 4].copy_from_slice(&encoded.to_le_bytes());
    }

    fn emit_truthy_call(&mut self, src: u16) {
        self.load_env_framebase_args();
        self.load_arg(2, HelperArg::U16(src));
        self.mov_imm64(9, crate::jit::helpers::jit_truthy_helper as u64);
        self.blr_x9();
        self.cmp_w0_zero();
    }

    fn emit_jmp(&mut self) -> JmpPatch {
        let at = self.code.len() as u32;
        self.push_u32(0x14000000); // b #0 (patched)
        JmpPatch(at)
    }

    fn emit_jmp_if(&mut self, jump_if_true: bool) -> JmpPatch {
        let at = self.code.len() as u32;
        let cond = if jump_if_true { 0x1 } else { 0x0 }; // NE vs EQ
        self.push_u32(0x54000000 | cond);
        JmpPatch(at)
    }

    fn patch_jmp(&mut self, patch: JmpPatch, target_offset: u32) {
        let rel_words = (target_offset as i64 - patch.0 as i64) / 4;
        let at = patch.0 as usize;
        let existing = u32::from_le_bytes(self.code[at..at + 4].try_into().unwrap());
        let is_cond_branch = (existing & 0xff000010) == 0x54000000;
        let encoded = if is_cond_branch {
            (existing & 0x1f) | 0x54000000 | (((rel_words as u32) & 0x7ffff) << 5)
        } else {
            0x14000000 | ((rel_words as u32) & 0x3ffffff)
        };
        self.code[at..at + 4].copy_from_slice(&encoded.to_le_bytes());
    }

    fn into_code(self: Box<Self>) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn prologue_saves_x19_x20_and_loads_env_framebase() {
        let mut e = Aarch64Emitter::new();
        e.emit_prologue();
        assert_eq!(words(&e.code), vec![0xa9bf53f3, 0xaa0003f3, 0xaa0103f4]);
    }

    #[test]
    fn mov_imm64_emits_one_movz_and_three_movk() {
        let mut e = Aarch64Emitter::new();
        e.mov_imm64(9, 0x1234_5678_9abc_def0);
        let ws = words(&e.code);
        assert_eq!(ws.len(), 4);
        assert_eq!(ws[0] & 0xff800000, 0xd2800000); // MOVZ
        assert_eq!(ws[1] & 0xff800000, 0xf2800000); // MOVK
        assert_eq!(ws[2] & 0xff800000, 0xf2800000);
        assert_eq!(ws[3] & 0xff800000, 0xf2800000);
        assert_eq!(ws[0] & 0x1f, 9); // destination register xd = 9
    }

    #[test]
    fn unconditional_jmp_is_patched_to_a_relative_word_offset() {
        let mut e = Aarch64Emitter::new();
        let patch = e.emit_jmp();
        assert_eq!(patch.0, 0);
        e.patch_jmp(patch, 16);
        let w = words(&e.code)[0];
        assert_eq!(w & 0xfc000000, 0x14000000); // still an unconditional B
        assert_eq!(w & 0x3ffffff, 4); // 16 bytes / 4 = 4 words
    }

    #[test]
    fn conditional_jmp_if_encodes_ne_for_true_and_eq_for_false() {
        let mut true_emitter = Aarch64Emitter::new();
        true_emitter.emit_jmp_if(true);
        assert_eq!(words(&true_emitter.code)[0] & 0xf, 0x1);

        let mut false_emitter = Aarch64Emitter::new();
        false_emitter.emit_jmp_if(false);
        assert_eq!(words(&false_emitter.code)[0] & 0xf, 0x0);
    }

    #[test]
    fn offset_tracks_emitted_byte_count() {
        let mut e = Aarch64Emitter::new();
        assert_eq!(e.offset(), 0);
        e.emit_inc(0);
        assert_eq!(e.offset(), e.code.len() as u32);
        assert_eq!(e.offset() % 4, 0);
    }
}
