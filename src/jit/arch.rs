//! Target instruction sets. `spec.md` §2/§4.6 names seven; this rewrite
//! implements two (`X86_64`, `Arm64`) and registers the rest as recognized
//! but unencoded, per `SPEC_FULL.md` §D — the scope decision this session
//! recorded against `raya-engine`'s two-variant
//! `jit::backend::traits::TargetArch`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm32,
    Arm64,
    Mips64,
    Ppc32,
    Ppc64,
}

impl Arch {
    pub const ALL: [Arch; 7] = [Arch::X86, Arch::X86_64, Arch::Arm32, Arch::Arm64, Arch::Mips64, Arch::Ppc32, Arch::Ppc64];

    /// The architecture this process was compiled for, if it is one
    /// `spec.md` §2 names. A host running on something else (e.g. riscv)
    /// has no matching `Arch` and JIT compilation is unavailable, falling
    /// back to the interpreter for every function.
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "arm") {
            Some(Arch::Arm32)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Arm64)
        } else if cfg!(target_arch = "mips64") {
            Some(Arch::Mips64)
        } else if cfg!(target_arch = "powerpc") {
            Some(Arch::Ppc32)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Arch::Ppc64)
        } else {
            None
        }
    }

    /// Whether this rewrite has a real encoder for `self`, as opposed to
    /// the always-failing stub.
    pub fn has_real_encoder(self) -> bool {
        matches!(self, Arch::X86_64 | Arch::Arm64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_lists_seven_isas() {
        assert_eq!(Arch::ALL.len(), 7);
    }

    #[test]
    fn only_two_have_real_encoders() {
        assert_eq!(Arch::ALL.iter().filter(|a| a.has_real_encoder()).count(), 2);
    }
}
