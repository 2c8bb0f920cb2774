//! Just-in-time compilation of bytecode functions to native code
//! (`spec.md` §4.6): a compiled function replaces the interpreter loop for
//! one [`FuncObj`], installed behind the same [`NativeEntry`] signature the
//! host-facing API already uses for natively-registered functions.
//!
//! Unlike the original's load-time `jit_build` pass over every function,
//! `spec.md` §4.6 leaves the trigger to the host; [`compile`] is called
//! once per function and is idempotent to call again (it simply recompiles
//! and replaces `native`).

mod aarch64;
mod arch;
mod emitter;
mod error;
mod helpers;
mod region;
mod stub;
mod x86_64;

pub use arch::Arch;
pub use error::CodegenError;

use crate::frame::Environment;
use crate::object::{FuncObj, NativeEntry};
use emitter::{compile_function, Emitter};

fn emitter_for(arch: Arch) -> Box<dyn Emitter> {
    match arch {
        Arch::X86_64 => Box::new(x86_64::X86_64Emitter::new()),
        Arch::Arm64 => Box::new(aarch64::Aarch64Emitter::new()),
        Arch::X86 | Arch::Arm32 | Arch::Mips64 | Arch::Ppc32 | Arch::Ppc64 => Box::new(stub::StubEmitter),
    }
}

/// Compiles `func`'s bytecode body for `arch` and, on success, installs the
/// result as its [`NativeEntry`]. Returns the [`CodegenError`] on failure
/// and leaves `func` exactly as it was — the interpreter stays available
/// either way (`spec.md` §4.7's foreign > native > bytecode priority means
/// a failed or skipped compilation is silently invisible to callers).
///
/// # Safety
/// `func` must point at a live [`FuncObj`] with a bytecode body and must
/// not be mutated concurrently from another thread.
pub unsafe fn compile(func: *mut FuncObj, arch: Arch) -> Result<(), CodegenError> {
    if !arch.has_real_encoder() {
        return Err(CodegenError::UnsupportedArch);
    }
    let blob = (*func).bytecode.as_ref().ok_or(CodegenError::BrokenBytecode)?;
    let code = compile_function(emitter_for(arch), &blob.code)?;
    let entry = region::install(&code)?;
    (*func).native = Some(std::mem::transmute::<*const u8, NativeEntry>(entry));
    Ok(())
}

/// Compiles every registered function for the host's own architecture,
/// skipping (without error) any function a real encoder is unavailable
/// for or whose compilation fails — the load-time-JIT counterpart to the
/// original's unconditional `jit_build` sweep, made best-effort because
/// `spec.md` §4.6 treats per-function JIT failure as routine.
///
/// Returns the number of functions successfully compiled.
pub fn compile_all(env: &mut Environment) -> usize {
    let Some(arch) = Arch::host() else { return 0 };
    if !arch.has_real_encoder() {
        return 0;
    }
    let mut compiled = 0;
    for func in env.functions.iter_mut() {
        let func_ptr: *mut FuncObj = func.as_mut();
        if unsafe { (*func_ptr).bytecode.is_none() } {
            continue;
        }
        if unsafe { compile(func_ptr, arch) }.is_ok() {
            compiled += 1;
        }
    }
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BytecodeBlob, FuncObj};

    fn make_func(code: Vec<u8>) -> Box<FuncObj> {
        Box::new(FuncObj::from_bytecode(
            "f".to_string(),
            "test.lg".to_string(),
            Vec::new(),
            BytecodeBlob { code, tmpvar_size: 4 },
        ))
    }

    #[test]
    fn stub_architectures_refuse_compilation() {
        for arch in [Arch::X86, Arch::Arm32, Arch::Mips64, Arch::Ppc32, Arch::Ppc64] {
            let mut f = make_func(vec![0x00, 0x27, 0, 0, 0, 0]);
            let err = unsafe { compile(f.as_mut() as *mut FuncObj, arch) }.unwrap_err();
            assert_eq!(err, CodegenError::UnsupportedArch);
        }
    }

    #[test]
    fn x86_64_compiles_a_trivial_function() {
        // IConst r0, 5 ; LineInfo 1
        let mut code = vec![0x02, 0x00, 0x00];
        code.extend_from_slice(&5i32.to_be_bytes());
        code.push(0x27);
        code.extend_from_slice(&1i32.to_be_bytes());
        let mut f = make_func(code);
        let result = unsafe { compile(f.as_mut() as *mut FuncObj, Arch::X86_64) };
        assert!(result.is_ok());
        assert!(f.native.is_some());
    }

    #[test]
    fn rejects_call_opcode() {
        // Call r0, r1, argc=0
        let code = vec![0x21, 0x00, 0x00, 0x00, 0x01, 0x00];
        let mut f = make_func(code);
        let err = unsafe { compile(f.as_mut() as *mut FuncObj, Arch::X86_64) }.unwrap_err();
        assert_eq!(err, CodegenError::UnsupportedInstruction("CALL"));
    }
}
