//! The process-wide JIT code region: one `mmap`'d block, written while
//! writable, then remapped executable (`examples/original_source`
//! `src/jit/jit-common.c`'s `jit_map_memory_region`/`jit_map_writable`/
//! `jit_map_executable`). Unix only, matching `Cargo.toml`'s existing
//! `cfg(unix)` gate on `libc` — `SPEC_FULL.md` §C notes Windows is out of
//! scope for this rewrite.
//!
//! There is no reclamation: compiled functions live for the process
//! lifetime, same as the original (`jit_free` is a no-op stub even when
//! `USE_JIT` is on).

use crate::jit::error::CodegenError;
use once_cell::sync::OnceCell;
use std::sync::Mutex;

/// `JIT_CODE_MAX` (`linguine/jit/jit.h`): 16 MiB, shared by every
/// JIT-compiled function in the process.
const JIT_CODE_MAX: usize = 16 * 1024 * 1024;

pub(crate) struct CodeRegion {
    base: *mut u8,
    cursor: usize,
    size: usize,
}

unsafe impl Send for CodeRegion {}

impl CodeRegion {
    fn new() -> Result<Self, CodegenError> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                JIT_CODE_MAX,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CodegenError::CodeTooBig);
        }
        Ok(CodeRegion { base: base as *mut u8, cursor: 0, size: JIT_CODE_MAX })
    }

    /// Copy `code` into the region (still writable at this point) and
    /// return a pointer to its start. The caller must call
    /// [`CodeRegion::make_executable`] once no more functions are being
    /// appended for this round of compilation.
    fn install(&mut self, code: &[u8]) -> Result<*const u8, CodegenError> {
        if self.cursor + code.len() > self.size {
            return Err(CodegenError::CodeTooBig);
        }
        let dst = unsafe { self.base.add(self.cursor) };
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len()) };
        self.cursor += code.len();
        Ok(dst)
    }

    fn make_writable(&mut self) {
        unsafe { libc::mprotect(self.base as *mut libc::c_void, self.size, libc::PROT_READ | libc::PROT_WRITE) };
    }

    fn make_executable(&mut self) {
        unsafe { libc::mprotect(self.base as *mut libc::c_void, self.size, libc::PROT_EXEC | libc::PROT_READ) };
        flush_instruction_cache(self.base, self.size);
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(base: *mut u8, size: usize) {
    // aarch64 requires an explicit I-cache invalidation after writing
    // executable pages; x86_64 has coherent I/D caches and needs none.
    unsafe {
        let start = base as usize;
        let end = start + size;
        std::arch::asm!(
            "dc cvau, {0}",
            "dsb ish",
            "ic ivau, {0}",
            "dsb ish",
            "isb",
            in(reg) start,
        );
        let _ = end;
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_base: *mut u8, _size: usize) {}

static REGION: OnceCell<Mutex<CodeRegion>> = OnceCell::new();

/// Write `code` into the shared region and return a callable pointer to
/// it. Brackets the single write with the writable/executable remaps
/// `jit-common.c` performs around every `jit_build` call.
pub(crate) fn install(code: &[u8]) -> Result<*const u8, CodegenError> {
    let cell = REGION.get_or_try_init(CodeRegion::new)?;
    let mut region = cell.lock().unwrap_or_else(|e| e.into_inner());
    region.make_writable();
    let ptr = region.install(code)?;
    region.make_executable();
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_and_returns_distinct_pointers() {
        let a = install(&[0xc3]).unwrap();
        let b = install(&[0xc3, 0xc3]).unwrap();
        assert_ne!(a, b);
    }
}
