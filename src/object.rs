//! Heap objects: strings, arrays, dictionaries, and function objects.
//!
//! Each of `StringObj`/`ArrayObj`/`DictObj` carries the sibling links and
//! `is_deep`/`is_marked` flags `spec.md` §3 specifies, mirroring
//! `runtime.h`'s `struct rt_string`/`struct rt_array`/`struct rt_dict`. The
//! GC (`crate::gc`) owns these objects; this module only defines their
//! shape and in-place mutation helpers.

use crate::value::Value;
use std::ptr;

/// Fields shared by every heap object kind: membership in exactly one of a
/// shallow list or the tenured list (`spec.md` §3 invariant 1), plus the
/// mark-and-sweep scratch bit.
#[derive(Debug, Clone, Copy)]
pub struct GcLinks<T> {
    pub prev: *mut T,
    pub next: *mut T,
    pub is_deep: bool,
    pub is_marked: bool,
}

impl<T> Default for GcLinks<T> {
    fn default() -> Self {
        GcLinks {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            is_deep: false,
            is_marked: false,
        }
    }
}

/// A byte-string object. Strings hold no further GC pointers.
#[derive(Debug)]
pub struct StringObj {
    pub bytes: Vec<u8>,
    pub links: GcLinks<StringObj>,
}

impl StringObj {
    pub fn new(s: String) -> Self {
        StringObj {
            bytes: s.into_bytes(),
            links: GcLinks::default(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        StringObj {
            bytes,
            links: GcLinks::default(),
        }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Approximate heap footprint, used by `rt_get_heap_usage`.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<StringObj>() + self.bytes.capacity()
    }
}

/// A contiguous array of values. `spec.md` §4.3: initial capacity 16,
/// caller-driven growth (we use `Vec`'s own growth policy, which is
/// geometric and at least as good as the original's doubling).
#[derive(Debug)]
pub struct ArrayObj {
    pub elements: Vec<Value>,
    pub links: GcLinks<ArrayObj>,
}

impl ArrayObj {
    pub fn new() -> Self {
        ArrayObj {
            elements: Vec::with_capacity(16),
            links: GcLinks::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.elements.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: Value) -> bool {
        if index < self.elements.len() {
            self.elements[index] = value;
            true
        } else {
            false
        }
    }

    /// `rt_resize_array`: grow or shrink, new slots zero-filled.
    pub fn resize(&mut self, size: usize) {
        self.elements.resize(size, Value::zero());
    }

    pub fn push(&mut self, value: Value) {
        self.elements.push(value);
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<ArrayObj>() + self.elements.capacity() * std::mem::size_of::<Value>()
    }
}

impl Default for ArrayObj {
    fn default() -> Self {
        Self::new()
    }
}

/// A dictionary with parallel key/value arrays. `spec.md` §4.3: linear
/// lookup, insertion-order preserving, `unset` shifts entries down.
#[derive(Debug)]
pub struct DictObj {
    pub keys: Vec<String>,
    pub values: Vec<Value>,
    pub links: GcLinks<DictObj>,
}

impl DictObj {
    pub fn new() -> Self {
        DictObj {
            keys: Vec::new(),
            values: Vec::new(),
            links: GcLinks::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.index_of(key).map(|i| self.values[i])
    }

    /// Insert or overwrite. Preserves first-seen order for new keys.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(i) = self.index_of(key) {
            self.values[i] = value;
        } else {
            self.keys.push(key.to_string());
            self.values.push(value);
        }
    }

    /// `unset`: remove a key, shifting subsequent entries down.
    pub fn unset(&mut self, key: &str) -> bool {
        if let Some(i) = self.index_of(key) {
            self.keys.remove(i);
            self.values.remove(i);
            true
        } else {
            false
        }
    }

    pub fn key_at(&self, index: usize) -> Option<&str> {
        self.keys.get(index).map(|s| s.as_str())
    }

    pub fn value_at(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    pub fn byte_size(&self) -> usize {
        let keys_bytes: usize = self.keys.iter().map(|k| k.capacity()).sum();
        std::mem::size_of::<DictObj>()
            + keys_bytes
            + self.values.capacity() * std::mem::size_of::<Value>()
    }
}

impl Default for DictObj {
    fn default() -> Self {
        Self::new()
    }
}

/// A compiled bytecode blob plus its register-file size, ready for the
/// interpreter or a native translation.
#[derive(Debug, Clone)]
pub struct BytecodeBlob {
    pub code: Vec<u8>,
    pub tmpvar_size: usize,
}

/// A native entry point produced by the JIT. Takes the environment pointer
/// and the callee frame's register-file base pointer, returns whether
/// execution succeeded (mirrors `bool (*jit_code)(struct rt_env *env)`,
/// generalized with an explicit frame-base argument since our frames are
/// windows into a shared register file rather than separate allocations).
pub type NativeEntry = unsafe extern "C" fn(env: *mut crate::frame::Environment, frame_base: *mut Value) -> bool;

/// A foreign (host-provided) function. Receives the environment; arguments
/// and the return value travel through the current frame's registers
/// per the foreign-function contract (`spec.md` §4.3).
pub type ForeignFn = fn(env: &mut crate::frame::Environment) -> crate::error::LinguineResult<()>;

/// A function object: named, with parameters, and at most one of
/// bytecode/foreign meaningful; `native` is an optional cached JIT
/// translation of the bytecode (`spec.md` §3).
pub struct FuncObj {
    pub name: String,
    pub file_name: String,
    pub param_names: Vec<String>,
    pub bytecode: Option<BytecodeBlob>,
    pub native: Option<NativeEntry>,
    pub foreign: Option<ForeignFn>,
}

impl std::fmt::Debug for FuncObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncObj")
            .field("name", &self.name)
            .field("param_names", &self.param_names)
            .field("has_bytecode", &self.bytecode.is_some())
            .field("has_native", &self.native.is_some())
            .field("has_foreign", &self.foreign.is_some())
            .finish()
    }
}

impl FuncObj {
    pub fn from_bytecode(
        name: String,
        file_name: String,
        param_names: Vec<String>,
        bytecode: BytecodeBlob,
    ) -> Self {
        FuncObj {
            name,
            file_name,
            param_names,
            bytecode: Some(bytecode),
            native: None,
            foreign: None,
        }
    }

    pub fn foreign(name: String, param_names: Vec<String>, f: ForeignFn) -> Self {
        FuncObj {
            name,
            file_name: String::new(),
            param_names,
            bytecode: None,
            native: None,
            foreign: Some(f),
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_preserves_insertion_order() {
        let mut d = DictObj::new();
        d.set("b", Value::int(2));
        d.set("a", Value::int(1));
        assert_eq!(d.key_at(0), Some("b"));
        assert_eq!(d.key_at(1), Some("a"));
    }

    #[test]
    fn dict_unset_shifts_down() {
        let mut d = DictObj::new();
        d.set("a", Value::int(1));
        d.set("b", Value::int(2));
        d.set("c", Value::int(3));
        assert!(d.unset("b"));
        assert_eq!(d.len(), 2);
        assert_eq!(d.key_at(0), Some("a"));
        assert_eq!(d.key_at(1), Some("c"));
    }

    #[test]
    fn array_resize_zero_fills() {
        let mut a = ArrayObj::new();
        a.push(Value::int(1));
        a.resize(3);
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(1).unwrap().as_int(), Some(0));
    }
}
