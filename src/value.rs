//! The tagged value: a 16-byte (on 64-bit targets) union of six variants.
//!
//! `spec.md` §3 calls the 16-byte size and the tag-at-offset-0/payload-at-
//! offset-8 layout "part of the binary contract the JIT relies on". We keep
//! both by modeling `Value` the way `runtime.h`'s `struct rt_value` does: a
//! 32-bit tag, a padding word present only on 64-bit targets (mirroring the
//! original's `#if defined(ARCH_ARM64) || defined(ARCH_X86_64) ||
//! defined(ARCH_PPC64)`), and an 8-byte payload union.

use crate::object::{ArrayObj, DictObj, FuncObj, StringObj};

/// Discriminant for [`Value`]. Numeric values are not part of any wire
/// format (unlike the LIR opcodes), so they are free to be whatever `repr`
/// is convenient, but we keep them stable for JIT code that switches on the
/// tag directly.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Int = 0,
    Float = 1,
    String = 2,
    Array = 3,
    Dict = 4,
    Func = 5,
}

/// The 8-byte payload. Only one field is meaningful, selected by the
/// enclosing [`Value`]'s tag.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ValuePayload {
    pub i: i32,
    pub f: f32,
    pub string: *mut StringObj,
    pub array: *mut ArrayObj,
    pub dict: *mut DictObj,
    pub func: *mut FuncObj,
}

/// A tagged value. 16 bytes on 64-bit targets (4-byte tag + 4-byte padding +
/// 8-byte payload), 8 bytes on 32-bit targets (4-byte tag + 4-byte payload,
/// pointers being 4 bytes there) — exactly `struct rt_value`'s layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Value {
    pub tag: ValueTag,
    #[cfg(target_pointer_width = "64")]
    _padding: i32,
    pub payload: ValuePayload,
}

impl Value {
    #[inline]
    pub fn int(i: i32) -> Self {
        Value {
            tag: ValueTag::Int,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { i },
        }
    }

    #[inline]
    pub fn float(f: f32) -> Self {
        Value {
            tag: ValueTag::Float,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { f },
        }
    }

    #[inline]
    pub fn string(ptr: *mut StringObj) -> Self {
        Value {
            tag: ValueTag::String,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { string: ptr },
        }
    }

    #[inline]
    pub fn array(ptr: *mut ArrayObj) -> Self {
        Value {
            tag: ValueTag::Array,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { array: ptr },
        }
    }

    #[inline]
    pub fn dict(ptr: *mut DictObj) -> Self {
        Value {
            tag: ValueTag::Dict,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { dict: ptr },
        }
    }

    #[inline]
    pub fn func(ptr: *mut FuncObj) -> Self {
        Value {
            tag: ValueTag::Func,
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            payload: ValuePayload { func: ptr },
        }
    }

    /// The zero-cleared value reads as integer zero, matching `spec.md` §3's
    /// note that a zero-cleared `rt_value` is `Int(0)`.
    #[inline]
    pub fn zero() -> Self {
        Value::int(0)
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        self.tag == ValueTag::Int
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        self.tag == ValueTag::Float
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_float()
    }

    #[inline]
    pub fn is_heap_allocated(&self) -> bool {
        matches!(self.tag, ValueTag::String | ValueTag::Array | ValueTag::Dict)
    }

    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        (self.tag == ValueTag::Int).then(|| unsafe { self.payload.i })
    }

    #[inline]
    pub fn as_float(&self) -> Option<f32> {
        (self.tag == ValueTag::Float).then(|| unsafe { self.payload.f })
    }

    /// Numeric value widened to `f64`, used by helpers that must treat
    /// int/float uniformly (e.g. "divisor's numeric value is 0").
    #[inline]
    pub fn numeric_as_f64(&self) -> Option<f64> {
        match self.tag {
            ValueTag::Int => Some(unsafe { self.payload.i } as f64),
            ValueTag::Float => Some(unsafe { self.payload.f } as f64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<*mut StringObj> {
        (self.tag == ValueTag::String).then(|| unsafe { self.payload.string })
    }

    #[inline]
    pub fn as_array(&self) -> Option<*mut ArrayObj> {
        (self.tag == ValueTag::Array).then(|| unsafe { self.payload.array })
    }

    #[inline]
    pub fn as_dict(&self) -> Option<*mut DictObj> {
        (self.tag == ValueTag::Dict).then(|| unsafe { self.payload.dict })
    }

    #[inline]
    pub fn as_func(&self) -> Option<*mut FuncObj> {
        (self.tag == ValueTag::Func).then(|| unsafe { self.payload.func })
    }

    /// The untyped heap pointer backing this value, if any. Used by the GC
    /// to treat string/array/dict uniformly when walking sibling lists.
    #[inline]
    pub fn heap_ptr(&self) -> Option<*mut ()> {
        match self.tag {
            ValueTag::String => Some(unsafe { self.payload.string } as *mut ()),
            ValueTag::Array => Some(unsafe { self.payload.array } as *mut ()),
            ValueTag::Dict => Some(unsafe { self.payload.dict } as *mut ()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.tag {
            ValueTag::Int => "int",
            ValueTag::Float => "float",
            ValueTag::String => "string",
            ValueTag::Array => "array",
            ValueTag::Dict => "dict",
            ValueTag::Func => "func",
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag {
            ValueTag::Int => write!(f, "Int({})", unsafe { self.payload.i }),
            ValueTag::Float => write!(f, "Float({})", unsafe { self.payload.f }),
            ValueTag::String => write!(f, "String({:p})", unsafe { self.payload.string }),
            ValueTag::Array => write!(f, "Array({:p})", unsafe { self.payload.array }),
            ValueTag::Dict => write!(f, "Dict({:p})", unsafe { self.payload.dict }),
            ValueTag::Func => write!(f, "Func({:p})", unsafe { self.payload.func }),
        }
    }
}

/// `copy_value`: duplicate the 16-byte payload by value. Object pointers are
/// shared, never deep-copied (`spec.md` §4.3).
#[inline]
pub fn copy_value(src: &Value) -> Value {
    *src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn value_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Value>(), 16);
    }

    #[test]
    fn tag_at_offset_zero() {
        let v = Value::int(7);
        let ptr = &v as *const Value as *const i32;
        assert_eq!(unsafe { *ptr }, ValueTag::Int as i32);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn payload_at_offset_eight() {
        let v = Value::int(42);
        let base = &v as *const Value as usize;
        let payload_ptr = &v.payload as *const ValuePayload as usize;
        assert_eq!(payload_ptr - base, 8);
    }

    #[test]
    fn zero_reads_as_int_zero() {
        let v = Value::zero();
        assert_eq!(v.as_int(), Some(0));
    }

    #[test]
    fn copy_shares_pointer() {
        let mut s = StringObj::new("hi".to_string());
        let v = Value::string(&mut s as *mut StringObj);
        let copied = copy_value(&v);
        assert_eq!(v.as_string(), copied.as_string());
    }
}
