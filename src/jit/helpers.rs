//! Runtime helpers the JIT-compiled code calls into for every opcode that
//! is not inlined as native instructions (`spec.md` §4.6, "helper-based
//! JIT": non-trivial opcodes call back into the runtime rather than being
//! lowered directly). Grounded on `jit-x86_64.c`'s `rt_*_helper` family —
//! same split (one helper per opcode family, `bool` success return,
//! `env`'s error state carries the message on failure), adapted to take an
//! explicit `frame_base` pointer since our register file is a window into
//! a shared `Vec<Value>` rather than embedded in the environment struct.
//!
//! Every helper here is `extern "C"` and its address is baked into
//! generated code as an immediate, called via an indirect `call`
//! instruction — there is no linkage step.

use crate::frame::Environment;
use crate::gc;
use crate::object::{ArrayObj, DictObj, StringObj};
use crate::value::{Value, ValueTag};

#[inline]
unsafe fn reg(frame_base: *mut Value, idx: u16) -> Value {
    *frame_base.add(idx as usize)
}

#[inline]
unsafe fn set_reg(frame_base: *mut Value, idx: u16, v: Value) {
    *frame_base.add(idx as usize) = v;
}

unsafe fn str_from_parts(ptr: *const u8, len: u32) -> String {
    let bytes = std::slice::from_raw_parts(ptr, len as usize);
    String::from_utf8_lossy(bytes).into_owned()
}

fn fail(env: &mut Environment, message: impl Into<String>) -> bool {
    let line = env.line;
    let file = env.file_name.clone();
    env.set_error(file, line, message.into());
    false
}

macro_rules! binary_helper {
    ($name:ident, $op:ident) => {
        /// # Safety
        /// `env` and `frame_base` must point at the currently executing
        /// environment/frame, as set up by [`crate::interpreter::call_native`].
        pub unsafe extern "C" fn $name(env: *mut Environment, frame_base: *mut Value, dst: u16, a: u16, b: u16) -> bool {
            let env = &mut *env;
            let av = reg(frame_base, a);
            let bv = reg(frame_base, b);
            match binop(env, BinOp::$op, av, bv) {
                Ok(v) => {
                    set_reg(frame_base, dst, v);
                    true
                }
                Err(msg) => fail(env, msg),
            }
        }
    };
}

/// The dispatch key for [`binary_helper`]-generated functions — not the
/// wire-format `Opcode`, just the subset of operators that share a
/// `(dst, a, b)` shape.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

fn binop(env: &mut Environment, op: BinOp, a: Value, b: Value) -> Result<Value, String> {
    use BinOp::*;
    let require_int = |v: Value| v.as_int().ok_or_else(|| format!("expected int, found {}", v.type_name()));
    match op {
        Add if a.tag == ValueTag::String && b.tag == ValueTag::String => {
            let sa = unsafe { (*a.as_string().unwrap()).as_str().into_owned() };
            let sb = unsafe { (*b.as_string().unwrap()).as_str().into_owned() };
            Ok(gc::alloc_string(env, StringObj::new(format!("{sa}{sb}"))))
        }
        Add => numeric(env, a, b, |x, y| Ok(x.wrapping_add(y)), |x, y| x + y),
        Sub => numeric(env, a, b, |x, y| Ok(x.wrapping_sub(y)), |x, y| x - y),
        Mul => numeric(env, a, b, |x, y| Ok(x.wrapping_mul(y)), |x, y| x * y),
        Div => {
            if b.numeric_as_f64() == Some(0.0) {
                return Err("division by zero".into());
            }
            numeric(env, a, b, |x, y| Ok(x.wrapping_div(y)), |x, y| x / y)
        }
        Mod => {
            let x = require_int(a)?;
            let y = require_int(b)?;
            if y == 0 {
                return Err("division by zero".into());
            }
            Ok(Value::int(x.wrapping_rem(y)))
        }
        And => Ok(Value::int(require_int(a)? & require_int(b)?)),
        Or => Ok(Value::int(require_int(a)? | require_int(b)?)),
        Xor => Ok(Value::int(require_int(a)? ^ require_int(b)?)),
        Lt => compare(a, b, |x, y| x < y, |x, y| x < y),
        Lte => compare(a, b, |x, y| x <= y, |x, y| x <= y),
        Gt => compare(a, b, |x, y| x > y, |x, y| x > y),
        Gte => compare(a, b, |x, y| x >= y, |x, y| x >= y),
        Eq => Ok(Value::int(value_eq(a, b) as i32)),
        Neq => Ok(Value::int(!value_eq(a, b) as i32)),
    }
}

fn numeric(_env: &Environment, a: Value, b: Value, iop: impl FnOnce(i32, i32) -> Result<i32, String>, fop: impl FnOnce(f64, f64) -> f64) -> Result<Value, String> {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => Ok(Value::int(iop(a.as_int().unwrap(), b.as_int().unwrap())?)),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) | (ValueTag::Float, ValueTag::Float) => {
            Ok(Value::float(fop(a.numeric_as_f64().unwrap(), b.numeric_as_f64().unwrap()) as f32))
        }
        _ => Err(format!("arithmetic requires numeric operands, found {} and {}", a.type_name(), b.type_name())),
    }
}

fn compare(a: Value, b: Value, iop: fn(i32, i32) -> bool, fop: fn(f64, f64) -> bool) -> Result<Value, String> {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => Ok(Value::int(iop(a.as_int().unwrap(), b.as_int().unwrap()) as i32)),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) | (ValueTag::Float, ValueTag::Float) => {
            Ok(Value::int(fop(a.numeric_as_f64().unwrap(), b.numeric_as_f64().unwrap()) as i32))
        }
        _ => Err(format!("comparison requires numeric operands, found {} and {}", a.type_name(), b.type_name())),
    }
}

fn value_eq(a: Value, b: Value) -> bool {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => a.as_int() == b.as_int(),
        (ValueTag::Float, ValueTag::Float) => a.as_float() == b.as_float(),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) => a.numeric_as_f64() == b.numeric_as_f64(),
        (ValueTag::String, ValueTag::String) => unsafe { (*a.as_string().unwrap()).bytes == (*b.as_string().unwrap()).bytes },
        (ValueTag::Array, ValueTag::Array) => a.as_array() == b.as_array(),
        (ValueTag::Dict, ValueTag::Dict) => a.as_dict() == b.as_dict(),
        (ValueTag::Func, ValueTag::Func) => a.as_func() == b.as_func(),
        _ => false,
    }
}

binary_helper!(jit_add_helper, Add);
binary_helper!(jit_sub_helper, Sub);
binary_helper!(jit_mul_helper, Mul);
binary_helper!(jit_div_helper, Div);
binary_helper!(jit_mod_helper, Mod);
binary_helper!(jit_and_helper, And);
binary_helper!(jit_or_helper, Or);
binary_helper!(jit_xor_helper, Xor);
binary_helper!(jit_lt_helper, Lt);
binary_helper!(jit_lte_helper, Lte);
binary_helper!(jit_gt_helper, Gt);
binary_helper!(jit_gte_helper, Gte);
binary_helper!(jit_eq_helper, Eq);
binary_helper!(jit_neq_helper, Neq);

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_neg_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, src: u16) -> bool {
    let env = &mut *env;
    let v = reg(frame_base, src);
    match v.tag {
        ValueTag::Int => {
            set_reg(frame_base, dst, Value::int(-v.as_int().unwrap()));
            true
        }
        ValueTag::Float => {
            set_reg(frame_base, dst, Value::float(-v.as_float().unwrap()));
            true
        }
        _ => fail(env, format!("cannot negate {}", v.type_name())),
    }
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_len_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, src: u16) -> bool {
    let env = &mut *env;
    let v = reg(frame_base, src);
    let len = match v.tag {
        ValueTag::Array => (*v.as_array().unwrap()).len(),
        ValueTag::Dict => (*v.as_dict().unwrap()).len(),
        ValueTag::String => (*v.as_string().unwrap()).len(),
        _ => return fail(env, format!("{} has no length", v.type_name())),
    };
    set_reg(frame_base, dst, Value::int(len as i32));
    true
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_loadarray_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, container_r: u16, key_r: u16) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, container_r);
    let key = reg(frame_base, key_r);
    match load_indexed(container, key) {
        Ok(v) => {
            set_reg(frame_base, dst, v);
            true
        }
        Err(msg) => fail(env, msg),
    }
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_storearray_helper(env: *mut Environment, frame_base: *mut Value, container_r: u16, key_r: u16, src: u16) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, container_r);
    let key = reg(frame_base, key_r);
    let val = reg(frame_base, src);
    match store_indexed(env, container, key, val) {
        Ok(()) => true,
        Err(msg) => fail(env, msg),
    }
}

unsafe fn load_indexed(container: Value, key: Value) -> Result<Value, String> {
    match container.tag {
        ValueTag::Array => {
            let idx = key.as_int().ok_or_else(|| format!("expected int, found {}", key.type_name()))? as usize;
            (*container.as_array().unwrap()).get(idx).ok_or_else(|| "array index out of bounds".to_string())
        }
        ValueTag::Dict => {
            let k = unsafe { (*key.as_string().ok_or_else(|| format!("expected string, found {}", key.type_name()))?).as_str().into_owned() };
            (*container.as_dict().unwrap()).get(&k).ok_or_else(|| format!("missing dict key '{k}'"))
        }
        _ => Err(format!("{} is not indexable", container.type_name())),
    }
}

unsafe fn store_indexed(env: &mut Environment, container: Value, key: Value, val: Value) -> Result<(), String> {
    match container.tag {
        ValueTag::Array => {
            let idx = key.as_int().ok_or_else(|| format!("expected int, found {}", key.type_name()))? as usize;
            let ptr = container.as_array().unwrap();
            let deep = (*ptr).links.is_deep;
            let arr = &mut *ptr;
            if idx == arr.len() {
                arr.push(val);
            } else if idx < arr.len() {
                arr.set(idx, val);
            } else {
                return Err("array index out of bounds".into());
            }
            if deep {
                gc::promote_value(env, val);
            }
            Ok(())
        }
        ValueTag::Dict => {
            let k = (*key.as_string().ok_or_else(|| format!("expected string, found {}", key.type_name()))?).as_str().into_owned();
            let ptr = container.as_dict().unwrap();
            let deep = (*ptr).links.is_deep;
            (*ptr).set(&k, val);
            if deep {
                gc::promote_value(env, val);
            }
            Ok(())
        }
        _ => Err(format!("{} is not indexable", container.type_name())),
    }
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_dictkeyat_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, dict_r: u16, idx_r: u16) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, dict_r);
    let idx = match reg(frame_base, idx_r).as_int() {
        Some(i) => i as usize,
        None => return fail(env, "expected int index"),
    };
    let dict = match container.as_dict() {
        Some(d) => d,
        None => return fail(env, format!("expected an object, found {}", container.type_name())),
    };
    match (*dict).key_at(idx) {
        Some(k) => {
            let v = gc::alloc_string(env, StringObj::new(k.to_string()));
            set_reg(frame_base, dst, v);
            true
        }
        None => fail(env, "dict index out of bounds"),
    }
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_dictvalat_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, dict_r: u16, idx_r: u16) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, dict_r);
    let idx = match reg(frame_base, idx_r).as_int() {
        Some(i) => i as usize,
        None => return fail(env, "expected int index"),
    };
    let dict = match container.as_dict() {
        Some(d) => d,
        None => return fail(env, format!("expected an object, found {}", container.type_name())),
    };
    match (*dict).value_at(idx) {
        Some(v) => {
            set_reg(frame_base, dst, v);
            true
        }
        None => fail(env, "dict index out of bounds"),
    }
}

/// # Safety
/// See [`jit_add_helper`]. `name_ptr`/`name_len` must describe a valid
/// byte slice living at least as long as the call (the JIT bakes in a
/// pointer into the callee's own bytecode blob, which lives for the
/// process lifetime).
pub unsafe extern "C" fn jit_loaddot_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, obj_r: u16, name_ptr: *const u8, name_len: u32) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, obj_r);
    let name = str_from_parts(name_ptr, name_len);
    let dict = match container.as_dict() {
        Some(d) => d,
        None => return fail(env, format!("expected an object, found {}", container.type_name())),
    };
    match (*dict).get(&name) {
        Some(v) => {
            set_reg(frame_base, dst, v);
            true
        }
        None => fail(env, format!("missing field '{name}'")),
    }
}

/// # Safety
/// See [`jit_loaddot_helper`].
pub unsafe extern "C" fn jit_storedot_helper(env: *mut Environment, frame_base: *mut Value, obj_r: u16, name_ptr: *const u8, name_len: u32, src: u16) -> bool {
    let env = &mut *env;
    let container = reg(frame_base, obj_r);
    let name = str_from_parts(name_ptr, name_len);
    let val = reg(frame_base, src);
    let key = gc::alloc_string(env, StringObj::new(name));
    match store_indexed(env, container, key, val) {
        Ok(()) => true,
        Err(msg) => fail(env, msg),
    }
}

/// # Safety
/// `env.top_frame` must be the frame currently executing, which holds for
/// the whole lifetime of a call dispatched through
/// [`crate::interpreter::call_native`] — the only caller of JIT-compiled
/// code.
pub unsafe extern "C" fn jit_loadsymbol_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, name_ptr: *const u8, name_len: u32) -> bool {
    let env = &mut *env;
    let name = str_from_parts(name_ptr, name_len);
    let locals = &(*env.top_frame).locals;
    let v = locals.get(&name).or_else(|| env.globals.get(&name));
    match v {
        Some(v) => {
            set_reg(frame_base, dst, v);
            true
        }
        None => fail(env, format!("missing symbol '{name}'")),
    }
}

/// # Safety
/// See [`jit_loadsymbol_helper`].
pub unsafe extern "C" fn jit_storesymbol_helper(env: *mut Environment, frame_base: *mut Value, name_ptr: *const u8, name_len: u32, src: u16) -> bool {
    let env = &mut *env;
    let name = str_from_parts(name_ptr, name_len);
    let val = reg(frame_base, src);
    let locals = &mut (*env.top_frame).locals;
    if locals.contains(&name) {
        locals.set(&name, val);
        return true;
    }
    if env.globals.contains(&name) {
        env.globals.set(&name, val);
        if val.is_heap_allocated() {
            gc::promote_value(env, val);
        }
        return true;
    }
    locals.set(&name, val);
    true
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_makestring_helper(env: *mut Environment, frame_base: *mut Value, dst: u16, bytes_ptr: *const u8, bytes_len: u32) -> bool {
    let env = &mut *env;
    let s = str_from_parts(bytes_ptr, bytes_len);
    let v = gc::alloc_string(env, StringObj::new(s));
    set_reg(frame_base, dst, v);
    true
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_makearray_helper(env: *mut Environment, frame_base: *mut Value, dst: u16) -> bool {
    let env = &mut *env;
    let v = gc::alloc_array(env, ArrayObj::new());
    set_reg(frame_base, dst, v);
    true
}

/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_makedict_helper(env: *mut Environment, frame_base: *mut Value, dst: u16) -> bool {
    let env = &mut *env;
    let v = gc::alloc_dict(env, DictObj::new());
    set_reg(frame_base, dst, v);
    true
}

/// Evaluates truthiness for `JMPIFTRUE`/`JMPIFFALSE`/`JMPIFEQ`. Unlike the
/// other helpers, this return value is the condition, not a success flag
/// — the generated code never treats a `false` here as an error.
///
/// # Safety
/// See [`jit_add_helper`].
pub unsafe extern "C" fn jit_truthy_helper(_env: *mut Environment, frame_base: *mut Value, src: u16) -> bool {
    let v = reg(frame_base, src);
    match v.tag {
        ValueTag::Int => v.as_int() != Some(0),
        ValueTag::Float => v.as_float() != Some(0.0),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::ptr;

    fn regs(n: usize) -> Vec<Value> {
        vec![Value::zero(); n]
    }

    #[test]
    fn add_helper_adds_two_ints() {
        let mut env = Environment::new();
        let mut r = regs(3);
        r[1] = Value::int(2);
        r[2] = Value::int(3);
        let ok = unsafe { jit_add_helper(&mut env, r.as_mut_ptr(), 0, 1, 2) };
        assert!(ok);
        assert_eq!(r[0].as_int(), Some(5));
    }

    #[test]
    fn add_helper_concatenates_strings() {
        let mut env = Environment::new();
        let mut r = regs(3);
        r[1] = gc::alloc_string(&mut env, StringObj::new("foo".into()));
        r[2] = gc::alloc_string(&mut env, StringObj::new("bar".into()));
        let ok = unsafe { jit_add_helper(&mut env, r.as_mut_ptr(), 0, 1, 2) };
        assert!(ok);
        let s = unsafe { (*r[0].as_string().unwrap()).as_str().into_owned() };
        assert_eq!(s, "foobar");
    }

    #[test]
    fn div_helper_rejects_division_by_zero() {
        let mut env = Environment::new();
        let mut r = regs(3);
        r[1] = Value::int(7);
        r[2] = Value::int(0);
        let ok = unsafe { jit_div_helper(&mut env, r.as_mut_ptr(), 0, 1, 2) };
        assert!(!ok);
        assert_eq!(env.error_message(), "division by zero");
    }

    #[test]
    fn neg_helper_negates_float() {
        let mut env = Environment::new();
        let mut r = regs(2);
        r[1] = Value::float(1.5);
        let ok = unsafe { jit_neg_helper(&mut env, r.as_mut_ptr(), 0, 1) };
        assert!(ok);
        assert_eq!(r[0].as_float(), Some(-1.5));
    }

    #[test]
    fn len_helper_reports_array_length() {
        let mut env = Environment::new();
        let mut arr = ArrayObj::new();
        arr.push(Value::int(1));
        arr.push(Value::int(2));
        let mut r = regs(2);
        r[1] = gc::alloc_array(&mut env, arr);
        let ok = unsafe { jit_len_helper(&mut env, r.as_mut_ptr(), 0, 1) };
        assert!(ok);
        assert_eq!(r[0].as_int(), Some(2));
    }

    #[test]
    fn loadarray_helper_reports_out_of_bounds() {
        let mut env = Environment::new();
        let mut r = regs(3);
        r[1] = gc::alloc_array(&mut env, ArrayObj::new());
        r[2] = Value::int(0);
        let ok = unsafe { jit_loadarray_helper(&mut env, r.as_mut_ptr(), 0, 1, 2) };
        assert!(!ok);
        assert_eq!(env.error_message(), "array index out of bounds");
    }

    #[test]
    fn storearray_helper_appends_at_the_next_index() {
        let mut env = Environment::new();
        let mut r = regs(3);
        r[0] = gc::alloc_array(&mut env, ArrayObj::new());
        r[1] = Value::int(0);
        r[2] = Value::int(42);
        let ok = unsafe { jit_storearray_helper(&mut env, r.as_mut_ptr(), 0, 1, 2) };
        assert!(ok);
        let arr = r[0].as_array().unwrap();
        assert_eq!(unsafe { (*arr).get(0) }, Some(Value::int(42)));
    }

    #[test]
    fn truthy_helper_treats_zero_as_false_and_others_as_true() {
        let mut r = regs(2);
        r[0] = Value::int(0);
        assert!(!unsafe { jit_truthy_helper(ptr::null_mut(), r.as_mut_ptr(), 0) });
        r[1] = Value::int(3);
        assert!(unsafe { jit_truthy_helper(ptr::null_mut(), r.as_mut_ptr(), 1) });
    }

    #[test]
    fn loadsymbol_helper_falls_back_to_globals() {
        let mut env = Environment::new();
        env.globals.set("g", Value::int(9));
        let base = env.registers.alloc_frame(1);
        let tptr = env.registers.ptr_at(base);
        let mut frame = Frame::new(base, tptr, 1, ptr::null_mut());
        env.top_frame = &mut frame as *mut Frame;

        let mut r = regs(1);
        let name = b"g";
        let ok = unsafe { jit_loadsymbol_helper(&mut env, r.as_mut_ptr(), 0, name.as_ptr(), name.len() as u32) };
        assert!(ok);
        assert_eq!(r[0].as_int(), Some(9));
        env.top_frame = ptr::null_mut();
    }

    #[test]
    fn loadsymbol_helper_reports_missing_name() {
        let mut env = Environment::new();
        let base = env.registers.alloc_frame(1);
        let tptr = env.registers.ptr_at(base);
        let mut frame = Frame::new(base, tptr, 1, ptr::null_mut());
        env.top_frame = &mut frame as *mut Frame;

        let mut r = regs(1);
        let name = b"missing";
        let ok = unsafe { jit_loadsymbol_helper(&mut env, r.as_mut_ptr(), 0, name.as_ptr(), name.len() as u32) };
        assert!(!ok);
        assert_eq!(env.error_message(), "missing symbol 'missing'");
        env.top_frame = ptr::null_mut();
    }

    #[test]
    fn storesymbol_helper_prefers_an_existing_local_over_a_global() {
        let mut env = Environment::new();
        env.globals.set("x", Value::int(1));
        let base = env.registers.alloc_frame(1);
        let tptr = env.registers.ptr_at(base);
        let mut frame = Frame::new(base, tptr, 1, ptr::null_mut());
        frame.locals.set("x", Value::int(0));
        env.top_frame = &mut frame as *mut Frame;

        let mut r = regs(1);
        r[0] = Value::int(7);
        let name = b"x";
        let ok = unsafe { jit_storesymbol_helper(&mut env, r.as_mut_ptr(), name.as_ptr(), name.len() as u32, 0) };
        assert!(ok);
        assert_eq!(frame.locals.get("x"), Some(Value::int(7)));
        assert_eq!(env.globals.get("x"), Some(Value::int(1)));
        env.top_frame = ptr::null_mut();
    }
}
