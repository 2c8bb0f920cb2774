//! The bytecode interpreter and function dispatch (`spec.md` §4.3, §4.7).
//!
//! `execute` is a straightforward fetch-decode-execute loop over one
//! function's flat instruction stream, bounds-checking every register
//! index and jump target the way `runtime.h`'s `CONSUME_*` macros do
//! before indexing `tmpvar[]`. [`call_function`] is the single place that
//! decides how to run a [`FuncObj`] — foreign, then JIT-native, then
//! bytecode, in that priority order (`spec.md` §4.7) — and is reused both
//! by the host-facing call API and by the `CALL`/`THISCALL` opcodes below.

use crate::error::{LinguineError, LinguineResult};
use crate::frame::{Environment, Frame};
use crate::gc;
use crate::lir::opcode::Opcode;
use crate::object::{ArrayObj, DictObj, FuncObj, NativeEntry, StringObj};
use crate::value::{Value, ValueTag};

/// Decodes one function's bytecode stream. Shared with [`crate::jit`], which
/// makes an identical single pass over the same bytes to find jump targets
/// and `CALL`/`THISCALL` sites before emitting native code.
pub(crate) struct Cursor<'a> {
    pub(crate) code: &'a [u8],
    pub(crate) pc: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn u8(&mut self) -> Option<u8> {
        let b = *self.code.get(self.pc)?;
        self.pc += 1;
        Some(b)
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        let bytes = self.code.get(self.pc..self.pc + 2)?;
        self.pc += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn i32(&mut self) -> Option<i32> {
        let bytes = self.code.get(self.pc..self.pc + 4)?;
        self.pc += 4;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.i32().map(|v| v as u32)
    }

    pub(crate) fn cstr(&mut self) -> Option<String> {
        let start = self.pc;
        let nul = self.code[start..].iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&self.code[start..start + nul]).into_owned();
        self.pc = start + nul + 1;
        Some(s)
    }
}

pub(crate) fn broken(env: &Environment) -> LinguineError {
    LinguineError::runtime(env.file_name.clone(), env.line, "broken bytecode")
}

pub(crate) fn type_error(env: &Environment, message: impl Into<String>) -> LinguineError {
    LinguineError::runtime(env.file_name.clone(), env.line, message.into())
}

/// Dispatch a call by the priority `spec.md` §4.7 specifies: a foreign
/// (host-registered) function wins over a cached JIT translation, which
/// wins over falling back to the bytecode interpreter.
pub fn call_function(env: &mut Environment, func_ptr: *mut FuncObj, args: &[Value]) -> LinguineResult<Value> {
    call_function_with_this(env, func_ptr, None, args)
}

/// Like [`call_function`], but also binds `this` into a local named
/// `"this"` (`spec.md` §4.7), for `THISCALL` dispatch.
pub fn call_function_with_this(
    env: &mut Environment,
    func_ptr: *mut FuncObj,
    this: Option<Value>,
    args: &[Value],
) -> LinguineResult<Value> {
    let func = unsafe { &*func_ptr };
    if func.foreign.is_some() {
        call_foreign(env, func_ptr, this, args)
    } else if func.native.is_some() {
        call_native(env, func_ptr, this, args)
    } else if func.bytecode.is_some() {
        run_bytecode(env, func_ptr, this, args)
    } else {
        Err(LinguineError::runtime(
            env.file_name.clone(),
            env.line,
            format!("function '{}' has no callable body", func.name),
        ))
    }
}

fn push_arg_frame(env: &mut Environment, func_ptr: *mut FuncObj, tmpvar_size: usize, this: Option<Value>, args: &[Value]) -> Frame {
    let reg_base = env.registers.alloc_frame(tmpvar_size);
    let tmpvar_ptr = env.registers.ptr_at(reg_base);
    let mut frame = Frame::new(reg_base, tmpvar_ptr, tmpvar_size, func_ptr);
    for (i, v) in args.iter().enumerate() {
        env.registers.set(reg_base, i as u16, *v);
    }
    let func = unsafe { &*func_ptr };
    for (i, name) in func.param_names.iter().enumerate() {
        frame.locals.set(name, args.get(i).copied().unwrap_or(Value::zero()));
    }
    if let Some(v) = this {
        frame.locals.set("this", v);
    }
    frame.next = env.top_frame;
    frame
}

fn pop_frame(env: &mut Environment, frame_ptr: *mut Frame, reg_base: usize) -> Value {
    let ret = env.registers.get(reg_base, 0).unwrap_or(Value::zero());
    env.top_frame = unsafe { (*frame_ptr).next };
    gc::shallow_gc_on_frame_exit(env, frame_ptr);
    env.registers.free_frame(reg_base);
    ret
}

fn call_foreign(env: &mut Environment, func_ptr: *mut FuncObj, this: Option<Value>, args: &[Value]) -> LinguineResult<Value> {
    let func = unsafe { &*func_ptr };
    let foreign = func.foreign.expect("call_foreign requires a foreign function");
    let tmpvar_size = args.len().max(1);
    let mut frame = push_arg_frame(env, func_ptr, tmpvar_size, this, args);
    let reg_base = frame.reg_base;
    let frame_ptr: *mut Frame = &mut frame;
    env.top_frame = frame_ptr;

    let outcome = foreign(env);

    let ret = pop_frame(env, frame_ptr, reg_base);
    outcome.map(|_| ret)
}

fn call_native(env: &mut Environment, func_ptr: *mut FuncObj, this: Option<Value>, args: &[Value]) -> LinguineResult<Value> {
    let func = unsafe { &*func_ptr };
    let native = func.native.expect("call_native requires a JIT-compiled entry");
    let tmpvar_size = func.bytecode.as_ref().map(|b| b.tmpvar_size as usize).unwrap_or(0).max(args.len());
    let mut frame = push_arg_frame(env, func_ptr, tmpvar_size, this, args);
    let reg_base = frame.reg_base;
    let frame_ptr: *mut Frame = &mut frame;
    env.top_frame = frame_ptr;

    let env_ptr: *mut Environment = env;
    let frame_base = env.registers.ptr_at(reg_base);
    let ok = unsafe { native(env_ptr, frame_base) };

    let ret = pop_frame(env, frame_ptr, reg_base);
    if ok {
        Ok(ret)
    } else {
        Err(LinguineError::runtime(env.error_file().to_string(), env.error_line(), env.error_message().to_string()))
    }
}

/// Run one bytecode function to completion, returning the value it left
/// in `$return` (`spec.md` §3 invariant 4: `tmpvar[0]` holds the result on
/// normal completion, which is exactly where the LIR epilogue puts it).
pub fn run_bytecode(env: &mut Environment, func_ptr: *mut FuncObj, this: Option<Value>, args: &[Value]) -> LinguineResult<Value> {
    let func = unsafe { &*func_ptr };
    let blob = func.bytecode.clone().expect("run_bytecode requires a bytecode function");
    let tmpvar_size = (blob.tmpvar_size as usize).max(args.len());
    let mut frame = push_arg_frame(env, func_ptr, tmpvar_size, this, args);
    let reg_base = frame.reg_base;
    let frame_ptr: *mut Frame = &mut frame;
    env.top_frame = frame_ptr;

    let outcome = execute(env, frame_ptr, &blob.code);

    let ret = pop_frame(env, frame_ptr, reg_base);
    outcome.map(|_| ret)
}

pub(crate) fn get_reg(env: &Environment, frame: *mut Frame, idx: u16) -> LinguineResult<Value> {
    let base = unsafe { (*frame).reg_base };
    env.registers.get(base, idx).ok_or_else(|| broken(env))
}

pub(crate) fn set_reg(env: &mut Environment, frame: *mut Frame, idx: u16, value: Value) -> LinguineResult<()> {
    let base = unsafe { (*frame).reg_base };
    if env.registers.set(base, idx, value) {
        Ok(())
    } else {
        Err(broken(env))
    }
}

pub(crate) fn is_truthy(v: Value) -> bool {
    match v.tag {
        ValueTag::Int => v.as_int() != Some(0),
        ValueTag::Float => v.as_float() != Some(0.0),
        _ => true,
    }
}

pub(crate) fn require_int(env: &Environment, v: Value) -> LinguineResult<i32> {
    v.as_int().ok_or_else(|| type_error(env, format!("expected int, found {}", v.type_name())))
}

pub(crate) fn require_string(env: &Environment, v: Value) -> LinguineResult<String> {
    match v.as_string() {
        Some(ptr) => Ok(unsafe { (*ptr).as_str().into_owned() }),
        None => Err(type_error(env, format!("expected string, found {}", v.type_name()))),
    }
}

pub(crate) fn value_eq(a: Value, b: Value) -> bool {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => a.as_int() == b.as_int(),
        (ValueTag::Float, ValueTag::Float) => a.as_float() == b.as_float(),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) => a.numeric_as_f64() == b.numeric_as_f64(),
        (ValueTag::String, ValueTag::String) => unsafe {
            (*a.as_string().unwrap()).bytes == (*b.as_string().unwrap()).bytes
        },
        (ValueTag::Array, ValueTag::Array) => a.as_array() == b.as_array(),
        (ValueTag::Dict, ValueTag::Dict) => a.as_dict() == b.as_dict(),
        (ValueTag::Func, ValueTag::Func) => a.as_func() == b.as_func(),
        _ => false,
    }
}

pub(crate) fn numeric_binop(
    env: &Environment,
    a: Value,
    b: Value,
    iop: impl FnOnce(i32, i32) -> LinguineResult<i32>,
    fop: impl FnOnce(f64, f64) -> f64,
) -> LinguineResult<Value> {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => Ok(Value::int(iop(a.as_int().unwrap(), b.as_int().unwrap())?)),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) | (ValueTag::Float, ValueTag::Float) => {
            Ok(Value::float(fop(a.numeric_as_f64().unwrap(), b.numeric_as_f64().unwrap()) as f32))
        }
        _ => Err(type_error(env, format!("arithmetic requires numeric operands, found {} and {}", a.type_name(), b.type_name()))),
    }
}

pub(crate) fn compare(env: &Environment, a: Value, b: Value, iop: fn(i32, i32) -> bool, fop: fn(f64, f64) -> bool) -> LinguineResult<Value> {
    match (a.tag, b.tag) {
        (ValueTag::Int, ValueTag::Int) => Ok(Value::int(iop(a.as_int().unwrap(), b.as_int().unwrap()) as i32)),
        (ValueTag::Int, ValueTag::Float) | (ValueTag::Float, ValueTag::Int) | (ValueTag::Float, ValueTag::Float) => {
            Ok(Value::int(fop(a.numeric_as_f64().unwrap(), b.numeric_as_f64().unwrap()) as i32))
        }
        _ => Err(type_error(env, format!("comparison requires numeric operands, found {} and {}", a.type_name(), b.type_name()))),
    }
}

pub(crate) fn load_array(env: &Environment, container: Value, key: Value) -> LinguineResult<Value> {
    match container.tag {
        ValueTag::Array => {
            let idx = require_int(env, key)? as usize;
            let ptr = container.as_array().unwrap();
            unsafe { &*ptr }.get(idx).ok_or_else(|| type_error(env, "array index out of bounds"))
        }
        ValueTag::Dict => {
            let k = require_string(env, key)?;
            let ptr = container.as_dict().unwrap();
            unsafe { &*ptr }.get(&k).ok_or_else(|| type_error(env, format!("missing dict key '{k}'")))
        }
        _ => Err(type_error(env, format!("{} is not indexable", container.type_name()))),
    }
}

pub(crate) fn store_array(env: &mut Environment, container: Value, key: Value, val: Value) -> LinguineResult<()> {
    match container.tag {
        ValueTag::Array => {
            let idx = require_int(env, key)? as usize;
            let ptr = container.as_array().unwrap();
            let deep = unsafe { (*ptr).links.is_deep };
            let arr = unsafe { &mut *ptr };
            if idx == arr.len() {
                arr.push(val);
            } else if idx < arr.len() {
                arr.set(idx, val);
            } else {
                return Err(type_error(env, "array index out of bounds"));
            }
            if deep {
                gc::promote_value(env, val);
            }
            Ok(())
        }
        ValueTag::Dict => {
            let k = require_string(env, key)?;
            let ptr = container.as_dict().unwrap();
            let deep = unsafe { (*ptr).links.is_deep };
            unsafe { (*ptr).set(&k, val) };
            if deep {
                gc::promote_value(env, val);
            }
            Ok(())
        }
        _ => Err(type_error(env, format!("{} is not indexable", container.type_name()))),
    }
}

pub(crate) fn as_dict(env: &Environment, v: Value) -> LinguineResult<*mut DictObj> {
    v.as_dict().ok_or_else(|| type_error(env, format!("expected an object, found {}", v.type_name())))
}

/// The fetch-decode-execute loop for one function's bytecode. Bounds
/// failures surface as `broken bytecode` the same way `runtime.h`'s
/// `CONSUME_*` macros do.
fn execute(env: &mut Environment, frame_ptr: *mut Frame, code: &[u8]) -> LinguineResult<()> {
    let mut cur = Cursor { code, pc: 0 };

    while cur.pc < code.len() {
        let opb = cur.u8().ok_or_else(|| broken(env))?;
        let op = Opcode::from_u8(opb).ok_or_else(|| broken(env))?;

        match op {
            Opcode::Nop => {}
            Opcode::Assign => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let v = get_reg(env, frame_ptr, src)?;
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::IConst => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let v = cur.i32().ok_or_else(|| broken(env))?;
                set_reg(env, frame_ptr, dst, Value::int(v))?;
            }
            Opcode::FConst => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let bits = cur.u32().ok_or_else(|| broken(env))?;
                set_reg(env, frame_ptr, dst, Value::float(f32::from_bits(bits)))?;
            }
            Opcode::SConst => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let s = cur.cstr().ok_or_else(|| broken(env))?;
                let v = gc::alloc_string(env, StringObj::new(s));
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::AConst => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let v = gc::alloc_array(env, ArrayObj::new());
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::DConst => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let v = gc::alloc_dict(env, DictObj::new());
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::Inc => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let v = get_reg(env, frame_ptr, dst)?;
                let i = require_int(env, v)?;
                set_reg(env, frame_ptr, dst, Value::int(i.wrapping_add(1)))?;
            }
            Opcode::Neg => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let v = get_reg(env, frame_ptr, src)?;
                let r = match v.tag {
                    ValueTag::Int => Value::int(-v.as_int().unwrap()),
                    ValueTag::Float => Value::float(-v.as_float().unwrap()),
                    _ => return Err(type_error(env, format!("cannot negate {}", v.type_name()))),
                };
                set_reg(env, frame_ptr, dst, r)?;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::And | Opcode::Or | Opcode::Xor => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let ra = cur.u16().ok_or_else(|| broken(env))?;
                let rb = cur.u16().ok_or_else(|| broken(env))?;
                let a = get_reg(env, frame_ptr, ra)?;
                let b = get_reg(env, frame_ptr, rb)?;
                let result = match op {
                    Opcode::Add if a.tag == ValueTag::String && b.tag == ValueTag::String => {
                        let combined = format!("{}{}", require_string(env, a)?, require_string(env, b)?);
                        gc::alloc_string(env, StringObj::new(combined))
                    }
                    Opcode::Add => numeric_binop(env, a, b, |x, y| Ok(x.wrapping_add(y)), |x, y| x + y)?,
                    Opcode::Sub => numeric_binop(env, a, b, |x, y| Ok(x.wrapping_sub(y)), |x, y| x - y)?,
                    Opcode::Mul => numeric_binop(env, a, b, |x, y| Ok(x.wrapping_mul(y)), |x, y| x * y)?,
                    Opcode::Div => {
                        if b.numeric_as_f64() == Some(0.0) {
                            return Err(type_error(env, "division by zero"));
                        }
                        numeric_binop(env, a, b, |x, y| Ok(x.wrapping_div(y)), |x, y| x / y)?
                    }
                    Opcode::Mod => {
                        let x = require_int(env, a)?;
                        let y = require_int(env, b)?;
                        if y == 0 {
                            return Err(type_error(env, "division by zero"));
                        }
                        Value::int(x.wrapping_rem(y))
                    }
                    Opcode::And => Value::int(require_int(env, a)? & require_int(env, b)?),
                    Opcode::Or => Value::int(require_int(env, a)? | require_int(env, b)?),
                    Opcode::Xor => Value::int(require_int(env, a)? ^ require_int(env, b)?),
                    _ => unreachable!(),
                };
                set_reg(env, frame_ptr, dst, result)?;
            }
            Opcode::Lt | Opcode::Lte | Opcode::Gt | Opcode::Gte | Opcode::Eq | Opcode::Neq | Opcode::EqI => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let ra = cur.u16().ok_or_else(|| broken(env))?;
                let rb = cur.u16().ok_or_else(|| broken(env))?;
                let a = get_reg(env, frame_ptr, ra)?;
                let b = get_reg(env, frame_ptr, rb)?;
                let result = match op {
                    Opcode::Lt => compare(env, a, b, |x, y| x < y, |x, y| x < y)?,
                    Opcode::Lte => compare(env, a, b, |x, y| x <= y, |x, y| x <= y)?,
                    Opcode::Gt => compare(env, a, b, |x, y| x > y, |x, y| x > y)?,
                    Opcode::Gte => compare(env, a, b, |x, y| x >= y, |x, y| x >= y)?,
                    Opcode::Eq | Opcode::EqI => Value::int(value_eq(a, b) as i32),
                    Opcode::Neq => Value::int(!value_eq(a, b) as i32),
                    _ => unreachable!(),
                };
                set_reg(env, frame_ptr, dst, result)?;
            }
            Opcode::LoadArray => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let arr = cur.u16().ok_or_else(|| broken(env))?;
                let idx = cur.u16().ok_or_else(|| broken(env))?;
                let container = get_reg(env, frame_ptr, arr)?;
                let key = get_reg(env, frame_ptr, idx)?;
                let v = load_array(env, container, key)?;
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::StoreArray => {
                let arr = cur.u16().ok_or_else(|| broken(env))?;
                let idx = cur.u16().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let container = get_reg(env, frame_ptr, arr)?;
                let key = get_reg(env, frame_ptr, idx)?;
                let val = get_reg(env, frame_ptr, src)?;
                store_array(env, container, key, val)?;
            }
            Opcode::Len => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let v = get_reg(env, frame_ptr, src)?;
                let len = match v.tag {
                    ValueTag::Array => unsafe { (*v.as_array().unwrap()).len() },
                    ValueTag::Dict => unsafe { (*v.as_dict().unwrap()).len() },
                    ValueTag::String => unsafe { (*v.as_string().unwrap()).len() },
                    _ => return Err(type_error(env, format!("{} has no length", v.type_name()))),
                };
                set_reg(env, frame_ptr, dst, Value::int(len as i32))?;
            }
            Opcode::GetDictKeyByIndex | Opcode::GetDictValByIndex => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let dreg = cur.u16().ok_or_else(|| broken(env))?;
                let ireg = cur.u16().ok_or_else(|| broken(env))?;
                let container = get_reg(env, frame_ptr, dreg)?;
                let idx = require_int(env, get_reg(env, frame_ptr, ireg)?)? as usize;
                let dict = as_dict(env, container)?;
                let v = if op == Opcode::GetDictKeyByIndex {
                    unsafe { (*dict).key_at(idx) }
                        .map(|s| gc::alloc_string(env, StringObj::new(s.to_string())))
                        .ok_or_else(|| type_error(env, "dict index out of bounds"))?
                } else {
                    unsafe { (*dict).value_at(idx) }.ok_or_else(|| type_error(env, "dict index out of bounds"))?
                };
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::StoreDot => {
                let obj = cur.u16().ok_or_else(|| broken(env))?;
                let name = cur.cstr().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let container = get_reg(env, frame_ptr, obj)?;
                let val = get_reg(env, frame_ptr, src)?;
                let key = gc::alloc_string(env, StringObj::new(name));
                store_array(env, container, key, val)?;
            }
            Opcode::LoadDot => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let obj = cur.u16().ok_or_else(|| broken(env))?;
                let name = cur.cstr().ok_or_else(|| broken(env))?;
                let container = get_reg(env, frame_ptr, obj)?;
                let dict = as_dict(env, container)?;
                let v = unsafe { (*dict).get(&name) }.ok_or_else(|| type_error(env, format!("missing field '{name}'")))?;
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::StoreSymbol => {
                let name = cur.cstr().ok_or_else(|| broken(env))?;
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let val = get_reg(env, frame_ptr, src)?;
                store_symbol(env, frame_ptr, &name, val);
            }
            Opcode::LoadSymbol => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let name = cur.cstr().ok_or_else(|| broken(env))?;
                let v = load_symbol(env, frame_ptr, &name).ok_or_else(|| type_error(env, format!("missing symbol '{name}'")))?;
                set_reg(env, frame_ptr, dst, v)?;
            }
            Opcode::Call => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let freg = cur.u16().ok_or_else(|| broken(env))?;
                let argc = cur.u8().ok_or_else(|| broken(env))?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let r = cur.u16().ok_or_else(|| broken(env))?;
                    args.push(get_reg(env, frame_ptr, r)?);
                }
                let callee = get_reg(env, frame_ptr, freg)?;
                let func_ptr = callee.as_func().ok_or_else(|| type_error(env, format!("{} is not callable", callee.type_name())))?;
                let result = call_function(env, func_ptr, &args)?;
                set_reg(env, frame_ptr, dst, result)?;
            }
            Opcode::ThisCall => {
                let dst = cur.u16().ok_or_else(|| broken(env))?;
                let rreg = cur.u16().ok_or_else(|| broken(env))?;
                let method = cur.cstr().ok_or_else(|| broken(env))?;
                let argc = cur.u8().ok_or_else(|| broken(env))?;
                let mut args = Vec::with_capacity(argc as usize);
                let recv = get_reg(env, frame_ptr, rreg)?;
                for _ in 0..argc {
                    let r = cur.u16().ok_or_else(|| broken(env))?;
                    args.push(get_reg(env, frame_ptr, r)?);
                }
                let dict = as_dict(env, recv)?;
                let method_val = unsafe { (*dict).get(&method) }.ok_or_else(|| type_error(env, format!("missing method '{method}'")))?;
                let func_ptr = method_val
                    .as_func()
                    .ok_or_else(|| type_error(env, format!("'{method}' is not a function")))?;
                let result = call_function_with_this(env, func_ptr, Some(recv), &args)?;
                set_reg(env, frame_ptr, dst, result)?;
            }
            Opcode::Jmp => {
                let target = cur.u32().ok_or_else(|| broken(env))?;
                cur.pc = target as usize;
            }
            Opcode::JmpIfTrue | Opcode::JmpIfEq => {
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let target = cur.u32().ok_or_else(|| broken(env))?;
                if is_truthy(get_reg(env, frame_ptr, src)?) {
                    cur.pc = target as usize;
                }
            }
            Opcode::JmpIfFalse => {
                let src = cur.u16().ok_or_else(|| broken(env))?;
                let target = cur.u32().ok_or_else(|| broken(env))?;
                if !is_truthy(get_reg(env, frame_ptr, src)?) {
                    cur.pc = target as usize;
                }
            }
            Opcode::LineInfo => {
                let line = cur.i32().ok_or_else(|| broken(env))?;
                env.line = line;
            }
        }
    }
    Ok(())
}

pub(crate) fn store_symbol(env: &mut Environment, frame: *mut Frame, name: &str, val: Value) {
    let locals = unsafe { &mut (*frame).locals };
    if locals.contains(name) {
        locals.set(name, val);
        return;
    }
    if env.globals.contains(name) {
        env.globals.set(name, val);
        if val.is_heap_allocated() {
            gc::promote_value(env, val);
        }
        return;
    }
    locals.set(name, val);
}

pub(crate) fn load_symbol(env: &Environment, frame: *mut Frame, name: &str) -> Option<Value> {
    let locals = unsafe { &(*frame).locals };
    locals.get(name).or_else(|| env.globals.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstExpr, AstFunc, AstStmt, AstTerm};
    use crate::object::BytecodeBlob;
    use crate::{hir, lir};

    fn int(v: i32) -> AstExpr {
        AstExpr::Term(AstTerm::Int(v))
    }

    fn sym(name: &str) -> AstExpr {
        AstExpr::Term(AstTerm::Symbol(name.to_string()))
    }

    fn register(env: &mut Environment, name: &str, params: &[&str], body: Vec<AstStmt>) -> *mut FuncObj {
        let f = AstFunc {
            name: name.to_string(),
            params: params.iter().map(|s| s.to_string()).collect(),
            file_name: "test.lg".to_string(),
            line: 1,
            body,
        };
        let program = hir::build_program(vec![f]).unwrap();
        let lir_func = lir::build_func(&program.funcs[0]).unwrap();
        let obj = FuncObj::from_bytecode(
            lir_func.name,
            lir_func.file_name,
            lir_func.param_names,
            BytecodeBlob { code: lir_func.bytecode, tmpvar_size: lir_func.tmpvar_size as usize },
        );
        env.register_function(obj)
    }

    #[test]
    fn returning_an_arithmetic_expression() {
        // fn main() { return 1 + 2; }
        let mut env = Environment::new();
        let before = env.heap_usage;
        let main = register(&mut env, "main", &[], vec![AstStmt::Return { line: 1, value: Some(AstExpr::Plus(Box::new(int(1)), Box::new(int(2)))) }]);
        let result = call_function(&mut env, main, &[]).unwrap();
        assert_eq!(result.as_int(), Some(3));
        assert_eq!(env.heap_usage, before);
    }

    #[test]
    fn recursive_factorial() {
        // fn fact(n) { if (n < 2) { return 1; } return n * fact(n - 1); }
        let mut env = Environment::new();
        let fact = register(
            &mut env,
            "fact",
            &["n"],
            vec![
                AstStmt::If {
                    line: 1,
                    cond: AstExpr::Lt(Box::new(sym("n")), Box::new(int(2))),
                    body: vec![AstStmt::Return { line: 1, value: Some(int(1)) }],
                    elifs: vec![],
                    else_body: None,
                },
                AstStmt::Return {
                    line: 2,
                    value: Some(AstExpr::Mul(
                        Box::new(sym("n")),
                        Box::new(AstExpr::Call(Box::new(sym("fact")), vec![AstExpr::Minus(Box::new(sym("n")), Box::new(int(1)))])),
                    )),
                },
            ],
        );
        env.globals.set("fact", Value::func(fact));

        let result = call_function(&mut env, fact, &[Value::int(5)]).unwrap();
        assert_eq!(result.as_int(), Some(120));
    }

    #[test]
    fn calling_a_non_function_value_is_a_runtime_error() {
        // fn main() { return (1)(); }
        let mut env = Environment::new();
        let main = register(
            &mut env,
            "main",
            &[],
            vec![AstStmt::Return { line: 1, value: Some(AstExpr::Call(Box::new(int(1)), vec![])) }],
        );
        let err = call_function(&mut env, main, &[]).unwrap_err();
        assert!(err.message().contains("not callable"));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut env = Environment::new();
        let main = register(
            &mut env,
            "main",
            &[],
            vec![AstStmt::Return { line: 1, value: Some(AstExpr::Div(Box::new(int(1)), Box::new(int(0)))) }],
        );
        let err = call_function(&mut env, main, &[]).unwrap_err();
        assert!(err.message().contains("division by zero"));
    }

    #[test]
    fn array_index_out_of_range_is_a_runtime_error() {
        // fn main() { a = []; a[0] = 1; return a[1]; }
        let mut env = Environment::new();
        let main = register(
            &mut env,
            "main",
            &[],
            vec![
                AstStmt::Expr { line: 1, lhs: Some(sym("a")), rhs: AstExpr::Term(AstTerm::EmptyArray) },
                AstStmt::Expr { line: 2, lhs: Some(AstExpr::Subscript(Box::new(sym("a")), Box::new(int(0)))), rhs: int(1) },
                AstStmt::Return { line: 3, value: Some(AstExpr::Subscript(Box::new(sym("a")), Box::new(int(1)))) },
            ],
        );
        let err = call_function(&mut env, main, &[]).unwrap_err();
        assert!(err.message().contains("out of bounds"));
    }

    #[test]
    fn while_loop_accumulates() {
        // fn main() { i = 0; sum = 0; while (i < 5) { sum = sum + i; i = i + 1; } return sum; }
        let mut env = Environment::new();
        let main = register(
            &mut env,
            "main",
            &[],
            vec![
                AstStmt::Expr { line: 1, lhs: Some(sym("i")), rhs: int(0) },
                AstStmt::Expr { line: 1, lhs: Some(sym("sum")), rhs: int(0) },
                AstStmt::While {
                    line: 2,
                    cond: AstExpr::Lt(Box::new(sym("i")), Box::new(int(5))),
                    body: vec![
                        AstStmt::Expr { line: 3, lhs: Some(sym("sum")), rhs: AstExpr::Plus(Box::new(sym("sum")), Box::new(sym("i"))) },
                        AstStmt::Expr { line: 4, lhs: Some(sym("i")), rhs: AstExpr::Plus(Box::new(sym("i")), Box::new(int(1))) },
                    ],
                },
                AstStmt::Return { line: 5, value: Some(sym("sum")) },
            ],
        );
        let result = call_function(&mut env, main, &[]).unwrap();
        assert_eq!(result.as_int(), Some(10));
    }

    #[test]
    fn cursor_reads_big_endian_operands() {
        let mut cur = Cursor { code: &[0x00, 0x00, 0x01, 0x02], pc: 0 };
        assert_eq!(cur.u16(), Some(0x0000));
        assert_eq!(cur.i32(), None);
        let mut cur2 = Cursor { code: &[0x00, 0x00, 0x00, 0x05], pc: 0 };
        assert_eq!(cur2.i32(), Some(5));
    }
}
