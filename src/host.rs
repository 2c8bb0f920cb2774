//! The embedding-facing API (`spec.md` §6, "Host API surface").
//!
//! `spec.md` §9 folds every per-embedding global into [`Environment`]
//! ("Collapse ... all per-embedding state into the Environment"), so this
//! module adds its surface as inherent methods on that type rather than a
//! separate handle/wrapper struct — there is nothing a wrapper would hold
//! that `Environment` doesn't already own.
//!
//! Source registration (`register_source`, per the original's `rt_register_source`)
//! is not implemented: `spec.md` §1 places the lexer/parser out of scope, and
//! there is no AST-to-bytecode path reachable without one. [`Environment::register_bytecode`]
//! and [`Environment::register_bytecode_file`] cover every other way a
//! function can enter the environment.

use crate::bytecode_file;
use crate::frame::Environment;
use crate::gc;
use crate::interpreter::{self, get_reg, set_reg};
use crate::lir::LirFunc;
use crate::object::{ArrayObj, DictObj, FuncObj, ForeignFn, StringObj};
use crate::value::Value;
use crate::{LinguineError, LinguineResult};
use std::path::Path;

impl Environment {
    /// Registers a host-implemented (`spec.md` §4.3 "foreign") function
    /// under `name`. `param_names` only needs to list enough names for
    /// `this`-binding and diagnostics; the foreign function itself reads
    /// its arguments with [`Environment::arg`].
    pub fn register_foreign(&mut self, name: impl Into<String>, param_names: Vec<String>, f: ForeignFn) -> *mut FuncObj {
        self.register_function(FuncObj::foreign(name.into(), param_names, f))
    }

    /// Loads every function in a compiled bytecode file (`spec.md` §6) and
    /// registers each one. Returns the names registered, in file order.
    pub fn register_bytecode_file(&mut self, path: impl AsRef<Path>) -> LinguineResult<Vec<String>> {
        let (source_name, funcs) = bytecode_file::read_file(path)?;
        self.file_name = source_name;
        Ok(funcs.into_iter().map(|f| self.register_lir(f)).collect())
    }

    /// Like [`Environment::register_bytecode_file`], but from an in-memory
    /// buffer (e.g. bytes embedded with `include_bytes!`).
    pub fn register_bytecode_bytes(&mut self, data: &[u8]) -> LinguineResult<Vec<String>> {
        let (source_name, funcs) = bytecode_file::read_from_slice(data)?;
        self.file_name = source_name;
        Ok(funcs.into_iter().map(|f| self.register_lir(f)).collect())
    }

    fn register_lir(&mut self, func: LirFunc) -> String {
        let name = func.name.clone();
        let obj = FuncObj::from_bytecode(
            func.name,
            func.file_name,
            func.param_names,
            crate::object::BytecodeBlob { code: func.bytecode, tmpvar_size: func.tmpvar_size as usize },
        );
        self.register_function(obj);
        name
    }

    /// Calls a registered function by name with no `this` binding
    /// (`spec.md` §6, "call by name ... with argument array, and return
    /// value").
    pub fn call_by_name(&mut self, name: &str, args: &[Value]) -> LinguineResult<Value> {
        let func_ptr = self
            .find_function(name)
            .ok_or_else(|| LinguineError::load(format!("no function named '{name}'")))?;
        interpreter::call_function(self, func_ptr, args)
    }

    /// Calls a registered function by name, binding `this` for the call
    /// (`spec.md` §6, "call ... with `this`-pointer").
    pub fn call_by_name_with_this(&mut self, name: &str, this: Value, args: &[Value]) -> LinguineResult<Value> {
        let func_ptr = self
            .find_function(name)
            .ok_or_else(|| LinguineError::load(format!("no function named '{name}'")))?;
        interpreter::call_function_with_this(self, func_ptr, Some(this), args)
    }

    /// Calls a function object directly (`spec.md` §6, "call ... by
    /// function object"), e.g. one loaded out of a dict field or array
    /// element via [`Value::as_func`].
    ///
    /// # Safety
    /// `func_ptr` must point at a [`FuncObj`] registered with this
    /// environment (or a still-live one from it).
    pub unsafe fn call_func(&mut self, func_ptr: *mut FuncObj, args: &[Value]) -> LinguineResult<Value> {
        interpreter::call_function(self, func_ptr, args)
    }

    // -- Value construction (`spec.md` §6: "construct/inspect values") --

    pub fn make_int(&self, v: i32) -> Value {
        Value::int(v)
    }

    pub fn make_float(&self, v: f32) -> Value {
        Value::float(v)
    }

    pub fn make_string(&mut self, s: impl Into<String>) -> Value {
        gc::alloc_string(self, StringObj::new(s.into()))
    }

    pub fn make_array(&mut self) -> Value {
        gc::alloc_array(self, ArrayObj::new())
    }

    pub fn make_dict(&mut self) -> Value {
        gc::alloc_dict(self, DictObj::new())
    }

    pub fn inspect_string(&self, v: Value) -> LinguineResult<String> {
        v.as_string()
            .map(|p| unsafe { (*p).as_str().into_owned() })
            .ok_or_else(|| LinguineError::runtime(self.file_name.clone(), self.line, format!("expected string, found {}", v.type_name())))
    }

    // -- Array accessors (`spec.md` §6: "array ... accessors including
    // resize and remove") --

    pub fn array_len(&self, arr: Value) -> LinguineResult<usize> {
        self.as_array(arr).map(|p| unsafe { (*p).len() })
    }

    pub fn array_get(&self, arr: Value, index: usize) -> LinguineResult<Value> {
        let p = self.as_array(arr)?;
        unsafe { (*p).get(index) }.ok_or_else(|| self.runtime_error("array index out of bounds"))
    }

    pub fn array_set(&mut self, arr: Value, index: usize, value: Value) -> LinguineResult<()> {
        let p = self.as_array(arr)?;
        let deep = unsafe { (*p).links.is_deep };
        let ok = unsafe { (*p).set(index, value) };
        if !ok {
            return Err(self.runtime_error("array index out of bounds"));
        }
        if deep {
            gc::promote_value(self, value);
        }
        Ok(())
    }

    pub fn array_push(&mut self, arr: Value, value: Value) -> LinguineResult<()> {
        let p = self.as_array(arr)?;
        let deep = unsafe { (*p).links.is_deep };
        unsafe { (*p).push(value) };
        if deep {
            gc::promote_value(self, value);
        }
        Ok(())
    }

    pub fn array_resize(&mut self, arr: Value, size: usize) -> LinguineResult<()> {
        let p = self.as_array(arr)?;
        unsafe { (*p).resize(size) };
        Ok(())
    }

    /// Removes the element at `index`, shifting subsequent elements down.
    pub fn array_remove(&mut self, arr: Value, index: usize) -> LinguineResult<Value> {
        let p = self.as_array(arr)?;
        let arr_ref = unsafe { &mut *p };
        if index >= arr_ref.len() {
            return Err(self.runtime_error("array index out of bounds"));
        }
        Ok(arr_ref.elements.remove(index))
    }

    fn as_array(&self, v: Value) -> LinguineResult<*mut ArrayObj> {
        v.as_array().ok_or_else(|| self.runtime_error(format!("expected an array, found {}", v.type_name())))
    }

    // -- Dict accessors --

    pub fn dict_size(&self, dict: Value) -> LinguineResult<usize> {
        self.as_dict(dict).map(|p| unsafe { (*p).len() })
    }

    pub fn dict_get(&self, dict: Value, key: &str) -> LinguineResult<Option<Value>> {
        let p = self.as_dict(dict)?;
        Ok(unsafe { (*p).get(key) })
    }

    pub fn dict_set(&mut self, dict: Value, key: &str, value: Value) -> LinguineResult<()> {
        let p = self.as_dict(dict)?;
        let deep = unsafe { (*p).links.is_deep };
        unsafe { (*p).set(key, value) };
        if deep {
            gc::promote_value(self, value);
        }
        Ok(())
    }

    pub fn dict_remove(&mut self, dict: Value, key: &str) -> LinguineResult<bool> {
        let p = self.as_dict(dict)?;
        Ok(unsafe { (*p).unset(key) })
    }

    fn as_dict(&self, v: Value) -> LinguineResult<*mut DictObj> {
        v.as_dict().ok_or_else(|| self.runtime_error(format!("expected an object, found {}", v.type_name())))
    }

    // -- Globals (`spec.md` §6: "global read/write") --

    pub fn global_get(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    pub fn global_set(&mut self, name: &str, value: Value) {
        self.globals.set(name, value);
        if value.is_heap_allocated() {
            gc::promote_value(self, value);
        }
    }

    // -- Foreign-function call convention (`spec.md` §6: "foreign-function
    // argument read and return write") --

    /// Reads argument `index` of the foreign function currently executing.
    /// Only meaningful from inside a [`ForeignFn`] body, where
    /// [`Environment::top_frame`] is the callee's own frame.
    pub fn arg(&self, index: u16) -> LinguineResult<Value> {
        get_reg(self, self.top_frame, index)
    }

    /// Writes the value a foreign function returns. Mirrors how a bytecode
    /// function leaves its result in `tmpvar[0]` (`spec.md` §3 invariant 4).
    pub fn set_return(&mut self, value: Value) -> LinguineResult<()> {
        let frame = self.top_frame;
        set_reg(self, frame, 0, value)
    }

    // -- GC and diagnostics (`spec.md` §6: "explicit shallow and deep GC;
    // heap-usage query") --

    pub fn gc_shallow(&mut self) {
        gc::shallow_gc(self);
    }

    pub fn gc_deep(&mut self) {
        gc::deep_gc(self);
    }

    pub fn heap_usage(&self) -> usize {
        self.heap_usage
    }

    fn runtime_error(&self, message: impl Into<String>) -> LinguineError {
        LinguineError::runtime(self.file_name.clone(), self.line, message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinguineResult as Result;

    fn double(env: &mut Environment) -> Result<()> {
        let n = env.arg(0)?.as_int().unwrap_or(0);
        env.set_return(Value::int(n * 2))?;
        Ok(())
    }

    #[test]
    fn registers_and_calls_a_foreign_function() {
        let mut env = Environment::new();
        env.register_foreign("double", vec!["n".to_string()], double);
        let result = env.call_by_name("double", &[Value::int(21)]).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn missing_function_is_a_load_error() {
        let mut env = Environment::new();
        let err = env.call_by_name("missing", &[]).unwrap_err();
        assert!(matches!(err, LinguineError::Load2(_)));
    }

    #[test]
    fn array_accessors_round_trip() {
        let mut env = Environment::new();
        let arr = env.make_array();
        env.array_push(arr, Value::int(1)).unwrap();
        env.array_push(arr, Value::int(2)).unwrap();
        assert_eq!(env.array_len(arr).unwrap(), 2);
        env.array_set(arr, 0, Value::int(9)).unwrap();
        assert_eq!(env.array_get(arr, 0).unwrap().as_int(), Some(9));
        let removed = env.array_remove(arr, 0).unwrap();
        assert_eq!(removed.as_int(), Some(9));
        assert_eq!(env.array_len(arr).unwrap(), 1);
    }

    #[test]
    fn dict_accessors_round_trip() {
        let mut env = Environment::new();
        let dict = env.make_dict();
        env.dict_set(dict, "x", Value::int(7)).unwrap();
        assert_eq!(env.dict_get(dict, "x").unwrap().unwrap().as_int(), Some(7));
        assert_eq!(env.dict_size(dict).unwrap(), 1);
        assert!(env.dict_remove(dict, "x").unwrap());
        assert_eq!(env.dict_size(dict).unwrap(), 0);
    }

    #[test]
    fn globals_promote_heap_values_when_set() {
        let mut env = Environment::new();
        let s = env.make_string("hi");
        env.global_set("g", s);
        assert_eq!(env.global_get("g").unwrap().as_string(), s.as_string());
    }
}
