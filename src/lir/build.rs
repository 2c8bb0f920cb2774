//! Lowers one [`crate::hir::HirFunc`] into a [`super::LirFunc`].
//!
//! The block graph is walked once (`emit_chain`), stamping each block's
//! bytecode address the first time it's reached and appending its
//! instructions; an edge marked `stop = false` is a tail-continuation into
//! the next block in the same pass, while `stop = true` always emits an
//! explicit jump, recorded in a pending-patch list and resolved once every
//! block in the function has an address (`spec.md` §4.2's relocation
//! table for forward jumps — `return`, `break`, loop exits, and `if`
//! chains all target blocks that may not have been emitted yet).
//!
//! `if`/`elif`/`else` chains are the one shape this walk cannot treat
//! uniformly: every branch after the first is reached only through the
//! previous branch's false-edge, not through the generic "what comes after
//! this block" rule, so [`FuncBuilder::emit_if_chain`] walks the whole
//! chain itself before control returns to the generic loop.

use crate::ast::{AstExpr, AstTerm};
use crate::hir::{Block, BlockId, BlockKind, ForShape, HirFunc, HirStmt};
use crate::lir::opcode::Opcode;
use crate::lir::LirFunc;

/// Soft cap carried over from `hir.h`'s fixed-size `HIR_ARRAY_LITERAL_SIZE`;
/// our literals build into a growable [`crate::object::ArrayObj`], so this
/// is a validation limit, not a storage limit.
pub const MAX_ARRAY_LITERAL: usize = 32;
/// As above, for `HIR_DICT_LITERAL_SIZE`.
pub const MAX_DICT_LITERAL: usize = 32;
/// `runtime.h`'s `RT_ARG_MAX`: the shared bound for argument count,
/// parameter count, and the `Imm8` operand of `CALL`/`THISCALL` — a call
/// with more arguments than this would silently wrap when encoded as a
/// single byte, corrupting the argument count against the registers that
/// follow it.
pub const RT_ARG_MAX: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LirError {
    InvalidAssignmentTarget { line: i32 },
    ArrayLiteralTooLarge { count: usize },
    DictLiteralTooLarge { count: usize },
    TooManyArgs { count: usize },
}

impl std::fmt::Display for LirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LirError::InvalidAssignmentTarget { line } => write!(f, "line {line}: invalid assignment target"),
            LirError::ArrayLiteralTooLarge { count } => {
                write!(f, "array literal has {count} elements, more than {MAX_ARRAY_LITERAL}")
            }
            LirError::DictLiteralTooLarge { count } => {
                write!(f, "dict literal has {count} entries, more than {MAX_DICT_LITERAL}")
            }
            LirError::TooManyArgs { count } => {
                write!(f, "call has {count} arguments, more than {RT_ARG_MAX}")
            }
        }
    }
}

impl std::error::Error for LirError {}

pub fn build_func(f: &HirFunc) -> Result<LirFunc, LirError> {
    let mut b = FuncBuilder::new(f);
    b.emit_chain(f.entry)?;
    b.patch_jumps();
    Ok(LirFunc {
        name: f.name.clone(),
        file_name: f.file_name.clone(),
        param_names: f.param_names.clone(),
        tmpvar_size: b.high_water,
        bytecode: b.code,
    })
}

struct FuncBuilder<'a> {
    hir: &'a [Block],
    code: Vec<u8>,
    addrs: Vec<u32>,
    emitted: Vec<bool>,
    pending: Vec<(usize, BlockId)>,
    next_tmp: u16,
    high_water: u16,
    last_line: i32,
}

impl<'a> FuncBuilder<'a> {
    fn new(f: &'a HirFunc) -> Self {
        FuncBuilder {
            hir: &f.blocks,
            code: Vec::new(),
            addrs: vec![u32::MAX; f.blocks.len()],
            emitted: vec![false; f.blocks.len()],
            pending: Vec::new(),
            next_tmp: 0,
            high_water: 0,
            last_line: 0,
        }
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn emit_op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    fn emit_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_cstr(&mut self, s: &str) {
        self.code.extend_from_slice(s.as_bytes());
        self.code.push(0);
    }

    fn alloc_tmp(&mut self) -> u16 {
        let r = self.next_tmp;
        self.next_tmp += 1;
        if self.next_tmp > self.high_water {
            self.high_water = self.next_tmp;
        }
        r
    }

    /// Temporaries are freed in strict LIFO order by every caller below —
    /// each expression frees exactly the temporaries it allocated, most
    /// recent first.
    fn free_tmp(&mut self, r: u16) {
        debug_assert_eq!(r, self.next_tmp - 1, "temporaries must be freed in LIFO order");
        self.next_tmp -= 1;
    }

    fn iconst(&mut self, v: i32) -> u16 {
        let dst = self.alloc_tmp();
        self.emit_op(Opcode::IConst);
        self.emit_u16(dst);
        self.emit_i32(v);
        dst
    }

    fn store_symbol(&mut self, name: &str, src: u16) {
        self.emit_op(Opcode::StoreSymbol);
        self.emit_cstr(name);
        self.emit_u16(src);
    }

    fn load_symbol(&mut self, name: &str) -> u16 {
        let dst = self.alloc_tmp();
        self.emit_op(Opcode::LoadSymbol);
        self.emit_u16(dst);
        self.emit_cstr(name);
        dst
    }

    fn line_marker(&mut self, line: i32) {
        if line != 0 && line != self.last_line {
            self.emit_op(Opcode::LineInfo);
            self.emit_i32(line);
            self.last_line = line;
        }
    }

    fn record_pending(&mut self, target: BlockId) {
        let at = self.here();
        self.emit_u32(0);
        self.pending.push((at, target));
    }

    fn emit_uncond_jump(&mut self, target: BlockId) {
        self.emit_op(Opcode::Jmp);
        self.record_pending(target);
    }

    fn emit_cond_jump(&mut self, op: Opcode, src: u16, target: BlockId) {
        self.emit_op(op);
        self.emit_u16(src);
        self.record_pending(target);
    }

    fn patch_jumps(&mut self) {
        for (at, target) in self.pending.clone() {
            let addr = self.addrs[target];
            debug_assert_ne!(addr, u32::MAX, "jump target block was never emitted");
            self.code[at..at + 4].copy_from_slice(&addr.to_be_bytes());
        }
    }

    fn emit_prologue(&mut self) {
        let zero = self.iconst(0);
        self.store_symbol("$return", zero);
        self.free_tmp(zero);
    }

    fn emit_epilogue(&mut self) {
        let r = self.load_symbol("$return");
        self.emit_op(Opcode::Assign);
        self.emit_u16(0);
        self.emit_u16(r);
        self.free_tmp(r);
    }

    fn hidden_name(id: BlockId, suffix: &str) -> String {
        format!("$for.{id}.{suffix}")
    }

    fn emit_for_prepare(&mut self, id: BlockId, shape: &ForShape) -> Result<(), LirError> {
        match shape {
            ForShape::Range { counter, start, stop } => {
                let s = self.expr(start)?;
                self.store_symbol(counter, s);
                self.free_tmp(s);
                let t = self.expr(stop)?;
                self.store_symbol(&Self::hidden_name(id, "stop"), t);
                self.free_tmp(t);
            }
            ForShape::KeyValue { collection, .. } | ForShape::Value { collection, .. } => {
                let c = self.expr(collection)?;
                self.store_symbol(&Self::hidden_name(id, "coll"), c);
                self.free_tmp(c);
                let z = self.iconst(0);
                self.store_symbol(&Self::hidden_name(id, "idx"), z);
                self.free_tmp(z);
            }
        }
        Ok(())
    }

    /// Exit test for all three shapes: `cmp = counter == limit`, then "if
    /// i == size then break" via `EqI`+`JmpIfEq`, matching `src/lir.c`'s
    /// loop-header lowering rather than a less-than/branch-if-false test.
    fn emit_for_test(&mut self, id: BlockId, shape: &ForShape) {
        let exit = self.hir[id].succ.expect("for header always has succ = exit");
        match shape {
            ForShape::Range { counter, .. } => {
                let c = self.load_symbol(counter);
                let lim = self.load_symbol(&Self::hidden_name(id, "stop"));
                let cmp = self.alloc_tmp();
                self.emit_op(Opcode::EqI);
                self.emit_u16(cmp);
                self.emit_u16(c);
                self.emit_u16(lim);
                self.emit_cond_jump(Opcode::JmpIfEq, cmp, exit);
                self.free_tmp(cmp);
                self.free_tmp(lim);
                self.free_tmp(c);
            }
            ForShape::KeyValue { key, value, .. } => {
                let idx = self.load_symbol(&Self::hidden_name(id, "idx"));
                let coll = self.load_symbol(&Self::hidden_name(id, "coll"));
                let len = self.alloc_tmp();
                self.emit_op(Opcode::Len);
                self.emit_u16(len);
                self.emit_u16(coll);
                let cmp = self.alloc_tmp();
                self.emit_op(Opcode::EqI);
                self.emit_u16(cmp);
                self.emit_u16(idx);
                self.emit_u16(len);
                self.emit_cond_jump(Opcode::JmpIfEq, cmp, exit);
                self.free_tmp(cmp);
                self.free_tmp(len);

                let k = self.alloc_tmp();
                self.emit_op(Opcode::GetDictKeyByIndex);
                self.emit_u16(k);
                self.emit_u16(coll);
                self.emit_u16(idx);
                self.store_symbol(key, k);
                self.free_tmp(k);

                let v = self.alloc_tmp();
                self.emit_op(Opcode::GetDictValByIndex);
                self.emit_u16(v);
                self.emit_u16(coll);
                self.emit_u16(idx);
                self.store_symbol(value, v);
                self.free_tmp(v);

                self.free_tmp(coll);
                self.free_tmp(idx);
            }
            ForShape::Value { value, .. } => {
                let idx = self.load_symbol(&Self::hidden_name(id, "idx"));
                let coll = self.load_symbol(&Self::hidden_name(id, "coll"));
                let len = self.alloc_tmp();
                self.emit_op(Opcode::Len);
                self.emit_u16(len);
                self.emit_u16(coll);
                let cmp = self.alloc_tmp();
                self.emit_op(Opcode::EqI);
                self.emit_u16(cmp);
                self.emit_u16(idx);
                self.emit_u16(len);
                self.emit_cond_jump(Opcode::JmpIfEq, cmp, exit);
                self.free_tmp(cmp);
                self.free_tmp(len);

                let v = self.alloc_tmp();
                self.emit_op(Opcode::LoadArray);
                self.emit_u16(v);
                self.emit_u16(coll);
                self.emit_u16(idx);
                self.store_symbol(value, v);
                self.free_tmp(v);

                self.free_tmp(coll);
                self.free_tmp(idx);
            }
        }
    }

    fn emit_for_advance(&mut self, id: BlockId, shape: &ForShape) {
        match shape {
            ForShape::Range { counter, .. } => {
                let c = self.load_symbol(counter);
                self.emit_op(Opcode::Inc);
                self.emit_u16(c);
                self.store_symbol(counter, c);
                self.free_tmp(c);
            }
            ForShape::KeyValue { .. } | ForShape::Value { .. } => {
                let idx = self.load_symbol(&Self::hidden_name(id, "idx"));
                self.emit_op(Opcode::Inc);
                self.emit_u16(idx);
                self.store_symbol(&Self::hidden_name(id, "idx"), idx);
                self.free_tmp(idx);
            }
        }
    }

    /// An edge that needs an explicit jump. Jumping to a `for` loop's
    /// header (a normal body-completion back-edge, or a `continue`) must
    /// advance the induction state first — this is the one chokepoint
    /// both paths go through.
    fn emit_jump_to(&mut self, target: BlockId) {
        if let BlockKind::For { shape, .. } = &self.hir[target].kind {
            let shape = shape.clone();
            self.emit_for_advance(target, &shape);
        }
        self.emit_uncond_jump(target);
    }

    fn emit_chain(&mut self, mut id: BlockId) -> Result<(), LirError> {
        loop {
            if self.emitted[id] {
                return Ok(());
            }
            self.emitted[id] = true;
            let line = self.hir[id].line;

            match self.hir[id].kind.clone() {
                BlockKind::Func { inner, .. } => {
                    self.addrs[id] = self.here() as u32;
                    self.emit_prologue();
                    self.emit_chain(inner)?;
                    return Ok(());
                }
                BlockKind::End => {
                    self.addrs[id] = self.here() as u32;
                    self.emit_epilogue();
                    return Ok(());
                }
                BlockKind::Basic { stmts } => {
                    self.addrs[id] = self.here() as u32;
                    for s in &stmts {
                        self.stmt(s)?;
                    }
                }
                BlockKind::If { .. } => {
                    self.emit_if_chain(id)?;
                }
                BlockKind::While { cond, inner } => {
                    self.addrs[id] = self.here() as u32;
                    self.line_marker(line);
                    let c = self.expr(&cond)?;
                    let exit = self.hir[id].succ.expect("while header has succ = exit");
                    self.emit_cond_jump(Opcode::JmpIfFalse, c, exit);
                    self.free_tmp(c);
                    self.emit_chain(inner)?;
                }
                BlockKind::For { shape, inner } => {
                    self.emit_for_prepare(id, &shape)?;
                    self.addrs[id] = self.here() as u32;
                    self.emit_for_test(id, &shape);
                    self.emit_chain(inner)?;
                }
            }

            match self.hir[id].succ {
                None => return Ok(()),
                Some(s) if !self.hir[id].stop => {
                    id = s;
                    continue;
                }
                Some(s) => {
                    self.emit_jump_to(s);
                    return Ok(());
                }
            }
        }
    }

    /// Walk a whole `if`/`elif`/`else` chain. Every node shares one exit
    /// block (`spec.md` §4.1); only `top_id`'s own `succ`/`stop` edge is
    /// left for the generic [`Self::emit_chain`] loop to consult once this
    /// returns.
    fn emit_if_chain(&mut self, top_id: BlockId) -> Result<(), LirError> {
        let exit = self.hir[top_id].succ.expect("if chain has a shared exit");
        let mut node = top_id;
        loop {
            self.emitted[node] = true;
            self.addrs[node] = self.here() as u32;
            let (cond, inner, chain_next, line) = match &self.hir[node].kind {
                BlockKind::If { cond, inner, chain_next } => (cond.clone(), *inner, *chain_next, self.hir[node].line),
                _ => unreachable!("emit_if_chain called on a non-If block"),
            };
            self.line_marker(line);
            let c = self.expr(&cond)?;
            let false_target = chain_next.unwrap_or(exit);
            self.emit_cond_jump(Opcode::JmpIfFalse, c, false_target);
            self.free_tmp(c);
            self.emit_chain(inner)?;

            match chain_next {
                Some(cn) if matches!(self.hir[cn].kind, BlockKind::If { .. }) => {
                    node = cn;
                }
                Some(cn) => {
                    self.emit_chain(cn)?;
                    break;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn stmt(&mut self, s: &HirStmt) -> Result<(), LirError> {
        self.line_marker(s.line);
        match &s.lhs {
            None => {
                let r = self.expr(&s.rhs)?;
                self.free_tmp(r);
            }
            Some(AstExpr::Term(AstTerm::Symbol(name))) => {
                let r = self.expr(&s.rhs)?;
                self.store_symbol(name, r);
                self.free_tmp(r);
            }
            Some(AstExpr::Dot(obj, name)) => {
                let o = self.expr(obj)?;
                let r = self.expr(&s.rhs)?;
                self.emit_op(Opcode::StoreDot);
                self.emit_u16(o);
                self.emit_cstr(name);
                self.emit_u16(r);
                self.free_tmp(r);
                self.free_tmp(o);
            }
            Some(AstExpr::Subscript(obj, idx)) => {
                let o = self.expr(obj)?;
                let i = self.expr(idx)?;
                let r = self.expr(&s.rhs)?;
                self.emit_op(Opcode::StoreArray);
                self.emit_u16(o);
                self.emit_u16(i);
                self.emit_u16(r);
                self.free_tmp(r);
                self.free_tmp(i);
                self.free_tmp(o);
            }
            Some(_) => return Err(LirError::InvalidAssignmentTarget { line: s.line }),
        }
        Ok(())
    }

    fn binary(&mut self, op: Opcode, a: &AstExpr, b: &AstExpr) -> Result<u16, LirError> {
        let ra = self.expr(a)?;
        let rb = self.expr(b)?;
        let dst = self.alloc_tmp();
        self.emit_op(op);
        self.emit_u16(dst);
        self.emit_u16(ra);
        self.emit_u16(rb);
        self.free_tmp(rb);
        self.free_tmp(ra);
        Ok(dst)
    }

    fn unary(&mut self, op: Opcode, a: &AstExpr) -> Result<u16, LirError> {
        let ra = self.expr(a)?;
        let dst = self.alloc_tmp();
        self.emit_op(op);
        self.emit_u16(dst);
        self.emit_u16(ra);
        self.free_tmp(ra);
        Ok(dst)
    }

    fn expr(&mut self, e: &AstExpr) -> Result<u16, LirError> {
        match e {
            AstExpr::Term(AstTerm::Symbol(name)) => Ok(self.load_symbol(name)),
            AstExpr::Term(AstTerm::Int(i)) => Ok(self.iconst(*i)),
            AstExpr::Term(AstTerm::Float(f)) => {
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::FConst);
                self.emit_u16(dst);
                self.emit_i32(f.to_bits() as i32);
                Ok(dst)
            }
            AstExpr::Term(AstTerm::String(s)) => {
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::SConst);
                self.emit_u16(dst);
                self.emit_cstr(s);
                Ok(dst)
            }
            AstExpr::Term(AstTerm::EmptyArray) => {
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::AConst);
                self.emit_u16(dst);
                Ok(dst)
            }
            AstExpr::Term(AstTerm::EmptyDict) => {
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::DConst);
                self.emit_u16(dst);
                Ok(dst)
            }
            AstExpr::Lt(a, b) => self.binary(Opcode::Lt, a, b),
            AstExpr::Lte(a, b) => self.binary(Opcode::Lte, a, b),
            AstExpr::Gt(a, b) => self.binary(Opcode::Gt, a, b),
            AstExpr::Gte(a, b) => self.binary(Opcode::Gte, a, b),
            AstExpr::Eq(a, b) => self.binary(Opcode::Eq, a, b),
            AstExpr::Neq(a, b) => self.binary(Opcode::Neq, a, b),
            AstExpr::Plus(a, b) => self.binary(Opcode::Add, a, b),
            AstExpr::Minus(a, b) => self.binary(Opcode::Sub, a, b),
            AstExpr::Mul(a, b) => self.binary(Opcode::Mul, a, b),
            AstExpr::Div(a, b) => self.binary(Opcode::Div, a, b),
            AstExpr::Mod(a, b) => self.binary(Opcode::Mod, a, b),
            AstExpr::And(a, b) => self.binary(Opcode::And, a, b),
            AstExpr::Or(a, b) => self.binary(Opcode::Or, a, b),
            AstExpr::Neg(a) => self.unary(Opcode::Neg, a),
            AstExpr::Subscript(obj, idx) => {
                let o = self.expr(obj)?;
                let i = self.expr(idx)?;
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::LoadArray);
                self.emit_u16(dst);
                self.emit_u16(o);
                self.emit_u16(i);
                self.free_tmp(i);
                self.free_tmp(o);
                Ok(dst)
            }
            AstExpr::Dot(obj, name) => {
                let o = self.expr(obj)?;
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::LoadDot);
                self.emit_u16(dst);
                self.emit_u16(o);
                self.emit_cstr(name);
                self.free_tmp(o);
                Ok(dst)
            }
            AstExpr::Call(callee, args) => {
                if args.len() > RT_ARG_MAX {
                    return Err(LirError::TooManyArgs { count: args.len() });
                }
                let c = self.expr(callee)?;
                let mut arg_regs = Vec::with_capacity(args.len());
                for a in args {
                    arg_regs.push(self.expr(a)?);
                }
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::Call);
                self.emit_u16(dst);
                self.emit_u16(c);
                self.code.push(args.len() as u8);
                for r in &arg_regs {
                    self.emit_u16(*r);
                }
                for r in arg_regs.into_iter().rev() {
                    self.free_tmp(r);
                }
                self.free_tmp(c);
                Ok(dst)
            }
            AstExpr::ThisCall(recv, method, args) => {
                if args.len() > RT_ARG_MAX {
                    return Err(LirError::TooManyArgs { count: args.len() });
                }
                let r = self.expr(recv)?;
                let mut arg_regs = Vec::with_capacity(args.len());
                for a in args {
                    arg_regs.push(self.expr(a)?);
                }
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::ThisCall);
                self.emit_u16(dst);
                self.emit_u16(r);
                self.emit_cstr(method);
                self.code.push(args.len() as u8);
                for reg in &arg_regs {
                    self.emit_u16(*reg);
                }
                for reg in arg_regs.into_iter().rev() {
                    self.free_tmp(reg);
                }
                self.free_tmp(r);
                Ok(dst)
            }
            AstExpr::Array(items) => {
                if items.len() > MAX_ARRAY_LITERAL {
                    return Err(LirError::ArrayLiteralTooLarge { count: items.len() });
                }
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::AConst);
                self.emit_u16(dst);
                for (i, item) in items.iter().enumerate() {
                    let idx = self.iconst(i as i32);
                    let v = self.expr(item)?;
                    self.emit_op(Opcode::StoreArray);
                    self.emit_u16(dst);
                    self.emit_u16(idx);
                    self.emit_u16(v);
                    self.free_tmp(v);
                    self.free_tmp(idx);
                }
                Ok(dst)
            }
            AstExpr::Dict(entries) => {
                if entries.len() > MAX_DICT_LITERAL {
                    return Err(LirError::DictLiteralTooLarge { count: entries.len() });
                }
                let dst = self.alloc_tmp();
                self.emit_op(Opcode::DConst);
                self.emit_u16(dst);
                for (key, val) in entries {
                    let kreg = self.alloc_tmp();
                    self.emit_op(Opcode::SConst);
                    self.emit_u16(kreg);
                    self.emit_cstr(key);
                    let v = self.expr(val)?;
                    self.emit_op(Opcode::StoreArray);
                    self.emit_u16(dst);
                    self.emit_u16(kreg);
                    self.emit_u16(v);
                    self.free_tmp(v);
                    self.free_tmp(kreg);
                }
                Ok(dst)
            }
            AstExpr::AnonFunc { .. } => {
                unreachable!("anonymous function literals are hoisted away before LIR building")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstFunc, AstStmt};
    use crate::hir;
    use crate::lir::opcode::Opcode;

    fn int(v: i32) -> AstExpr {
        AstExpr::Term(AstTerm::Int(v))
    }

    fn lir_for(body: Vec<AstStmt>) -> LirFunc {
        let f = AstFunc { name: "f".to_string(), params: vec![], file_name: "t.lg".to_string(), line: 1, body };
        let program = hir::build_program(vec![f]).unwrap();
        build_func(&program.funcs[0]).unwrap()
    }

    #[test]
    fn empty_function_returns_zero() {
        // prologue: IConst $return=0 ; epilogue: LoadSymbol $return -> Assign r0
        let lir = lir_for(vec![]);
        assert_eq!(lir.bytecode[0], Opcode::IConst as u8);
        assert!(lir.bytecode.contains(&(Opcode::Assign as u8)));
    }

    #[test]
    fn return_with_value_loads_and_assigns_to_register_zero() {
        let lir = lir_for(vec![AstStmt::Return { line: 1, value: Some(int(42)) }]);
        assert!(lir.bytecode.windows(3).any(|w| w[0] == Opcode::IConst as u8));
        // Final instruction of the epilogue is always Assign dst=0.
        let assign_pos = lir.bytecode.iter().rposition(|&b| b == Opcode::Assign as u8).unwrap();
        assert_eq!(&lir.bytecode[assign_pos + 1..assign_pos + 3], &0u16.to_be_bytes());
    }

    #[test]
    fn if_without_else_falls_through_to_shared_exit() {
        let lir = lir_for(vec![AstStmt::If {
            line: 1,
            cond: int(1),
            body: vec![AstStmt::Expr { line: 2, lhs: None, rhs: int(1) }],
            elifs: vec![],
            else_body: None,
        }]);
        assert!(lir.bytecode.contains(&(Opcode::JmpIfFalse as u8)));
    }

    #[test]
    fn while_loop_emits_a_conditional_exit_and_a_back_jump() {
        let lir = lir_for(vec![AstStmt::While { line: 1, cond: int(1), body: vec![] }]);
        assert!(lir.bytecode.contains(&(Opcode::JmpIfFalse as u8)));
        assert!(lir.bytecode.contains(&(Opcode::Jmp as u8)));
    }

    #[test]
    fn for_range_advances_the_counter_with_inc() {
        let lir = lir_for(vec![AstStmt::ForRange {
            line: 1,
            counter: "i".to_string(),
            start: int(0),
            stop: int(10),
            body: vec![],
        }]);
        assert!(lir.bytecode.contains(&(Opcode::Inc as u8)));
        assert!(lir.bytecode.contains(&(Opcode::EqI as u8)));
        assert!(lir.bytecode.contains(&(Opcode::JmpIfEq as u8)));
    }

    #[test]
    fn call_with_too_many_args_is_rejected() {
        let args: Vec<AstExpr> = (0..RT_ARG_MAX as i32 + 1).map(int).collect();
        let f = AstFunc {
            name: "f".to_string(),
            params: vec![],
            file_name: "t.lg".to_string(),
            line: 1,
            body: vec![AstStmt::Expr {
                line: 1,
                lhs: None,
                rhs: AstExpr::Call(Box::new(AstExpr::Term(AstTerm::Symbol("g".to_string()))), args),
            }],
        };
        let program = hir::build_program(vec![f]).unwrap();
        let err = build_func(&program.funcs[0]).unwrap_err();
        assert_eq!(err, LirError::TooManyArgs { count: RT_ARG_MAX + 1 });
    }

    #[test]
    fn thiscall_with_too_many_args_is_rejected() {
        let args: Vec<AstExpr> = (0..RT_ARG_MAX as i32 + 1).map(int).collect();
        let f = AstFunc {
            name: "f".to_string(),
            params: vec![],
            file_name: "t.lg".to_string(),
            line: 1,
            body: vec![AstStmt::Expr {
                line: 1,
                lhs: None,
                rhs: AstExpr::ThisCall(
                    Box::new(AstExpr::Term(AstTerm::Symbol("obj".to_string()))),
                    "method".to_string(),
                    args,
                ),
            }],
        };
        let program = hir::build_program(vec![f]).unwrap();
        let err = build_func(&program.funcs[0]).unwrap_err();
        assert_eq!(err, LirError::TooManyArgs { count: RT_ARG_MAX + 1 });
    }

    #[test]
    fn array_literal_over_the_limit_is_rejected() {
        let items: Vec<AstExpr> = (0..MAX_ARRAY_LITERAL as i32 + 1).map(int).collect();
        let f = AstFunc {
            name: "f".to_string(),
            params: vec![],
            file_name: "t.lg".to_string(),
            line: 1,
            body: vec![AstStmt::Expr { line: 1, lhs: None, rhs: AstExpr::Array(items) }],
        };
        let program = hir::build_program(vec![f]).unwrap();
        let err = build_func(&program.funcs[0]).unwrap_err();
        assert_eq!(err, LirError::ArrayLiteralTooLarge { count: MAX_ARRAY_LITERAL + 1 });
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let f = AstFunc {
            name: "f".to_string(),
            params: vec![],
            file_name: "t.lg".to_string(),
            line: 1,
            body: vec![AstStmt::Expr { line: 5, lhs: Some(int(1)), rhs: int(2) }],
        };
        let program = hir::build_program(vec![f]).unwrap();
        let err = build_func(&program.funcs[0]).unwrap_err();
        assert_eq!(err, LirError::InvalidAssignmentTarget { line: 5 });
    }

    #[test]
    fn tmpvar_size_tracks_the_deepest_simultaneous_allocation() {
        // `1 + 2 * 3` needs three live temporaries at once (a, b, and the
        // inner product's destination) at its deepest point.
        let lir = lir_for(vec![AstStmt::Expr {
            line: 1,
            lhs: None,
            rhs: AstExpr::Plus(Box::new(int(1)), Box::new(AstExpr::Mul(Box::new(int(2)), Box::new(int(3))))),
        }]);
        assert!(lir.tmpvar_size >= 3);
    }
}
