//! Lowers a list of top-level [`crate::ast::AstFunc`] definitions into a
//! [`super::HirProgram`].
//!
//! Two things happen during lowering that a plain statement-by-statement
//! walk would not do (`spec.md` §4.1):
//!
//! - `return`/`break`/`continue` are rewritten into block-graph edges
//!   (`succ`/`stop`) instead of being kept as statements.
//! - Every anonymous function literal is hoisted into its own top-level
//!   function named `$anon.<file>.<n>` and the literal's original position
//!   is replaced with a plain symbol reference to that name, matching
//!   `hir_term`'s lack of an anonymous-function case — by the time an
//!   expression reaches HIR, a function value is always named.

use super::{Block, BlockKind, BlockId, ForShape, HirFunc, HirProgram, HirStmt};
use crate::ast::{AstExpr, AstFunc, AstStmt};
use std::collections::VecDeque;

/// Soft cap carried over from `hir.h`'s fixed-size `HIR_PARAM_SIZE` array;
/// our parameter list is a `Vec`, so this is a validation limit rather than
/// a storage limit.
pub const MAX_PARAMS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HirError {
    TooManyParams { func: String, count: usize },
    BreakOutsideLoop { line: i32 },
    ContinueOutsideLoop { line: i32 },
}

impl std::fmt::Display for HirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HirError::TooManyParams { func, count } => {
                write!(f, "function '{func}' has {count} parameters, more than {MAX_PARAMS}")
            }
            HirError::BreakOutsideLoop { line } => write!(f, "line {line}: 'break' outside a loop"),
            HirError::ContinueOutsideLoop { line } => write!(f, "line {line}: 'continue' outside a loop"),
        }
    }
}

impl std::error::Error for HirError {}

/// Lower every function in a translation unit, hoisting anonymous function
/// literals as they're discovered.
pub fn build_program(top_level: Vec<AstFunc>) -> Result<HirProgram, HirError> {
    let mut queue: VecDeque<AstFunc> = top_level.into();
    let mut anon_counter = 0usize;
    let mut funcs = Vec::new();

    while let Some(f) = queue.pop_front() {
        if f.params.len() > MAX_PARAMS {
            return Err(HirError::TooManyParams { func: f.name, count: f.params.len() });
        }
        let hir_func = lower_func(f, &mut anon_counter, &mut queue)?;
        funcs.push(hir_func);
    }
    Ok(HirProgram { funcs })
}

fn lower_func(f: AstFunc, anon_counter: &mut usize, queue: &mut VecDeque<AstFunc>) -> Result<HirFunc, HirError> {
    let mut body = f.body;
    hoist_anon_funcs_in_stmts(&mut body, &f.file_name, anon_counter, queue);

    let mut blocks = Vec::new();
    let end = new_block(&mut blocks, BlockKind::End, f.line);
    let func_id = new_block(
        &mut blocks,
        BlockKind::Func {
            name: f.name.clone(),
            param_names: f.params.clone(),
            file_name: f.file_name.clone(),
            inner: end,
        },
        f.line,
    );

    let mut lowerer = StmtLowerer { blocks: &mut blocks, loop_stack: Vec::new() };
    let entry = lowerer.lower_stmts(&body, end, false)?;
    if let BlockKind::Func { inner, .. } = &mut blocks[func_id].kind {
        *inner = entry;
    }

    Ok(HirFunc { name: f.name, file_name: f.file_name, param_names: f.params, blocks, entry: func_id, end })
}

fn new_block(blocks: &mut Vec<Block>, kind: BlockKind, line: i32) -> BlockId {
    let id = blocks.len();
    blocks.push(Block { kind, line, parent: None, succ: None, stop: false, addr: u32::MAX });
    id
}

struct LoopCtx {
    header: BlockId,
    exit: BlockId,
}

struct StmtLowerer<'b> {
    blocks: &'b mut Vec<Block>,
    loop_stack: Vec<LoopCtx>,
}

impl StmtLowerer<'_> {
    fn new_block(&mut self, kind: BlockKind, line: i32) -> BlockId {
        new_block(self.blocks, kind, line)
    }

    fn set_succ(&mut self, id: BlockId, succ: BlockId, stop: bool) {
        self.blocks[id].succ = Some(succ);
        self.blocks[id].stop = stop;
    }

    fn push_stmt(&mut self, block: BlockId, line: i32, lhs: Option<AstExpr>, rhs: AstExpr) {
        if let BlockKind::Basic { stmts } = &mut self.blocks[block].kind {
            stmts.push(HirStmt { line, lhs, rhs });
        }
    }

    /// Lower a statement list, returning the id of its first block. The
    /// list's fallthrough edge (reached if every statement runs without an
    /// early `return`/`break`/`continue`) targets `natural_succ`; that one
    /// edge is marked `stop = force_stop` — the loop/if-chain callers above
    /// decide whether something else is scheduled to be emitted physically
    /// between this block and `natural_succ`.
    fn lower_stmts(&mut self, stmts: &[AstStmt], natural_succ: BlockId, force_stop: bool) -> Result<BlockId, HirError> {
        let first_line = stmts.first().map(stmt_line).unwrap_or(0);
        let first = self.new_block(BlockKind::Basic { stmts: Vec::new() }, first_line);
        let mut current = first;
        let mut i = 0;

        while i < stmts.len() {
            match &stmts[i] {
                AstStmt::Return { line, value } => {
                    self.push_stmt(current, *line, Some(return_target()), value.clone().unwrap_or(zero_term()));
                    let end = self.end_block();
                    self.set_succ(current, end, true);
                    return Ok(first);
                }
                AstStmt::Break { line } => {
                    let exit = self.loop_stack.last().ok_or(HirError::BreakOutsideLoop { line: *line })?.exit;
                    self.set_succ(current, exit, true);
                    return Ok(first);
                }
                AstStmt::Continue { line } => {
                    let header = self.loop_stack.last().ok_or(HirError::ContinueOutsideLoop { line: *line })?.header;
                    self.set_succ(current, header, true);
                    return Ok(first);
                }
                AstStmt::If { line, cond, body, elifs, else_body } => {
                    let exit = self.new_block(BlockKind::Basic { stmts: Vec::new() }, *line);
                    let if_block = self.lower_if_chain(*line, cond.clone(), body, elifs, else_body.as_deref(), exit)?;
                    self.set_succ(current, if_block, false);
                    current = exit;
                    i += 1;
                }
                AstStmt::While { line, cond, body } => {
                    let header = self.new_block(BlockKind::While { cond: cond.clone(), inner: 0 }, *line);
                    let exit = self.new_block(BlockKind::Basic { stmts: Vec::new() }, *line);
                    self.loop_stack.push(LoopCtx { header, exit });
                    let inner = self.lower_stmts(body, header, true);
                    self.loop_stack.pop();
                    let inner = inner?;
                    if let BlockKind::While { inner: slot, .. } = &mut self.blocks[header].kind {
                        *slot = inner;
                    }
                    self.set_succ(header, exit, false);
                    self.set_succ(current, header, false);
                    current = exit;
                    i += 1;
                }
                AstStmt::ForRange { line, counter, start, stop, body } => {
                    let shape = ForShape::Range { counter: counter.clone(), start: start.clone(), stop: stop.clone() };
                    current = self.lower_for(*line, shape, body, current)?;
                    i += 1;
                }
                AstStmt::ForKeyValue { line, key, value, collection, body } => {
                    let shape = ForShape::KeyValue { key: key.clone(), value: value.clone(), collection: collection.clone() };
                    current = self.lower_for(*line, shape, body, current)?;
                    i += 1;
                }
                AstStmt::ForValue { line, value, collection, body } => {
                    let shape = ForShape::Value { value: value.clone(), collection: collection.clone() };
                    current = self.lower_for(*line, shape, body, current)?;
                    i += 1;
                }
                AstStmt::Expr { line, lhs, rhs } => {
                    self.push_stmt(current, *line, lhs.clone(), rhs.clone());
                    i += 1;
                }
            }
        }

        self.set_succ(current, natural_succ, force_stop);
        Ok(first)
    }

    fn lower_for(&mut self, line: i32, shape: ForShape, body: &[AstStmt], current: BlockId) -> Result<BlockId, HirError> {
        let header = self.new_block(BlockKind::For { shape, inner: 0 }, line);
        let exit = self.new_block(BlockKind::Basic { stmts: Vec::new() }, line);
        self.loop_stack.push(LoopCtx { header, exit });
        let inner = self.lower_stmts(body, header, true);
        self.loop_stack.pop();
        let inner = inner?;
        if let BlockKind::For { inner: slot, .. } = &mut self.blocks[header].kind {
            *slot = inner;
        }
        self.set_succ(header, exit, false);
        self.set_succ(current, header, false);
        Ok(exit)
    }

    /// Lower one `if`/`elif`/`else` chain, sharing one exit block. Every
    /// branch body's own fallthrough edge is forced `stop = true` (another
    /// branch is always scheduled physically right after it), and every
    /// node in the chain shares the same `(exit, stop = false)` edge —
    /// only the outermost node's edge is ever consulted by the LIR
    /// builder's generic traversal; nested `elif`/`else` nodes are walked
    /// by the `If`-specific codegen directly (`crate::lir`).
    fn lower_if_chain(
        &mut self,
        line: i32,
        cond: AstExpr,
        body: &[AstStmt],
        elifs: &[(AstExpr, Vec<AstStmt>)],
        else_body: Option<&[AstStmt]>,
        exit: BlockId,
    ) -> Result<BlockId, HirError> {
        let if_block = self.new_block(BlockKind::If { cond, inner: 0, chain_next: None }, line);
        let inner = self.lower_stmts(body, exit, true)?;
        if let BlockKind::If { inner: slot, .. } = &mut self.blocks[if_block].kind {
            *slot = inner;
        }

        let chain_next = if let Some(((next_cond, next_body), rest)) = elifs.split_first() {
            Some(self.lower_if_chain(line, next_cond.clone(), next_body, rest, else_body, exit)?)
        } else if let Some(else_stmts) = else_body {
            Some(self.lower_stmts(else_stmts, exit, true)?)
        } else {
            None
        };
        if let BlockKind::If { chain_next: slot, .. } = &mut self.blocks[if_block].kind {
            *slot = chain_next;
        }
        self.set_succ(if_block, exit, false);
        Ok(if_block)
    }

    fn end_block(&self) -> BlockId {
        // The End block is always index 0 within a function's arena; see
        // `lower_func`, which allocates it before anything else.
        0
    }
}

fn stmt_line(s: &AstStmt) -> i32 {
    match s {
        AstStmt::Expr { line, .. }
        | AstStmt::If { line, .. }
        | AstStmt::ForRange { line, .. }
        | AstStmt::ForKeyValue { line, .. }
        | AstStmt::ForValue { line, .. }
        | AstStmt::While { line, .. }
        | AstStmt::Return { line, .. }
        | AstStmt::Break { line }
        | AstStmt::Continue { line } => *line,
    }
}

/// The pseudo-symbol every `return` is rewritten to assign to (`spec.md`
/// §4.1/§4.2): a uniform "result lives in a named local" contract so the
/// function epilogue can load it with an ordinary `LOADSYMBOL`.
fn return_target() -> AstExpr {
    AstExpr::Term(crate::ast::AstTerm::Symbol("$return".to_string()))
}

fn zero_term() -> AstExpr {
    AstExpr::Term(crate::ast::AstTerm::Int(0))
}

/// Recursively replace every [`AstExpr::AnonFunc`] with a reference to a
/// freshly hoisted top-level function, pushing that function onto `queue`
/// so `build_program`'s main loop lowers it in turn.
fn hoist_anon_funcs_in_stmts(stmts: &mut [AstStmt], file: &str, counter: &mut usize, queue: &mut VecDeque<AstFunc>) {
    for s in stmts {
        match s {
            AstStmt::Expr { lhs, rhs, .. } => {
                if let Some(lhs) = lhs {
                    hoist_anon_funcs_in_expr(lhs, file, counter, queue);
                }
                hoist_anon_funcs_in_expr(rhs, file, counter, queue);
            }
            AstStmt::If { cond, body, elifs, else_body, .. } => {
                hoist_anon_funcs_in_expr(cond, file, counter, queue);
                hoist_anon_funcs_in_stmts(body, file, counter, queue);
                for (c, b) in elifs {
                    hoist_anon_funcs_in_expr(c, file, counter, queue);
                    hoist_anon_funcs_in_stmts(b, file, counter, queue);
                }
                if let Some(b) = else_body {
                    hoist_anon_funcs_in_stmts(b, file, counter, queue);
                }
            }
            AstStmt::ForRange { start, stop, body, .. } => {
                hoist_anon_funcs_in_expr(start, file, counter, queue);
                hoist_anon_funcs_in_expr(stop, file, counter, queue);
                hoist_anon_funcs_in_stmts(body, file, counter, queue);
            }
            AstStmt::ForKeyValue { collection, body, .. } | AstStmt::ForValue { collection, body, .. } => {
                hoist_anon_funcs_in_expr(collection, file, counter, queue);
                hoist_anon_funcs_in_stmts(body, file, counter, queue);
            }
            AstStmt::While { cond, body, .. } => {
                hoist_anon_funcs_in_expr(cond, file, counter, queue);
                hoist_anon_funcs_in_stmts(body, file, counter, queue);
            }
            AstStmt::Return { value: Some(v), .. } => hoist_anon_funcs_in_expr(v, file, counter, queue),
            AstStmt::Return { value: None, .. } | AstStmt::Break { .. } | AstStmt::Continue { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstTerm;

    fn func(name: &str, params: &[&str], body: Vec<AstStmt>) -> AstFunc {
        AstFunc {
            name: name.to_string(),
            params: params.iter().map(|s| s.to_string()).collect(),
            file_name: "test.lg".to_string(),
            line: 1,
            body,
        }
    }

    fn sym(name: &str) -> AstExpr {
        AstExpr::Term(AstTerm::Symbol(name.to_string()))
    }

    fn int(v: i32) -> AstExpr {
        AstExpr::Term(AstTerm::Int(v))
    }

    #[test]
    fn too_many_params_is_rejected() {
        let params: Vec<String> = (0..MAX_PARAMS + 1).map(|i| format!("p{i}")).collect();
        let f = AstFunc { name: "f".to_string(), params, file_name: "t.lg".to_string(), line: 1, body: vec![] };
        let err = build_program(vec![f]).unwrap_err();
        assert_eq!(err, HirError::TooManyParams { func: "f".to_string(), count: MAX_PARAMS + 1 });
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let f = func("f", &[], vec![AstStmt::Break { line: 3 }]);
        let err = build_program(vec![f]).unwrap_err();
        assert_eq!(err, HirError::BreakOutsideLoop { line: 3 });
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        let f = func("f", &[], vec![AstStmt::Continue { line: 4 }]);
        let err = build_program(vec![f]).unwrap_err();
        assert_eq!(err, HirError::ContinueOutsideLoop { line: 4 });
    }

    #[test]
    fn break_inside_while_resolves_to_loop_exit() {
        let f = func(
            "f",
            &[],
            vec![AstStmt::While { line: 1, cond: int(1), body: vec![AstStmt::Break { line: 2 }] }],
        );
        let program = build_program(vec![f]).unwrap();
        assert_eq!(program.funcs.len(), 1);
    }

    #[test]
    fn return_is_rewritten_to_dollar_return_assignment() {
        let f = func("f", &[], vec![AstStmt::Return { line: 1, value: Some(int(42)) }]);
        let program = build_program(vec![f]).unwrap();
        let hir = &program.funcs[0];
        let entry = &hir.blocks[hir.entry];
        let BlockKind::Func { inner, .. } = &entry.kind else { panic!("expected Func block") };
        let BlockKind::Basic { stmts } = &hir.blocks[*inner].kind else { panic!("expected Basic block") };
        assert_eq!(stmts.len(), 1);
        match &stmts[0].lhs {
            Some(AstExpr::Term(AstTerm::Symbol(name))) => assert_eq!(name, "$return"),
            other => panic!("expected a $return assignment, got {other:?}"),
        }
    }

    #[test]
    fn anonymous_function_literal_is_hoisted_as_a_top_level_function() {
        let f = func(
            "f",
            &[],
            vec![AstStmt::Expr {
                line: 1,
                lhs: Some(sym("g")),
                rhs: AstExpr::AnonFunc { params: vec!["x".to_string()], body: vec![] },
            }],
        );
        let program = build_program(vec![f]).unwrap();
        assert_eq!(program.funcs.len(), 2);
        assert_eq!(program.funcs[0].name, "f");
        assert!(program.funcs[1].name.starts_with("$anon.test.lg."));
    }

    #[test]
    fn if_chain_shares_one_exit_block() {
        let f = func(
            "f",
            &[],
            vec![AstStmt::If {
                line: 1,
                cond: int(1),
                body: vec![],
                elifs: vec![(int(0), vec![])],
                else_body: Some(vec![]),
            }],
        );
        let program = build_program(vec![f]).unwrap();
        let hir = &program.funcs[0];
        let BlockKind::Func { inner, .. } = &hir.blocks[hir.entry].kind else { panic!() };
        let BlockKind::If { chain_next, .. } = &hir.blocks[*inner].kind else { panic!("expected If block") };
        assert!(chain_next.is_some());
    }
}

fn hoist_anon_funcs_in_expr(expr: &mut AstExpr, file: &str, counter: &mut usize, queue: &mut VecDeque<AstFunc>) {
    match expr {
        AstExpr::Term(_) => {}
        AstExpr::Lt(a, b)
        | AstExpr::Lte(a, b)
        | AstExpr::Gt(a, b)
        | AstExpr::Gte(a, b)
        | AstExpr::Eq(a, b)
        | AstExpr::Neq(a, b)
        | AstExpr::Plus(a, b)
        | AstExpr::Minus(a, b)
        | AstExpr::Mul(a, b)
        | AstExpr::Div(a, b)
        | AstExpr::Mod(a, b)
        | AstExpr::And(a, b)
        | AstExpr::Or(a, b)
        | AstExpr::Subscript(a, b) => {
            hoist_anon_funcs_in_expr(a, file, counter, queue);
            hoist_anon_funcs_in_expr(b, file, counter, queue);
        }
        AstExpr::Neg(a) | AstExpr::Dot(a, _) => hoist_anon_funcs_in_expr(a, file, counter, queue),
        AstExpr::Call(callee, args) => {
            hoist_anon_funcs_in_expr(callee, file, counter, queue);
            for a in args {
                hoist_anon_funcs_in_expr(a, file, counter, queue);
            }
        }
        AstExpr::ThisCall(recv, _, args) => {
            hoist_anon_funcs_in_expr(recv, file, counter, queue);
            for a in args {
                hoist_anon_funcs_in_expr(a, file, counter, queue);
            }
        }
        AstExpr::Array(items) => {
            for e in items {
                hoist_anon_funcs_in_expr(e, file, counter, queue);
            }
        }
        AstExpr::Dict(entries) => {
            for (_, v) in entries {
                hoist_anon_funcs_in_expr(v, file, counter, queue);
            }
        }
        AstExpr::AnonFunc { params, body } => {
            let name = format!("$anon.{file}.{counter}");
            *counter += 1;
            let mut hoisted_body = std::mem::take(body);
            hoist_anon_funcs_in_stmts(&mut hoisted_body, file, counter, queue);
            queue.push_back(AstFunc {
                name: name.clone(),
                params: std::mem::take(params),
                file_name: file.to_string(),
                line: 0,
                body: hoisted_body,
            });
            *expr = AstExpr::Term(crate::ast::AstTerm::Symbol(name));
        }
    }
}
