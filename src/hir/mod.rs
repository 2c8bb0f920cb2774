//! High-level IR: a block-structured control-flow graph lowered from
//! [`crate::ast`], consumed by [`crate::lir`].
//!
//! `spec.md` §4.1 models a function body as a graph of typed blocks
//! (`Func`/`Basic`/`If`/`For`/`While`/`End`) rather than a plain statement
//! list, so that `continue`/`break`/`return` become graph edges instead of
//! statements, and so anonymous function literals can be hoisted out and
//! compiled independently. Mirrors `hir.h`'s `struct hir_block` union, with
//! the "cyclic graph" problem (loop bodies point back to their own header)
//! solved the idiomatic Rust way: an arena (`Vec<Block>`) addressed by
//! index instead of raw pointers.

mod build;

pub use build::{build_program, HirError};

use crate::ast::AstExpr;

/// Index into a [`HirProgram`]'s block arena.
pub type BlockId = usize;

/// One of the three shapes a `for` loop can take (`spec.md` §4.1): a ranged
/// counter, dictionary key/value iteration, or array/dict value iteration.
/// `hir.h`'s `for_` variant keeps all three in one record; we do the same.
#[derive(Debug, Clone)]
pub enum ForShape {
    Range { counter: String, start: AstExpr, stop: AstExpr },
    KeyValue { key: String, value: String, collection: AstExpr },
    Value { value: String, collection: AstExpr },
}

/// A lowered statement: an optional assignment target plus an expression.
/// `return`/`break`/`continue` are not statements here — they are rewritten
/// into a trailing assignment (for `return`, to the `$return` pseudo-local)
/// plus the block's `succ`/`stop` edge.
#[derive(Debug, Clone)]
pub struct HirStmt {
    pub line: i32,
    pub lhs: Option<AstExpr>,
    pub rhs: AstExpr,
}

/// The payload of a [`Block`], discriminated by what kind of control-flow
/// node it is.
#[derive(Debug, Clone)]
pub enum BlockKind {
    /// A function's entry block. `inner` is the first block of its body.
    Func {
        name: String,
        param_names: Vec<String>,
        file_name: String,
        inner: BlockId,
    },
    /// A straight-line run of statements.
    Basic { stmts: Vec<HirStmt> },
    /// `if cond { inner } else { chain_next }`, where `chain_next` is either
    /// another `If` block (an `elif`), a plain `Basic` block (the final
    /// `else`), or `None` (falls through directly to the shared exit).
    If {
        cond: AstExpr,
        inner: BlockId,
        chain_next: Option<BlockId>,
    },
    /// A loop header: evaluating the induction/iteration test lives at this
    /// block's own address; `inner` is the loop body.
    For { shape: ForShape, inner: BlockId },
    While { cond: AstExpr, inner: BlockId },
    /// A function's exit block. No statements of its own; the LIR builder
    /// emits the `$return`-to-`tmpvar[0]` epilogue here.
    End,
}

/// One node of the block graph.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub line: i32,
    pub parent: Option<BlockId>,
    /// Where control goes after this block finishes (ignoring any inner
    /// sub-graph), or `None` for an `End` block.
    pub succ: Option<BlockId>,
    /// Whether reaching `succ` requires an explicit jump instruction,
    /// rather than `succ` being the next block the LIR builder would visit
    /// anyway. Back-edges (loop re-entry), `break`, `continue`, and
    /// `return` are always `stop = true`; a block's natural fallthrough
    /// into the next block physically scheduled after it is `stop = false`.
    pub stop: bool,
    /// Filled in by the LIR builder once this block's first instruction is
    /// emitted; `u32::MAX` until then.
    pub addr: u32,
}

/// One function lowered to a block graph, plus any anonymous functions
/// hoisted out of it (`spec.md` §4.1: "anonymous function literals are
/// hoisted to top-level functions named `$anon.<file>.<n>`").
pub struct HirFunc {
    pub name: String,
    pub file_name: String,
    pub param_names: Vec<String>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub end: BlockId,
}

/// The result of lowering one translation unit: the functions named in the
/// source, in declaration order, followed by any hoisted anonymous
/// functions, in the order their literals were encountered.
pub struct HirProgram {
    pub funcs: Vec<HirFunc>,
}
