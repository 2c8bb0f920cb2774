//! Error types shared by every compilation and runtime stage.
//!
//! `spec.md` §7 groups failures into compile-time, load-time, and run-time
//! kinds, all surfaced as a file name, a line number, and a message. We keep
//! that triple but give each kind its own `thiserror` variant instead of the
//! original's fixed-size `char[1024]`/`char[4096]` buffers.

use std::fmt;

/// Where in the pipeline an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// HIR or LIR builder.
    Compile,
    /// Bytecode-file loading or function registration.
    Load,
    /// Interpreter or JIT execution.
    Runtime,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStage::Compile => write!(f, "compile"),
            ErrorStage::Load => write!(f, "load"),
            ErrorStage::Runtime => write!(f, "runtime"),
        }
    }
}

/// A file/line/message triple, matching `rt_env`'s error state (`spec.md` §3
/// invariant 6: meaningful only after a failed operation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLocation {
    pub file_name: String,
    pub line: i32,
    pub message: String,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file_name, self.line, self.message)
    }
}

/// The unified error type for the whole pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LinguineError {
    #[error("{0}")]
    Compile(ErrorLocation),

    #[error("{0}")]
    Load(ErrorLocation),

    #[error("{0}")]
    Runtime(ErrorLocation),

    /// Failures with no meaningful source location (e.g. malformed bytecode
    /// file header, before any function/line context exists).
    #[error("{0}")]
    Load2(String),
}

impl LinguineError {
    pub fn compile(file_name: impl Into<String>, line: i32, message: impl Into<String>) -> Self {
        LinguineError::Compile(ErrorLocation {
            file_name: file_name.into(),
            line,
            message: message.into(),
        })
    }

    pub fn runtime(file_name: impl Into<String>, line: i32, message: impl Into<String>) -> Self {
        LinguineError::Runtime(ErrorLocation {
            file_name: file_name.into(),
            line,
            message: message.into(),
        })
    }

    pub fn load(message: impl Into<String>) -> Self {
        LinguineError::Load2(message.into())
    }

    /// The stage this error belongs to (`spec.md` §7).
    pub fn stage(&self) -> ErrorStage {
        match self {
            LinguineError::Compile(_) => ErrorStage::Compile,
            LinguineError::Load(_) | LinguineError::Load2(_) => ErrorStage::Load,
            LinguineError::Runtime(_) => ErrorStage::Runtime,
        }
    }

    /// The message text alone, as `rt_get_error_message` exposes it.
    pub fn message(&self) -> &str {
        match self {
            LinguineError::Compile(loc) | LinguineError::Load(loc) | LinguineError::Runtime(loc) => {
                &loc.message
            }
            LinguineError::Load2(msg) => msg,
        }
    }
}

pub type LinguineResult<T> = Result<T, LinguineError>;

/// Render a compile-time diagnostic the way the host would print it, using
/// `codespan-reporting` for consistent formatting across compile errors.
pub fn render_diagnostic(loc: &ErrorLocation) -> String {
    use codespan_reporting::diagnostic::{Diagnostic, Label};
    use codespan_reporting::files::SimpleFiles;
    use codespan_reporting::term::{self, Config};
    use codespan_reporting::term::termcolor::{Buffer, ColorChoice};

    let mut files = SimpleFiles::new();
    let file_id = files.add(loc.file_name.clone(), String::new());
    let diagnostic = Diagnostic::error()
        .with_message(loc.message.clone())
        .with_labels(vec![Label::primary(file_id, 0..0).with_message(format!("line {}", loc.line))]);

    let mut buffer = Buffer::no_color();
    let _ = ColorChoice::Auto;
    let config = Config::default();
    let _ = term::emit(&mut buffer, &config, &files, &diagnostic);
    String::from_utf8_lossy(buffer.as_slice()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_and_runtime_errors_report_their_own_stage() {
        let c = LinguineError::compile("a.ln", 1, "bad token");
        assert_eq!(c.stage(), ErrorStage::Compile);
        let r = LinguineError::runtime("a.ln", 1, "division by zero");
        assert_eq!(r.stage(), ErrorStage::Runtime);
    }

    #[test]
    fn load_errors_have_no_location_but_still_carry_a_message() {
        let e = LinguineError::load("bad magic number");
        assert_eq!(e.stage(), ErrorStage::Load);
        assert_eq!(e.message(), "bad magic number");
    }

    #[test]
    fn message_extracts_just_the_text_without_file_and_line() {
        let e = LinguineError::runtime("a.ln", 42, "oops");
        assert_eq!(e.message(), "oops");
        assert_eq!(e.to_string(), "a.ln:42: oops");
    }

    #[test]
    fn render_diagnostic_includes_the_file_name_and_message() {
        let loc = ErrorLocation { file_name: "a.ln".into(), line: 7, message: "unexpected eof".into() };
        let rendered = render_diagnostic(&loc);
        assert!(rendered.contains("a.ln"));
        assert!(rendered.contains("unexpected eof"));
        assert!(rendered.contains('7'));
    }
}
