//! slotvm - a slot/scope runtime for a list-only Lisp
//!
//! Every composite value in this language is a *list*, and every list is at the
//! same time a lexical scope, a block of code and a data container. A program is
//! compiled into a tree of such lists (the [`scope::ScopeTree`]), where each list
//! is a chunk of [`ast::Slot`]s: inert values, bare variable names, or opcodes
//! followed by their operand slots.
//!
//! ```text
//! (set x 0)
//! (set max 3)
//! (jump loop)
//! (print "Done!")
//! (scope loop
//!   (println x)
//!   (set x (add x 1))
//!   (if (< x max) (jump loop)))
//! ```
//!
//! ## Forms
//!
//! The same tree has two wire forms:
//! - `svmp`: parenthesised text, parsed with macro expansion and re-emitted canonically
//! - `svmb`: a compact `[tag][payload]` record stream
//!
//! Scope IDs are never stored in either form. They are recomputed on every load
//! by numbering lists in depth-first pre-order, so the root is always scope 0
//! and a parent always has a lower ID than its descendants.
//!
//! ## Execution
//!
//! The [`evaluator::Engine`] walks the slots of the current scope left to right.
//! Names resolve by searching the current scope and then each lexical ancestor,
//! never siblings or children. Jumps always land at slot 0 of their target scope;
//! a scope that jumps back to itself is the loop idiom.
//!
//! ## Modules
//!
//! - `ast`: values, list references and slots
//! - `builtinops`: opcode registry, operand signatures and builtin math/syscalls
//! - `intooperation`: typed adapters for registering Rust functions as syscalls
//! - `svmp` / `macros` / `scope`: text parsing, macro expansion, tree building
//! - `svmb`: binary encoding and decoding
//! - `evaluator`: the execution engine
//! - `heap`, `host`, `config`: runtime allocation, I/O seam and limits

use std::fmt;

use crate::ast::ScopeId;

/// Maximum nesting depth accepted by the text parser and the binary decoder.
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum depth of nested macro expansions before expansion is rejected.
pub const MAX_MACRO_DEPTH: usize = 32;

/// Maximum number of simultaneously active scope frames in the engine.
pub const MAX_FRAME_DEPTH: usize = 256;

/// Maximum number of heap slots live at once, counting one extra per list.
pub const MAX_HEAP_SLOTS: usize = 1 << 24;

/// Maximum number of list elements written by a single `print`.
pub const MAX_RENDER_ELEMENTS: usize = 1 << 16;

/// Categorizes the different kinds of text parsing errors.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// A closing parenthesis or other stray content with no form to belong to
    TrailingContent,
}

/// A structured error describing where and why text parsing failed.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// 1-based line of the failure
    pub line: usize,
    /// 1-based column of the failure
    pub column: usize,
    /// Context snippet from the input starting near the failure (max 40 chars)
    pub context: Option<String>,
}

impl ParseError {
    /// Create a ParseError located at a byte offset of `input`
    pub fn at_offset(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 40;

        let offset = offset.min(input.len());
        let before = input.get(..offset).unwrap_or(input);
        let line = before.matches('\n').count() + 1;
        let column = before
            .rsplit('\n')
            .next()
            .map_or(0, |tail| tail.chars().count())
            + 1;

        let context: String = input
            .get(offset..)
            .unwrap_or("")
            .chars()
            .take(MAX_CONTEXT)
            .collect();
        let context = context.replace('\n', "\\n").replace('\r', "");

        ParseError {
            kind,
            message: message.into(),
            line,
            column,
            context: (!context.is_empty()).then_some(context),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.column)?;
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Runtime error kinds raised while a program executes.
///
/// The first four kinds are recoverable: a `try` scope can catch them. The rest
/// always terminate the program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("IoError: {0}")]
    Io(String),
    #[error("MathError: {0}")]
    Math(String),
    #[error("IndexError: index {index} out of range for list of length {len}")]
    Index { index: f64, len: usize },
    #[error("SyscallError: {0}")]
    Syscall(String),

    #[error("UnboundNameError: '{0}' is not bound in this scope or any enclosing scope")]
    UnboundName(String),
    #[error("TypeMismatchError: {0}")]
    TypeMismatch(String),
    #[error("InvalidJumpTargetError: no scope with id {0}")]
    InvalidJumpTarget(String),
    #[error("UseAfterFreeError: {0}")]
    UseAfterFree(String),
    #[error("LimitExceeded: {0}")]
    LimitExceeded(String),
}

impl Fault {
    /// Whether a `try` handler may intercept this fault
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Fault::Io(_) | Fault::Math(_) | Fault::Index { .. } | Fault::Syscall(_)
        )
    }

    /// Build a type mismatch for an operand that held the wrong kind of value
    pub(crate) fn expected(what: &str, found: &ast::Value) -> Self {
        Fault::TypeMismatch(format!("expected {what}, found {}", found.kind_name()))
    }
}

/// Error types for building and running programs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("ParseError: {0}")]
    Parse(ParseError),
    #[error("CodecError at byte {offset}: {message}")]
    Codec { offset: usize, message: String },
    #[error("MacroExpansionError: {0}")]
    MacroExpansion(String),
    #[error("MalformedOpcodeError: {0}")]
    MalformedOpcode(String),
    #[error("{fault} (scope {scope}, slot {slot})")]
    Runtime {
        scope: ScopeId,
        slot: usize,
        fault: Fault,
    },
}

impl Error {
    /// The runtime fault carried by this error, if it was raised during execution
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Runtime { fault, .. } => Some(fault),
            _ => None,
        }
    }

    /// True for errors detected before any slot is executed
    pub fn is_build_error(&self) -> bool {
        !matches!(self, Error::Runtime { .. })
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}

pub mod ast;
pub mod builtinops;
pub mod config;
pub mod evaluator;
pub mod heap;
pub mod host;
pub mod intooperation;
pub mod macros;
pub mod scope;
pub mod svmb;
pub mod svmp;

pub use config::RuntimeConfig;
pub use evaluator::{Engine, Outcome};
pub use host::{CaptureHost, Host, StdHost};
pub use scope::ScopeTree;
pub use svmb::{decode_binary, encode_binary};
pub use svmp::{compile_text, encode_text};
