//! Core data types of the runtime: values, list references and slots, plus the
//! [`Sexpr`] source form produced by the text parser. A list position is always
//! a [`Slot`]; slots are fixed-size (a tag plus pointer-sized payload) so that
//! walking a scope is O(1) per step whatever the payload kind.
//!
//! Helper constructors such as [`val`] and [`name`] keep tests and embedders
//! terse, and `From` conversions let Rust literals become values directly.

use std::fmt;
use std::rc::Rc;

use crate::Fault;
use crate::builtinops::Opcode;

/// Stable identifier of a compile-time list/scope, assigned in pre-order
pub type ScopeId = usize;

/// Identifier of a runtime `alloc`'d list; never reused after `free`
pub type HeapId = usize;

/// Where the slots behind a [`ListRef`] live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListHandle {
    /// A list built by the scope-tree builder (also a lexical scope)
    Scope(ScopeId),
    /// A list created at run time by `alloc`
    Heap(HeapId),
}

/// A reference to a list plus its slot count when the reference was made.
///
/// Holding a `ListRef` does not imply ownership; only the tree edge from the
/// slot that introduced a nested scope does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRef {
    pub handle: ListHandle,
    pub len: usize,
}

impl ListRef {
    pub fn scope(id: ScopeId, len: usize) -> Self {
        ListRef {
            handle: ListHandle::Scope(id),
            len,
        }
    }

    pub fn heap(id: HeapId, len: usize) -> Self {
        ListRef {
            handle: ListHandle::Heap(id),
            len,
        }
    }
}

/// The three value kinds of the language
#[derive(Clone, PartialEq)]
pub enum Value {
    Number(f64),
    String(Rc<str>),
    List(ListRef),
}

impl Value {
    /// Human readable kind, used in type mismatch diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
        }
    }

    pub fn as_number(&self) -> Result<f64, Fault> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(Fault::expected("a number", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, Fault> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(Fault::expected("a string", other)),
        }
    }

    pub fn as_list(&self) -> Result<ListRef, Fault> {
        match self {
            Value::List(list) => Ok(*list),
            other => Err(Fault::expected("a list", other)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::List(list) => match list.handle {
                ListHandle::Scope(id) => write!(f, "List(scope {id}, len {})", list.len),
                ListHandle::Heap(id) => write!(f, "List(heap {id}, len {})", list.len),
            },
        }
    }
}

/// Write a string literal with the escapes the text parser understands
pub(crate) fn write_quoted(f: &mut impl fmt::Write, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

/// Diagnostic form. Strings are quoted; lists only show their handle since
/// their contents live outside the value.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write_quoted(f, s),
            Value::List(list) => match list.handle {
                ListHandle::Scope(id) => write!(f, "#<list scope:{id} len:{}>", list.len),
                ListHandle::Heap(id) => write!(f, "#<list heap:{id} len:{}>", list.len),
            },
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<ListRef> for Value {
    fn from(list: ListRef) -> Self {
        Value::List(list)
    }
}

/// One tagged element of a list
#[derive(Clone, PartialEq)]
pub enum Slot {
    /// Inert data, consumed by a preceding opcode or left loose
    Value(Value),
    /// A bare variable reference, resolved by upward lookup when consumed
    Name(Rc<str>),
    /// An instruction; its operands are the slots that follow it
    Opcode(Opcode),
}

impl Slot {
    pub fn is_opcode(&self) -> bool {
        matches!(self, Slot::Opcode(_))
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Value(v) => write!(f, "Value({v:?})"),
            Slot::Name(n) => write!(f, "Name({n})"),
            Slot::Opcode(op) => write!(f, "Opcode({})", op.mnemonic()),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Value(v) => write!(f, "{v}"),
            Slot::Name(n) => write!(f, "{n}"),
            Slot::Opcode(op) => write!(f, "{}", op.mnemonic()),
        }
    }
}

impl From<Value> for Slot {
    fn from(value: Value) -> Self {
        Slot::Value(value)
    }
}

impl From<Opcode> for Slot {
    fn from(op: Opcode) -> Self {
        Slot::Opcode(op)
    }
}

/// Helper for building value slots in code and tests
pub fn val<T: Into<Value>>(value: T) -> Slot {
    Slot::Value(value.into())
}

/// Helper for building name slots in code and tests
pub fn name<S: AsRef<str>>(ident: S) -> Slot {
    Slot::Name(Rc::from(ident.as_ref()))
}

/// Position of a form in the source text (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Parsed but not yet lowered source form
#[derive(Debug, Clone, PartialEq)]
pub enum Sexpr {
    Number(f64),
    String(String),
    Symbol(String),
    List { items: Vec<Sexpr>, pos: Pos },
}

impl Sexpr {
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Sexpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// The symbol at the head of a list form, if any
    pub fn head_symbol(&self) -> Option<&str> {
        match self {
            Sexpr::List { items, .. } => items.first().and_then(Sexpr::as_symbol),
            _ => None,
        }
    }
}

impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexpr::Number(n) => write!(f, "{n}"),
            Sexpr::String(s) => write_quoted(f, s),
            Sexpr::Symbol(s) => write!(f, "{s}"),
            Sexpr::List { items, .. } => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_functions_data_driven() {
        let test_cases = vec![
            (val(42), Slot::Value(Value::Number(42.0))),
            (val(-1.5), Slot::Value(Value::Number(-1.5))),
            (val("hello"), Slot::Value(Value::String(Rc::from("hello")))),
            (val(String::new()), Slot::Value(Value::String(Rc::from("")))),
            (name("x"), Slot::Name(Rc::from("x"))),
            (
                val(ListRef::scope(3, 2)),
                Slot::Value(Value::List(ListRef {
                    handle: ListHandle::Scope(3),
                    len: 2,
                })),
            ),
        ];

        for (i, (actual, expected)) in test_cases.iter().enumerate() {
            assert_eq!(actual, expected, "helper case #{}", i + 1);
        }
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::from(3).to_string(), "3");
        assert_eq!(Value::from(0.25).to_string(), "0.25");
        assert_eq!(Value::from("a\"b\n").to_string(), r#""a\"b\n""#);
        assert_eq!(
            Value::List(ListRef::heap(1, 4)).to_string(),
            "#<list heap:1 len:4>"
        );
    }

    #[test]
    fn test_kind_checks() {
        assert_eq!(Value::from(1).as_number(), Ok(1.0));
        assert!(matches!(
            Value::from("x").as_number(),
            Err(Fault::TypeMismatch(msg)) if msg.contains("found string")
        ));
        assert!(Value::from(1).as_list().is_err());
        assert_eq!(Value::from("s").as_str(), Ok("s"));
    }

    #[test]
    fn test_slot_is_fixed_width() {
        // tag plus the widest payload: iteration cost does not depend on the kind
        assert!(std::mem::size_of::<Slot>() <= 40);
    }
}
