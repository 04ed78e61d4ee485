//! Typed adapters for registering syscalls.
//!
//! A syscall receives the already-evaluated operands of a `syscall`
//! instruction (after the id). Embedders can register a raw
//! `Fn(&[Value]) -> Result<Value, Fault>`, or a plain Rust function whose
//! parameters and return type are converted automatically:
//!
//! ```
//! use slotvm::builtinops::SyscallTable;
//!
//! fn hypot(a: f64, b: f64) -> f64 {
//!     (a * a + b * b).sqrt()
//! }
//!
//! let mut table = SyscallTable::default();
//! table.register_typed::<_, (f64, f64), f64>(7, "hypot", hypot);
//! ```
//!
//! Arity is checked before conversion; a wrong count or a wrongly typed
//! operand is a `SyscallError`, so a `try` scope can recover from a bad call.

use std::fmt::Display;
use std::rc::Rc;

use crate::Fault;
use crate::ast::{ListRef, Value};

/// Canonical erased syscall type stored in the registry
pub type SyscallFn = dyn Fn(&[Value]) -> Result<Value, Fault>;

/// Conversion of one syscall operand into a Rust parameter.
///
/// `Param<'a>` may borrow from the operand (as `&str` does).
pub trait FromParam {
    type Param<'a>;

    fn from_arg(value: &Value) -> Result<Self::Param<'_>, Fault>;
}

fn wrong_kind(what: &str, value: &Value) -> Fault {
    Fault::Syscall(format!("expected {what}, found {}", value.kind_name()))
}

impl FromParam for Value {
    type Param<'a> = Value;

    fn from_arg(value: &Value) -> Result<Self::Param<'_>, Fault> {
        Ok(value.clone())
    }
}

impl FromParam for f64 {
    type Param<'a> = f64;

    fn from_arg(value: &Value) -> Result<Self::Param<'_>, Fault> {
        match value {
            Value::Number(n) => Ok(*n),
            other => Err(wrong_kind("a number", other)),
        }
    }
}

impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg(value: &Value) -> Result<Self::Param<'_>, Fault> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(wrong_kind("a string", other)),
        }
    }
}

impl FromParam for ListRef {
    type Param<'a> = ListRef;

    fn from_arg(value: &Value) -> Result<Self::Param<'_>, Fault> {
        match value {
            Value::List(list) => Ok(*list),
            other => Err(wrong_kind("a list", other)),
        }
    }
}

/// Normalize plain values and `Result`-returning functions into `Result<T, Fault>`
pub trait IntoResult<T> {
    fn into_result(self) -> Result<T, Fault>;
}

impl<T> IntoResult<T> for T {
    fn into_result(self) -> Result<T, Fault> {
        Ok(self)
    }
}

impl<T, E> IntoResult<T> for Result<T, E>
where
    E: Display,
{
    fn into_result(self) -> Result<T, Fault> {
        self.map_err(|e| Fault::Syscall(e.to_string()))
    }
}

/// Return values a typed syscall may produce
pub trait IntoSyscallValue {
    fn into_value(self) -> Value;
}

impl<T: Into<Value>> IntoSyscallValue for T {
    fn into_value(self) -> Value {
        self.into()
    }
}

/// Rust functions usable as syscalls
pub trait IntoSyscall<Args, R> {
    fn into_syscall(self) -> Rc<SyscallFn>;
}

fn arity_fault(expected: usize, got: usize) -> Fault {
    Fault::Syscall(format!("expected {expected} argument(s), got {got}"))
}

// 0-arg functions / closures
impl<F, FR, R> IntoSyscall<(), R> for F
where
    F: Fn() -> FR + 'static,
    FR: IntoResult<R> + 'static,
    R: IntoSyscallValue + 'static,
{
    fn into_syscall(self) -> Rc<SyscallFn> {
        Rc::new(move |args: &[Value]| {
            if !args.is_empty() {
                return Err(arity_fault(0, args.len()));
            }
            Ok((self)().into_result()?.into_value())
        })
    }
}

macro_rules! impl_into_syscall_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, FR, R, $( $A ),+> IntoSyscall<( $( $A, )+ ), R> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> FR + 'static,
            FR: IntoResult<R> + 'static,
            R: IntoSyscallValue + 'static,
            $( $A: FromParam, )+
        {
            fn into_syscall(self) -> Rc<SyscallFn> {
                Rc::new(move |args: &[Value]| match args {
                    [ $( $v ),+ ] => {
                        $(
                            let $p = <$A as FromParam>::from_arg($v)?;
                        )+
                        Ok((self)( $( $p ),+ ).into_result()?.into_value())
                    }
                    _ => Err(arity_fault($arity, args.len())),
                })
            }
        }
    };
}

impl_into_syscall_for_arity!(1, v0, p0: A1);
impl_into_syscall_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_syscall_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_syscall_for_arity!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);
