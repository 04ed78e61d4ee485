//! Opcode registry and the pure part of the builtin library.
//!
//! Every instruction is described once in [`BUILTIN_OPS`]: its binary opcode
//! byte, its text mnemonic (and aliases), the kinds of operand slots that must
//! follow it, and whether it produces a value. The text parser, the binary
//! decoder, the tree validator and the engine all consult the same table, so an
//! operand-count mismatch is caught identically for both wire forms.
//!
//! ## Operand layout
//!
//! Operands follow the opcode slot in prefix order. An expression operand is a
//! value slot, a name slot, or a nested value-producing instruction with its
//! own operands:
//!
//! ```text
//! (set x (add x 1))   =>   SET x ADD 2 x 1
//! ```
//!
//! Variadic instructions (`add`, `sub`, `mul`, `div`, `syscall`) store the
//! operand count as a number slot right after the opcode.
//!
//! ## Adding new operations
//!
//! 1. Add a variant with a fresh byte to [`Opcode`] and to `Opcode::from_u8`
//! 2. Add a `BuiltinOp` row with its operand signature
//! 3. Handle it in the engine's dispatch
//! 4. Add tests covering arity errors and the runtime effect

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use crate::Fault;
use crate::ast::Value;
use crate::intooperation::{IntoSyscall, SyscallFn};

/// Instruction identifiers. Byte values are the binary wire contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Bindings and containers
    Set = 0x01,
    SetAt = 0x02,
    Get = 0x03,
    Length = 0x04,

    // I/O
    Print = 0x10,
    Println = 0x11,
    Read = 0x12,
    ReadFile = 0x13,
    WriteFile = 0x14,

    // Memory
    Alloc = 0x20,
    Free = 0x21,
    Realloc = 0x22,

    // System
    Exit = 0x30,
    Time = 0x31,
    Syscall = 0x32,

    // Math
    Add = 0x40,
    Sub = 0x41,
    Mul = 0x42,
    Div = 0x43,

    // Control flow
    Jump = 0x50,
    IfLtJump = 0x51,
    Try = 0x52,
}

impl Opcode {
    /// Convert a raw byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::SetAt),
            0x03 => Some(Opcode::Get),
            0x04 => Some(Opcode::Length),

            0x10 => Some(Opcode::Print),
            0x11 => Some(Opcode::Println),
            0x12 => Some(Opcode::Read),
            0x13 => Some(Opcode::ReadFile),
            0x14 => Some(Opcode::WriteFile),

            0x20 => Some(Opcode::Alloc),
            0x21 => Some(Opcode::Free),
            0x22 => Some(Opcode::Realloc),

            0x30 => Some(Opcode::Exit),
            0x31 => Some(Opcode::Time),
            0x32 => Some(Opcode::Syscall),

            0x40 => Some(Opcode::Add),
            0x41 => Some(Opcode::Sub),
            0x42 => Some(Opcode::Mul),
            0x43 => Some(Opcode::Div),

            0x50 => Some(Opcode::Jump),
            0x51 => Some(Opcode::IfLtJump),
            0x52 => Some(Opcode::Try),

            _ => None,
        }
    }

    /// Upper-case name used in diagnostics and slot dumps
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Set => "SET",
            Opcode::SetAt => "SET_AT",
            Opcode::Get => "GET",
            Opcode::Length => "LENGTH",
            Opcode::Print => "PRINT",
            Opcode::Println => "PRINTLN",
            Opcode::Read => "READ",
            Opcode::ReadFile => "READ_FILE",
            Opcode::WriteFile => "WRITE_FILE",
            Opcode::Alloc => "ALLOC",
            Opcode::Free => "FREE",
            Opcode::Realloc => "REALLOC",
            Opcode::Exit => "EXIT",
            Opcode::Time => "TIME",
            Opcode::Syscall => "SYSCALL",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Jump => "JUMP",
            Opcode::IfLtJump => "IF_LT_JUMP",
            Opcode::Try => "TRY",
        }
    }

    /// Registry entry for this opcode
    pub fn spec(self) -> &'static BuiltinOp {
        // every variant has exactly one row; checked by test_every_opcode_registered
        &BUILTIN_OPS[BY_OPCODE[&self]]
    }
}

/// What kind of slot an operand position accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Value slot, name slot, or a nested instruction that yields a value
    Expr,
    /// Name slot that is bound rather than looked up
    Binder,
    /// Number slot holding a scope ID
    Target,
}

/// Accepted operand counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }

    /// Check an operand count, describing the mismatch on failure
    pub fn validate(self, count: usize) -> Result<(), String> {
        if self.accepts(count) {
            return Ok(());
        }
        Err(match self {
            Arity::Exact(n) => format!("expected {n} operand(s), got {count}"),
            Arity::AtLeast(n) => format!("expected at least {n} operand(s), got {count}"),
        })
    }
}

/// Definition of an instruction
#[derive(Debug)]
pub struct BuiltinOp {
    pub opcode: Opcode,
    /// Text mnemonic used by the `.svmp` form (and by the text encoder)
    pub text_id: &'static str,
    /// Extra spellings accepted by the text parser
    pub aliases: &'static [&'static str],
    /// Kinds of the leading operands; operands past the end are `Expr`
    pub operands: &'static [Operand],
    pub arity: Arity,
    /// Whether the instruction leaves a value, i.e. may be used as an operand
    pub yields: bool,
}

impl BuiltinOp {
    /// Variadic instructions carry a count slot after the opcode
    pub fn is_counted(&self) -> bool {
        matches!(self.arity, Arity::AtLeast(_))
    }

    pub fn operand_kind(&self, index: usize) -> Operand {
        self.operands.get(index).copied().unwrap_or(Operand::Expr)
    }
}

use Operand::{Binder, Expr, Target};

macro_rules! op {
    ($opcode:ident, $text:literal, [$($alias:literal),*], [$($kind:expr),*], $arity:expr, $yields:literal) => {
        BuiltinOp {
            opcode: Opcode::$opcode,
            text_id: $text,
            aliases: &[$($alias),*],
            operands: &[$($kind),*],
            arity: $arity,
            yields: $yields,
        }
    };
}

/// Global registry of all instructions
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    vec![
        // `set` is overloaded on operand count: 2 binds a name, 3 writes a list slot
        op!(Set, "set", [], [Binder, Expr], Arity::Exact(2), false),
        op!(SetAt, "set", ["set_at"], [Expr, Expr, Expr], Arity::Exact(3), false),
        op!(Get, "get", [], [Expr, Expr], Arity::Exact(2), true),
        op!(Length, "length", [], [Expr], Arity::Exact(1), true),
        op!(Print, "print", [], [Expr], Arity::Exact(1), false),
        op!(Println, "println", [], [Expr], Arity::Exact(1), false),
        op!(Read, "read", [], [], Arity::Exact(0), true),
        op!(ReadFile, "read_file", [], [Expr], Arity::Exact(1), true),
        op!(WriteFile, "write_file", [], [Expr, Expr], Arity::Exact(2), false),
        op!(Alloc, "alloc", [], [Expr, Expr], Arity::Exact(2), true),
        op!(Free, "free", [], [Expr], Arity::Exact(1), false),
        op!(Realloc, "realloc", [], [Expr, Expr], Arity::Exact(2), true),
        op!(Exit, "exit", [], [Expr], Arity::Exact(1), false),
        op!(Time, "time", [], [], Arity::Exact(0), true),
        op!(Syscall, "syscall", [], [Expr], Arity::AtLeast(1), true),
        op!(Add, "add", ["+"], [], Arity::AtLeast(1), true),
        op!(Sub, "sub", ["-"], [], Arity::AtLeast(1), true),
        op!(Mul, "mul", ["*"], [], Arity::AtLeast(1), true),
        op!(Div, "div", ["/"], [], Arity::AtLeast(1), true),
        op!(Jump, "jump", [], [Target], Arity::Exact(1), false),
        op!(IfLtJump, "if_lt_jump", [], [Expr, Expr, Target], Arity::Exact(3), false),
        op!(Try, "try", [], [Target], Arity::Exact(1), false),
    ]
});

static BY_OPCODE: LazyLock<HashMap<Opcode, usize>> = LazyLock::new(|| {
    BUILTIN_OPS
        .iter()
        .enumerate()
        .map(|(i, op)| (op.opcode, i))
        .collect()
});

/// Text spelling to candidate instructions (several when overloaded)
static BY_TEXT: LazyLock<HashMap<&'static str, Vec<&'static BuiltinOp>>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    let mut map: HashMap<&'static str, Vec<&'static BuiltinOp>> = HashMap::new();
    for op in ops {
        for id in std::iter::once(&op.text_id).chain(op.aliases) {
            map.entry(*id).or_default().push(op);
        }
    }
    map
});

/// Get all instructions
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find the instruction a text mnemonic denotes for a given operand count.
///
/// Overloaded mnemonics pick the candidate whose arity accepts `operand_count`;
/// when none does, the first candidate is returned so the caller can report
/// its arity mismatch.
pub fn find_text_op(id: &str, operand_count: usize) -> Option<&'static BuiltinOp> {
    let candidates = BY_TEXT.get(id)?;
    candidates
        .iter()
        .find(|op| op.arity.accepts(operand_count))
        .or_else(|| candidates.first())
        .copied()
}

/// Whether an identifier is an instruction mnemonic or alias
pub fn is_mnemonic(id: &str) -> bool {
    BY_TEXT.contains_key(id)
}

//
// Builtin math
//

macro_rules! variadic_math {
    ($name:ident, $op:tt, $unary:expr, $what:literal) => {
        fn $name(args: &[f64]) -> Result<f64, Fault> {
            let Some((&first, rest)) = args.split_first() else {
                return Err(Fault::Math(concat!($what, " needs at least one operand").into()));
            };
            let mut result = if rest.is_empty() { $unary(first) } else { first };
            for &n in rest {
                result = result $op n;
            }
            if result.is_finite() {
                Ok(result)
            } else {
                Err(Fault::Math(format!(concat!("numeric overflow in ", $what, " ({})"), result)))
            }
        }
    };
}

variadic_math!(builtin_add, +, |n: f64| n, "add");
variadic_math!(builtin_sub, -, |n: f64| -n, "sub");
variadic_math!(builtin_mul, *, |n: f64| n, "mul");

fn builtin_div(args: &[f64]) -> Result<f64, Fault> {
    let Some((&first, rest)) = args.split_first() else {
        return Err(Fault::Math("div needs at least one operand".into()));
    };
    // (div x) is the reciprocal, like the single-operand (sub x) negation
    let (mut result, divisors) = if rest.is_empty() {
        (1.0, args)
    } else {
        (first, rest)
    };
    for &d in divisors {
        if d == 0.0 {
            return Err(Fault::Math("division by zero".into()));
        }
        result /= d;
    }
    if result.is_finite() {
        Ok(result)
    } else {
        Err(Fault::Math(format!("numeric overflow in div ({result})")))
    }
}

/// Apply a variadic math instruction to already resolved operands
pub fn apply_math(op: Opcode, args: &[f64]) -> Result<f64, Fault> {
    match op {
        Opcode::Add => builtin_add(args),
        Opcode::Sub => builtin_sub(args),
        Opcode::Mul => builtin_mul(args),
        Opcode::Div => builtin_div(args),
        other => Err(Fault::TypeMismatch(format!(
            "{} is not a math instruction",
            other.mnemonic()
        ))),
    }
}

/// Convert a number operand to a slot index, bounds-checked against `len`
pub fn slot_index(index: f64, len: usize) -> Result<usize, Fault> {
    if index >= 0.0 && index.fract() == 0.0 && index < len as f64 {
        Ok(index as usize)
    } else {
        Err(Fault::Index { index, len })
    }
}

/// Convert a number operand to a non-negative count
pub fn count_operand(n: f64, what: &str) -> Result<usize, Fault> {
    if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 {
        Ok(n as usize)
    } else {
        Err(Fault::TypeMismatch(format!(
            "{what} must be a non-negative integer, got {n}"
        )))
    }
}

//
// Syscalls
//

/// Syscall id of the builtin `log` extension
pub const SYSCALL_LOG: u32 = 0;

/// Registry behind the `syscall` instruction
#[derive(Clone)]
pub struct SyscallTable {
    entries: HashMap<u32, (String, Rc<SyscallFn>)>,
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .map(|(id, (name, _))| (*id, name.as_str()))
            .collect();
        ids.sort_unstable();
        f.debug_struct("SyscallTable").field("entries", &ids).finish()
    }
}

fn syscall_log(args: &[Value]) -> Result<Value, Fault> {
    let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
    tracing::info!(target: "slotvm::syscall", "{}", rendered.join(" "));
    Ok(args.first().cloned().unwrap_or(Value::Number(0.0)))
}

impl Default for SyscallTable {
    fn default() -> Self {
        let mut table = SyscallTable {
            entries: HashMap::new(),
        };
        table.register(SYSCALL_LOG, "log", syscall_log);
        table
    }
}

impl SyscallTable {
    /// An empty table with no syscalls at all
    pub fn empty() -> Self {
        SyscallTable {
            entries: HashMap::new(),
        }
    }

    /// Register (or replace) a syscall working directly on its operands
    pub fn register<F>(&mut self, id: u32, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, Fault> + 'static,
    {
        self.entries.insert(id, (name.to_owned(), Rc::new(func)));
    }

    /// Register a plain Rust function; operands are converted to its parameter types
    pub fn register_typed<F, Args, R>(&mut self, id: u32, name: &str, func: F)
    where
        F: IntoSyscall<Args, R> + 'static,
    {
        self.entries
            .insert(id, (name.to_owned(), func.into_syscall()));
    }

    /// Name a syscall id was registered under
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|(name, _)| name.as_str())
    }

    pub fn call(&self, id: f64, args: &[Value]) -> Result<Value, Fault> {
        let key = (id >= 0.0 && id.fract() == 0.0 && id <= u32::MAX as f64).then_some(id as u32);
        match key.and_then(|k| self.entries.get(&k)) {
            Some((_, func)) => func(args),
            None => Err(Fault::Syscall(format!("unknown syscall id {id}"))),
        }
    }
}
