//! The `.svmp` text form: parsing, lowering into a [`ScopeTree`], and canonical
//! re-encoding.
//!
//! Parsing produces plain [`Sexpr`] forms with source positions. After macro
//! expansion the forms are lowered: every parenthesised list that is not an
//! instruction becomes a nested scope, and instructions are flattened into the
//! enclosing scope as an opcode slot followed by their operands in prefix
//! order.
//!
//! ```text
//! (set x (add x 1))        =>  SET x ADD 2 x 1
//! (if (< x max) (jump l))  =>  IF_LT_JUMP x max <id of l>
//! ```

use std::fmt::Write as _;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, digit1, multispace1, not_line_ending, one_of, satisfy},
    combinator::{all_consuming, cut, not, opt, peek, recognize, value},
    error::ErrorKind,
    multi::many0,
    sequence::{pair, preceded},
};

use crate::ast::{ListHandle, Pos, ScopeId, Sexpr, Slot, Value, write_quoted};
use crate::builtinops::{Opcode, Operand, find_text_op};
use crate::config::RuntimeConfig;
use crate::scope::{ScopeTree, TreeBuilder, read_count};
use crate::{Error, ParseError, ParseErrorKind, macros};

/// Characters allowed in identifiers besides ASCII letters and digits
const SYMBOL_SPECIAL_CHARS: &str = "_+-*/<>=!?$.";

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)
}

/// An identifier may not start with a digit or a dot, nor look like a signed number
fn is_valid_symbol(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        None => false,
        Some(c) if c.is_ascii_digit() || c == '.' => false,
        Some('+' | '-') => !chars.next().is_some_and(|c| c.is_ascii_digit()),
        Some(_) => true,
    }
}

/// Whole-string identifier check, for names that did not come from the parser
pub(crate) fn is_identifier(s: &str) -> bool {
    s.chars().all(is_symbol_char) && is_valid_symbol(s)
}

/// Whitespace and `;` line comments
fn skip_ws(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(char(';'), not_line_ending)),
        ))),
    )
    .parse(input)
}

fn number_text(input: &str) -> IResult<&str, &str> {
    let (rest, text) = recognize((
        opt(one_of("+-")),
        digit1,
        opt(pair(char('.'), digit1)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)?;
    // "12abc" is neither a number nor a symbol
    let (rest, ()) = not(peek(satisfy(is_symbol_char))).parse(rest)?;
    Ok((rest, text))
}

fn parse_number(input: &str) -> IResult<&str, Sexpr> {
    let (rest, text) = number_text(input)?;
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok((rest, Sexpr::Number(n))),
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::Float,
        ))),
    }
}

/// Parse a whole string as a number literal, the way `read` interprets input
pub fn parse_number_literal(text: &str) -> Option<f64> {
    match all_consuming(parse_number).parse(text.trim()) {
        Ok((_, Sexpr::Number(n))) => Some(n),
        _ => None,
    }
}

fn parse_symbol(input: &str) -> IResult<&str, Sexpr> {
    let (remaining, candidate) = take_while1(is_symbol_char).parse(input)?;
    if is_valid_symbol(candidate) {
        Ok((remaining, Sexpr::Symbol(candidate.into())))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )))
    }
}

fn parse_string(input: &str) -> IResult<&str, Sexpr> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut chars = String::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => return Ok((char_iter.as_str(), Sexpr::String(chars))),
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('"') => chars.push('"'),
                    Some(_) => {
                        return Err(nom::Err::Failure(nom::error::Error::new(
                            remaining,
                            ErrorKind::Escaped,
                        )));
                    }
                    None => {
                        return Err(nom::Err::Failure(nom::error::Error::new(
                            input,
                            ErrorKind::Eof,
                        )));
                    }
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = char_iter.as_str();
            }
            None => {
                // unterminated: report at the opening quote
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    ErrorKind::Eof,
                )));
            }
        }
    }
}

struct TextReader<'s> {
    source: &'s str,
    line_starts: Vec<usize>,
    max_depth: usize,
}

impl<'s> TextReader<'s> {
    fn new(source: &'s str, max_depth: usize) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        TextReader {
            source,
            line_starts,
            max_depth,
        }
    }

    fn pos_of(&self, rest: &str) -> Pos {
        let offset = self.source.len() - rest.len();
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line - 1];
        let column = self
            .source
            .get(line_start..offset)
            .map_or(0, |s| s.chars().count());
        Pos {
            line,
            column: column + 1,
        }
    }

    fn sexpr<'a>(&self, input: &'a str, depth: usize) -> IResult<&'a str, Sexpr> {
        alt((
            |i| self.list(i, depth),
            parse_number,
            parse_string,
            parse_symbol,
        ))
        .parse(input)
    }

    fn list<'a>(&self, input: &'a str, depth: usize) -> IResult<&'a str, Sexpr> {
        let start = input;
        let (input, _) = char('(').parse(input)?;
        if depth >= self.max_depth {
            return Err(nom::Err::Failure(nom::error::Error::new(
                start,
                ErrorKind::TooLarge,
            )));
        }
        let (input, items) =
            many0(preceded(skip_ws, |i| self.sexpr(i, depth + 1))).parse(input)?;
        let (input, ()) = skip_ws(input)?;
        let (input, _) = cut(char(')')).parse(input)?;
        Ok((
            input,
            Sexpr::List {
                items,
                pos: self.pos_of(start),
            },
        ))
    }

    fn program(&self) -> Result<Vec<Sexpr>, ParseError> {
        let mut forms = Vec::new();
        let mut input = self.source;
        loop {
            let (rest, ()) = skip_ws(input).map_err(|e| self.error(e))?;
            if rest.is_empty() {
                return Ok(forms);
            }
            if rest.starts_with(')') {
                return Err(self.at(rest, ParseErrorKind::TrailingContent, "unmatched ')'"));
            }
            let (rest, form) = self.sexpr(rest, 0).map_err(|e| self.error(e))?;
            forms.push(form);
            input = rest;
        }
    }

    fn at(&self, rest: &str, kind: ParseErrorKind, message: &str) -> ParseError {
        ParseError::at_offset(kind, message, self.source, self.source.len() - rest.len())
    }

    fn error(&self, err: nom::Err<nom::error::Error<&str>>) -> ParseError {
        let e = match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
            nom::Err::Incomplete(_) => {
                return self.at("", ParseErrorKind::Incomplete, "incomplete input");
            }
        };
        let (kind, message) = match e.code {
            ErrorKind::TooLarge => (
                ParseErrorKind::TooDeeplyNested,
                format!("expression too deeply nested (max depth: {})", self.max_depth),
            ),
            ErrorKind::Eof => (ParseErrorKind::Incomplete, "unterminated string".into()),
            ErrorKind::Escaped => (
                ParseErrorKind::InvalidSyntax,
                "unknown escape sequence".into(),
            ),
            ErrorKind::Float => (
                ParseErrorKind::InvalidSyntax,
                "number literal out of range".into(),
            ),
            _ if e.input.is_empty() => (
                ParseErrorKind::Incomplete,
                "unexpected end of input, expected ')'".into(),
            ),
            _ => {
                let near: String = e.input.chars().take(10).collect();
                (
                    ParseErrorKind::InvalidSyntax,
                    format!("invalid syntax near '{near}'"),
                )
            }
        };
        self.at(e.input, kind, &message)
    }
}

/// Parse source text into forms without expanding macros
pub fn parse_forms(source: &str, config: &RuntimeConfig) -> Result<Vec<Sexpr>, Error> {
    Ok(TextReader::new(source, config.max_parse_depth).program()?)
}

/// Parse, expand and lower a text program
pub fn compile_text(source: &str, config: &RuntimeConfig) -> Result<ScopeTree, Error> {
    let forms = parse_forms(source, config)?;
    let forms = macros::expand(forms, config)?;
    let tree = lower_program(&forms, config)?;
    tracing::debug!(scopes = tree.len(), "compiled text program");
    Ok(tree)
}

//
// Lowering
//

fn malformed(message: impl std::fmt::Display, pos: Pos) -> Error {
    Error::MalformedOpcode(format!("{message} at {pos}"))
}

/// Jump target naming a label that was not built yet
struct Fixup {
    scope: ScopeId,
    slot: usize,
    label: String,
    pos: Pos,
}

struct Lowering {
    builder: TreeBuilder,
    fixups: Vec<Fixup>,
    max_depth: usize,
}

/// How a parenthesised form is lowered
enum FormKind<'f> {
    Instruction(&'f str, &'f [Sexpr]),
    IfLess(&'f [Sexpr]),
    Nested {
        label: Option<&'f str>,
        body: &'f [Sexpr],
    },
}

fn classify<'f>(items: &'f [Sexpr], pos: Pos) -> Result<FormKind<'f>, Error> {
    let head = items.first().and_then(Sexpr::as_symbol);
    match head {
        Some("list") => Ok(FormKind::Nested {
            label: None,
            body: &items[1..],
        }),
        Some("scope") => match items.get(1) {
            Some(Sexpr::Symbol(label)) => Ok(FormKind::Nested {
                label: Some(label),
                body: &items[2..],
            }),
            _ => Err(malformed("scope needs a label symbol", pos)),
        },
        Some("if") => Ok(FormKind::IfLess(&items[1..])),
        Some("macro") => Err(malformed("macro definitions are only allowed as forms", pos)),
        Some("<") => Err(malformed("'<' is only valid as an if condition", pos)),
        Some(id) if crate::builtinops::is_mnemonic(id) => {
            Ok(FormKind::Instruction(id, &items[1..]))
        }
        _ => Ok(FormKind::Nested {
            label: None,
            body: items,
        }),
    }
}

impl Lowering {
    fn statement(
        &mut self,
        form: &Sexpr,
        scope: ScopeId,
        out: &mut Vec<Slot>,
        depth: usize,
    ) -> Result<(), Error> {
        let Sexpr::List { items, pos } = form else {
            return self.expr(form, scope, out, depth);
        };
        match classify(items, *pos)? {
            FormKind::Instruction(id, args) => {
                self.instruction(id, args, *pos, scope, out, depth, false)
            }
            FormKind::IfLess(parts) => self.if_less(parts, *pos, scope, out, depth),
            FormKind::Nested { label, body } => {
                self.nested(label, body, *pos, scope, out, depth)
            }
        }
    }

    fn expr(
        &mut self,
        form: &Sexpr,
        scope: ScopeId,
        out: &mut Vec<Slot>,
        depth: usize,
    ) -> Result<(), Error> {
        match form {
            Sexpr::Number(n) => out.push(Slot::Value(Value::Number(*n))),
            Sexpr::String(s) => out.push(Slot::Value(Value::from(s.as_str()))),
            Sexpr::Symbol(s) => out.push(crate::ast::name(s)),
            Sexpr::List { items, pos } => match classify(items, *pos)? {
                FormKind::Instruction(id, args) => {
                    self.instruction(id, args, *pos, scope, out, depth, true)?;
                }
                FormKind::IfLess(_) => {
                    return Err(malformed("if produces no value and cannot be an operand", *pos));
                }
                FormKind::Nested { label, body } => {
                    self.nested(label, body, *pos, scope, out, depth)?;
                }
            },
        }
        Ok(())
    }

    fn nested(
        &mut self,
        label: Option<&str>,
        body: &[Sexpr],
        pos: Pos,
        parent: ScopeId,
        out: &mut Vec<Slot>,
        depth: usize,
    ) -> Result<(), Error> {
        if depth >= self.max_depth {
            return Err(malformed(
                format!("lists nested deeper than {}", self.max_depth),
                pos,
            ));
        }
        let id = self
            .builder
            .open_scope(Some(parent), label)
            .map_err(|msg| malformed(msg, pos))?;
        let mut slots = Vec::with_capacity(body.len());
        for item in body {
            self.statement(item, id, &mut slots, depth + 1)?;
        }
        let list = self.close(id, slots, pos)?;
        out.push(Slot::Value(Value::List(list)));
        Ok(())
    }

    fn close(
        &mut self,
        id: ScopeId,
        slots: Vec<Slot>,
        pos: Pos,
    ) -> Result<crate::ast::ListRef, Error> {
        self.builder
            .close_scope(id, slots)
            .map_err(|m| malformed(format!("{} (slot {})", m.message, m.slot), pos))
    }

    #[expect(clippy::too_many_arguments)] // threading lowering state through recursion
    fn instruction(
        &mut self,
        id: &str,
        args: &[Sexpr],
        pos: Pos,
        scope: ScopeId,
        out: &mut Vec<Slot>,
        depth: usize,
        need_value: bool,
    ) -> Result<(), Error> {
        let Some(op) = find_text_op(id, args.len()) else {
            return Err(malformed(format!("unknown instruction '{id}'"), pos));
        };
        if need_value && !op.yields {
            return Err(malformed(
                format!("{id} produces no value and cannot be an operand"),
                pos,
            ));
        }
        op.arity
            .validate(args.len())
            .map_err(|msg| malformed(format!("{id}: {msg}"), pos))?;

        out.push(Slot::Opcode(op.opcode));
        if op.is_counted() {
            out.push(Slot::Value(Value::Number(args.len() as f64)));
        }
        for (k, arg) in args.iter().enumerate() {
            match op.operand_kind(k) {
                Operand::Expr => self.expr(arg, scope, out, depth)?,
                Operand::Binder => match arg {
                    Sexpr::Symbol(s) => out.push(crate::ast::name(s)),
                    other => {
                        return Err(malformed(
                            format!("{id}: expected a variable name, found {other}"),
                            pos,
                        ));
                    }
                },
                Operand::Target => self.target(arg, pos, scope, out)?,
            }
        }
        Ok(())
    }

    fn target(
        &mut self,
        arg: &Sexpr,
        pos: Pos,
        scope: ScopeId,
        out: &mut Vec<Slot>,
    ) -> Result<(), Error> {
        match arg {
            Sexpr::Number(n) => out.push(Slot::Value(Value::Number(*n))),
            Sexpr::Symbol(label) => {
                let id = match self.builder.label_id(label) {
                    Some(id) => id as f64,
                    None => {
                        self.fixups.push(Fixup {
                            scope,
                            slot: out.len(),
                            label: label.clone(),
                            pos,
                        });
                        -1.0
                    }
                };
                out.push(Slot::Value(Value::Number(id)));
            }
            other => {
                return Err(malformed(
                    format!("jump target must be a scope label or id, found {other}"),
                    pos,
                ));
            }
        }
        Ok(())
    }

    /// `(if (< lhs rhs) (jump target))`
    fn if_less(
        &mut self,
        parts: &[Sexpr],
        pos: Pos,
        scope: ScopeId,
        out: &mut Vec<Slot>,
        depth: usize,
    ) -> Result<(), Error> {
        let shape = match parts {
            [Sexpr::List { items: cond, .. }, Sexpr::List { items: action, .. }] => {
                match (cond.as_slice(), action.as_slice()) {
                    ([Sexpr::Symbol(lt), lhs, rhs], [Sexpr::Symbol(jump), target])
                        if lt == "<" && jump == "jump" =>
                    {
                        Some((lhs, rhs, target))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        let Some((lhs, rhs, target)) = shape else {
            return Err(malformed(
                "if must have the form (if (< a b) (jump target))",
                pos,
            ));
        };
        out.push(Slot::Opcode(Opcode::IfLtJump));
        self.expr(lhs, scope, out, depth)?;
        self.expr(rhs, scope, out, depth)?;
        self.target(target, pos, scope, out)
    }
}

fn lower_program(forms: &[Sexpr], config: &RuntimeConfig) -> Result<ScopeTree, Error> {
    let mut lowering = Lowering {
        builder: TreeBuilder::new(config.max_parse_depth),
        fixups: Vec::new(),
        max_depth: config.max_parse_depth,
    };
    let root_pos = Pos { line: 1, column: 1 };
    let root = lowering
        .builder
        .open_scope(None, None)
        .map_err(|msg| malformed(msg, root_pos))?;

    let mut slots = Vec::new();
    for form in forms {
        lowering.statement(form, root, &mut slots, 0)?;
    }
    lowering.close(root, slots, root_pos)?;

    let Lowering {
        mut builder,
        fixups,
        ..
    } = lowering;
    for fixup in fixups {
        let Some(id) = builder.label_id(&fixup.label) else {
            return Err(malformed(
                format!("unknown scope label '{}'", fixup.label),
                fixup.pos,
            ));
        };
        builder
            .patch(fixup.scope, fixup.slot, Value::Number(id as f64))
            .map_err(|msg| malformed(msg, fixup.pos))?;
    }
    builder.finish().map_err(Error::MalformedOpcode)
}

//
// Canonical text output
//

const INDENT: &str = "  ";

struct TextWriter<'t> {
    tree: &'t ScopeTree,
}

impl TextWriter<'_> {
    /// Render the item starting at `slots[at]`, returning the index after it
    fn item(&self, slots: &[Slot], at: usize, indent: usize) -> (String, usize) {
        match &slots[at] {
            Slot::Value(v) => (self.value(v, indent), at + 1),
            Slot::Name(n) => (n.to_string(), at + 1),
            Slot::Opcode(op) => self.instruction(slots, at, *op, indent),
        }
    }

    fn value(&self, v: &Value, indent: usize) -> String {
        match v {
            Value::Number(n) => format!("{n}"),
            Value::String(s) => {
                let mut out = String::new();
                let _ = write_quoted(&mut out, s);
                out
            }
            Value::List(list) => match list.handle {
                ListHandle::Scope(id) => self.list(id, indent),
                ListHandle::Heap(_) => "(list)".into(),
            },
        }
    }

    fn target(&self, slot: Option<&Slot>) -> String {
        match slot {
            Some(Slot::Value(Value::Number(n))) => {
                let label = (*n >= 0.0 && n.fract() == 0.0)
                    .then(|| self.tree.label_of(*n as ScopeId))
                    .flatten();
                label.map_or_else(|| format!("{n}"), str::to_owned)
            }
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn instruction(&self, slots: &[Slot], at: usize, op: Opcode, indent: usize) -> (String, usize) {
        let spec = op.spec();
        let mut pos = at + 1;
        let count = if spec.is_counted() {
            let n = read_count(slots, pos).unwrap_or(0);
            pos += 1;
            n
        } else {
            spec.operands.len()
        };

        let mut operands = Vec::with_capacity(count);
        for k in 0..count {
            if pos >= slots.len() {
                break;
            }
            if spec.operand_kind(k) == Operand::Target {
                operands.push(self.target(slots.get(pos)));
                pos += 1;
            } else {
                let (text, next) = self.item(slots, pos, indent);
                operands.push(text);
                pos = next;
            }
        }

        let text = match (op, operands.as_slice()) {
            (Opcode::IfLtJump, [lhs, rhs, target]) => {
                format!("(if (< {lhs} {rhs}) (jump {target}))")
            }
            (_, []) => format!("({})", spec.text_id),
            _ => format!("({} {})", spec.text_id, operands.join(" ")),
        };
        (text, pos)
    }

    fn statements(&self, slots: &[Slot], indent: usize) -> Vec<String> {
        let mut lines = Vec::new();
        let mut i = 0;
        while i < slots.len() {
            let (text, next) = self.item(slots, i, indent);
            lines.push(text);
            i = next;
        }
        lines
    }

    fn list(&self, id: ScopeId, indent: usize) -> String {
        let Some(scope) = self.tree.get(id) else {
            return "(list)".into();
        };
        let mut head = match &scope.label {
            Some(label) => format!("(scope {label}"),
            None => "(list".to_owned(),
        };
        let items = self.statements(&scope.slots, indent + 1);
        if scope.slots.iter().any(Slot::is_opcode) {
            let pad = INDENT.repeat(indent + 1);
            for item in &items {
                let _ = write!(head, "\n{pad}{item}");
            }
        } else {
            for item in &items {
                let _ = write!(head, " {item}");
            }
        }
        head.push(')');
        head
    }
}

/// Deterministic canonical text for a tree; parsing it rebuilds an equal tree
pub fn encode_text(tree: &ScopeTree) -> String {
    let writer = TextWriter { tree };
    let mut out = String::new();
    for line in writer.statements(&tree.root().slots, 0) {
        out.push_str(&line);
        out.push('\n');
    }
    out
}
