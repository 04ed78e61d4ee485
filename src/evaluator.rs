//! The execution engine.
//!
//! The engine keeps a stack of [`Frame`]s, one per active scope, each holding
//! the index of the next slot to run. The top frame is the current scope:
//!
//! - value and name slots standing on their own are inert
//! - an instruction reads its operand slots (running nested value
//!   instructions on the way), performs its effect and moves past them
//! - reaching the end of a scope pops its frame and resumes the one below
//!
//! `jump` always lands at slot 0 of its target. Jumping to the current scope
//! restarts it in place, and jumping to a scope already active lower on the
//! stack unwinds to that frame, so loops never grow the stack. Any other target
//! is entered as a new frame that returns just past the jump when it ends.
//!
//! `try` enters its target as a handler frame. A recoverable fault raised while
//! that frame (or anything above it) runs unwinds the stack to the scope that
//! executed `try`, binds the fault message to `error` there and carries on
//! after the `try`.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{ListHandle, ListRef, ScopeId, Slot, Value};
use crate::builtinops::{Opcode, SyscallTable, apply_math, count_operand};
use crate::config::RuntimeConfig;
use crate::heap::{ElemType, HeapStore};
use crate::host::Host;
use crate::intooperation::IntoSyscall;
use crate::scope::ScopeTree;
use crate::svmp::parse_number_literal;
use crate::{Error, Fault};

/// Name bound in the catching scope when a `try` handler intercepts a fault
pub const ERROR_BINDING: &str = "error";

/// Variable bindings of every scope, indexed by scope ID
#[derive(Debug, Clone, Default)]
pub struct Environment {
    bindings: Vec<HashMap<Rc<str>, Value>>,
}

impl Environment {
    pub(crate) fn new(scopes: usize) -> Self {
        Environment {
            bindings: vec![HashMap::new(); scopes],
        }
    }

    /// Bind `name` in `scope` itself, never in an ancestor
    pub(crate) fn define(&mut self, scope: ScopeId, name: Rc<str>, value: Value) {
        if let Some(table) = self.bindings.get_mut(scope) {
            table.insert(name, value);
        }
    }

    /// Resolve `name` starting at `scope` and walking up the parent chain
    pub fn lookup(&self, tree: &ScopeTree, scope: ScopeId, name: &str) -> Option<&Value> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let Some(value) = self.bindings.get(id).and_then(|table| table.get(name)) {
                return Some(value);
            }
            current = tree.parent(id);
        }
        None
    }

    /// Drop the bindings of one scope, returning how many there were
    pub(crate) fn release(&mut self, scope: ScopeId) -> usize {
        self.bindings
            .get_mut(scope)
            .map_or(0, |table| std::mem::take(table).len())
    }
}

/// An active scope and its cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub scope: ScopeId,
    /// Next slot to run
    pub index: usize,
    /// Entered by `try`
    pub handler: bool,
}

impl Frame {
    fn enter(scope: ScopeId, handler: bool) -> Self {
        Frame {
            scope,
            index: 0,
            handler,
        }
    }
}

/// Result of running a program to completion
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Code passed to `exit`, 0 when the root scope ran off its end
    pub exit_code: i32,
    /// Last inert value slot or top-level value instruction result
    pub value: Option<Value>,
}

/// Control-flow effect of one top-level instruction
#[derive(Debug)]
enum Flow {
    Next(usize),
    Transfer {
        target: ScopeId,
        resume: usize,
        handler: bool,
    },
    Exit(i32),
}

pub struct Engine<H: Host> {
    /// The program as loaded; `run` starts every execution from it
    program: ScopeTree,
    /// Working copy that `set` on scope lists writes into
    tree: ScopeTree,
    host: H,
    config: RuntimeConfig,
    syscalls: SyscallTable,
    env: Environment,
    heap: HeapStore,
    frames: Vec<Frame>,
    steps: u64,
    last_value: Option<Value>,
}

impl<H: Host> std::fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scopes", &self.tree.len())
            .field("frames", &self.frames)
            .field("steps", &self.steps)
            .field("syscalls", &self.syscalls)
            .finish_non_exhaustive()
    }
}

impl<H: Host> Engine<H> {
    pub fn new(tree: ScopeTree, host: H, config: RuntimeConfig) -> Self {
        let env = Environment::new(tree.len());
        Engine {
            program: tree.clone(),
            tree,
            host,
            config,
            syscalls: SyscallTable::default(),
            env,
            heap: HeapStore::with_limit(config.max_heap_slots),
            frames: Vec::new(),
            steps: 0,
            last_value: None,
        }
    }

    /// Register a syscall that works on raw operand values
    pub fn register_syscall<F>(&mut self, id: u32, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, Fault> + 'static,
    {
        self.syscalls.register(id, name, func);
    }

    /// Register a plain Rust function as a syscall.
    ///
    /// ```
    /// use slotvm::{CaptureHost, Engine, RuntimeConfig, compile_text};
    ///
    /// fn hypot(a: f64, b: f64) -> f64 {
    ///     (a * a + b * b).sqrt()
    /// }
    ///
    /// let config = RuntimeConfig::default();
    /// let tree = compile_text("(println (syscall 7 3 4))", &config).unwrap();
    /// let mut engine = Engine::new(tree, CaptureHost::new(), config);
    /// engine.register_typed_syscall::<_, (f64, f64), f64>(7, "hypot", hypot);
    /// engine.run().unwrap();
    /// assert_eq!(engine.host().transcript, "5\n");
    /// ```
    pub fn register_typed_syscall<F, Args, R>(&mut self, id: u32, name: &str, func: F)
    where
        F: IntoSyscall<Args, R> + 'static,
    {
        self.syscalls.register_typed(id, name, func);
    }

    /// The loaded program, unaffected by runs
    pub fn tree(&self) -> &ScopeTree {
        &self.program
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn heap(&self) -> &HeapStore {
        &self.heap
    }

    /// Run the program from slot 0 of the root scope until it ends, exits or
    /// raises a fault no handler takes.
    pub fn run(&mut self) -> Result<Outcome, Error> {
        self.tree.clone_from(&self.program);
        self.env = Environment::new(self.tree.len());
        self.heap = HeapStore::with_limit(self.config.max_heap_slots);
        self.frames = vec![Frame::enter(0, false)];
        self.steps = 0;
        self.last_value = None;
        tracing::debug!(scopes = self.tree.len(), "run started");

        while let Some(frame) = self.frames.last().copied() {
            let len = self.tree.get(frame.scope).map_or(0, |s| s.slots.len());
            if frame.index >= len {
                self.frames.pop();
                tracing::trace!(scope = frame.scope, "scope finished");
                continue;
            }

            let result = self
                .step(frame.scope, frame.index)
                .and_then(|flow| self.apply(flow));
            match result {
                Ok(None) => {}
                Ok(Some(code)) => return Ok(self.finish(code)),
                Err(fault) => self.recover(fault, frame.scope, frame.index)?,
            }
        }
        Ok(self.finish(0))
    }

    /// Tear down every scope children-first, then the heap
    fn finish(&mut self, exit_code: i32) -> Outcome {
        self.frames.clear();
        let mut released = 0;
        for id in self.tree.teardown_order() {
            let count = self.env.release(id);
            if count > 0 {
                tracing::trace!(scope = id, bindings = count, "scope released");
            }
            released += count;
        }
        let leaked = self.heap.teardown();
        tracing::debug!(
            exit_code,
            steps = self.steps,
            bindings = released,
            heap_lists = leaked,
            "program finished"
        );
        Outcome {
            exit_code,
            value: self.last_value.take(),
        }
    }

    /// Hand a fault to the innermost handler, or fail the run
    fn recover(&mut self, fault: Fault, scope: ScopeId, slot: usize) -> Result<(), Error> {
        let handler = self
            .frames
            .iter()
            .rposition(|f| f.handler)
            .filter(|_| fault.is_recoverable());
        match handler {
            Some(h) if h > 0 => {
                self.frames.truncate(h);
                let catcher = self.frames[h - 1].scope;
                tracing::debug!(%fault, scope, slot, catcher, "fault caught");
                self.env
                    .define(catcher, Rc::from(ERROR_BINDING), Value::from(fault.to_string()));
                Ok(())
            }
            _ => {
                tracing::debug!(%fault, scope, slot, "unhandled fault");
                self.finish(1);
                Err(Error::Runtime { scope, slot, fault })
            }
        }
    }

    fn apply(&mut self, flow: Flow) -> Result<Option<i32>, Fault> {
        let Some(top) = self.frames.last_mut() else {
            return Ok(None);
        };
        match flow {
            Flow::Next(next) => top.index = next,
            Flow::Exit(code) => return Ok(Some(code)),
            Flow::Transfer {
                target,
                resume,
                handler,
            } => {
                top.index = resume;
                self.transfer(target, handler)?;
            }
        }
        Ok(None)
    }

    fn transfer(&mut self, target: ScopeId, handler: bool) -> Result<(), Fault> {
        if !handler && let Some(at) = self.frames.iter().rposition(|f| f.scope == target) {
            // the current scope or an active one lower down: restart it
            self.frames.truncate(at + 1);
            self.frames[at].index = 0;
            tracing::trace!(target, depth = self.frames.len(), "jump (restart)");
            return Ok(());
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(Fault::LimitExceeded(format!(
                "more than {} active scope frames",
                self.config.max_frames
            )));
        }
        self.frames.push(Frame::enter(target, handler));
        tracing::trace!(target, handler, depth = self.frames.len(), "enter scope");
        Ok(())
    }

    fn slot(&self, scope: ScopeId, index: usize) -> Result<Slot, Fault> {
        self.tree.slot(scope, index).cloned().ok_or_else(|| {
            Fault::TypeMismatch(format!("slot {index} of scope {scope} is missing"))
        })
    }

    fn count_steps(&mut self) -> Result<(), Fault> {
        self.steps += 1;
        match self.config.step_limit {
            Some(limit) if self.steps > limit => Err(Fault::LimitExceeded(format!(
                "step limit of {limit} instructions reached"
            ))),
            _ => Ok(()),
        }
    }

    /// Run the slot at `index` of `scope` as a statement
    fn step(&mut self, scope: ScopeId, index: usize) -> Result<Flow, Fault> {
        let op = match self.slot(scope, index)? {
            Slot::Opcode(op) => op,
            Slot::Value(value) => {
                self.last_value = Some(value);
                return Ok(Flow::Next(index + 1));
            }
            Slot::Name(_) => return Ok(Flow::Next(index + 1)),
        };
        self.count_steps()?;
        let pos = index + 1;

        match op {
            Opcode::Set => {
                let name = match self.slot(scope, pos)? {
                    Slot::Name(name) => name,
                    other => {
                        return Err(Fault::TypeMismatch(format!(
                            "set expects a variable name, found {other:?}"
                        )));
                    }
                };
                let (value, next) = self.operand(scope, pos + 1)?;
                tracing::trace!(scope, name = %name, %value, "set");
                self.env.define(scope, name, value);
                Ok(Flow::Next(next))
            }
            Opcode::SetAt => {
                let (list, next) = self.operand(scope, pos)?;
                let (at, next) = self.operand(scope, next)?;
                let (value, next) = self.operand(scope, next)?;
                self.set_element(list.as_list()?, at.as_number()?, value)?;
                Ok(Flow::Next(next))
            }
            Opcode::Print | Opcode::Println => {
                let (value, next) = self.operand(scope, pos)?;
                let text = self.render(&value)?;
                self.host.print(&text, op == Opcode::Println)?;
                Ok(Flow::Next(next))
            }
            Opcode::WriteFile => {
                let (path, next) = self.operand(scope, pos)?;
                let (contents, next) = self.operand(scope, next)?;
                let contents = self.render(&contents)?;
                self.host.write_file(path.as_str()?, &contents)?;
                Ok(Flow::Next(next))
            }
            Opcode::Free => {
                let (list, next) = self.operand(scope, pos)?;
                match list.as_list()?.handle {
                    ListHandle::Heap(id) => self.heap.free(id)?,
                    ListHandle::Scope(id) => {
                        return Err(Fault::TypeMismatch(format!(
                            "scope list {id} is part of the program and cannot be freed"
                        )));
                    }
                }
                Ok(Flow::Next(next))
            }
            Opcode::Exit => {
                let (code, _) = self.operand(scope, pos)?;
                let code = code.as_number()?.trunc() as i32;
                tracing::debug!(code, scope, "exit");
                Ok(Flow::Exit(code))
            }
            Opcode::Jump => {
                let target = self.target(scope, pos)?;
                Ok(Flow::Transfer {
                    target,
                    resume: pos + 1,
                    handler: false,
                })
            }
            Opcode::Try => {
                let target = self.target(scope, pos)?;
                Ok(Flow::Transfer {
                    target,
                    resume: pos + 1,
                    handler: true,
                })
            }
            Opcode::IfLtJump => {
                let (lhs, next) = self.operand(scope, pos)?;
                let (rhs, next) = self.operand(scope, next)?;
                let target = self.target(scope, next)?;
                if lhs.as_number()? < rhs.as_number()? {
                    Ok(Flow::Transfer {
                        target,
                        resume: next + 1,
                        handler: false,
                    })
                } else {
                    Ok(Flow::Next(next + 1))
                }
            }
            _ => {
                let (value, next) = self.evaluate(scope, index, op)?;
                self.last_value = Some(value);
                Ok(Flow::Next(next))
            }
        }
    }

    /// Read the expression operand starting at `pos`, returning its value and
    /// the index just past it
    fn operand(&mut self, scope: ScopeId, pos: usize) -> Result<(Value, usize), Fault> {
        match self.slot(scope, pos)? {
            Slot::Value(value) => Ok((value, pos + 1)),
            Slot::Name(name) => self
                .env
                .lookup(&self.tree, scope, &name)
                .cloned()
                .map(|value| (value, pos + 1))
                .ok_or_else(|| Fault::UnboundName(name.to_string())),
            Slot::Opcode(op) => self.evaluate(scope, pos, op),
        }
    }

    fn operands(
        &mut self,
        scope: ScopeId,
        mut pos: usize,
        count: usize,
    ) -> Result<(Vec<Value>, usize), Fault> {
        // a counted opcode cannot have more operands than slots remain
        let remaining = self.tree.get(scope).map_or(0, |s| s.slots.len().saturating_sub(pos));
        let mut values = Vec::with_capacity(count.min(remaining));
        for _ in 0..count {
            let (value, next) = self.operand(scope, pos)?;
            values.push(value);
            pos = next;
        }
        Ok((values, pos))
    }

    /// Scope ID stored in a jump target slot
    fn target(&self, scope: ScopeId, pos: usize) -> Result<ScopeId, Fault> {
        let n = match self.slot(scope, pos)? {
            Slot::Value(Value::Number(n)) => n,
            other => {
                return Err(Fault::TypeMismatch(format!(
                    "jump target must be a scope id, found {other:?}"
                )));
            }
        };
        let id = (n >= 0.0 && n.fract() == 0.0).then_some(n as usize);
        match id.filter(|&id| id < self.tree.len()) {
            Some(id) => Ok(id),
            None => Err(Fault::InvalidJumpTarget(n.to_string())),
        }
    }

    /// Run a value-producing instruction whose opcode sits at `at`
    fn evaluate(&mut self, scope: ScopeId, at: usize, op: Opcode) -> Result<(Value, usize), Fault> {
        let spec = op.spec();
        let (count, pos) = if spec.is_counted() {
            let count = match self.slot(scope, at + 1)? {
                Slot::Value(Value::Number(n)) => count_operand(n, "operand count")?,
                other => {
                    return Err(Fault::TypeMismatch(format!(
                        "{} expects an operand count, found {other:?}",
                        op.mnemonic()
                    )));
                }
            };
            (count, at + 2)
        } else {
            (spec.operands.len(), at + 1)
        };
        let (args, next) = self.operands(scope, pos, count)?;

        let value = match (op, args.as_slice()) {
            (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div, _) => {
                let numbers = args
                    .iter()
                    .map(Value::as_number)
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Number(apply_math(op, &numbers)?)
            }
            (Opcode::Get, [list, index]) => self.get_element(list.as_list()?, index.as_number()?)?,
            (Opcode::Length, [list]) => Value::Number(self.length(list.as_list()?)? as f64),
            (Opcode::Read, []) => self.read()?,
            (Opcode::ReadFile, [path]) => Value::from(self.host.read_file(path.as_str()?)?),
            (Opcode::Alloc, [elem, count]) => {
                let elem = ElemType::parse(elem.as_str()?)?;
                let count = count_operand(count.as_number()?, "alloc count")?;
                Value::List(self.heap.alloc(elem, count)?)
            }
            (Opcode::Realloc, [list, count]) => {
                let count = count_operand(count.as_number()?, "realloc count")?;
                match list.as_list()?.handle {
                    ListHandle::Heap(id) => Value::List(self.heap.realloc(id, count)?),
                    ListHandle::Scope(id) => {
                        return Err(Fault::TypeMismatch(format!(
                            "scope list {id} has a fixed length and cannot be resized"
                        )));
                    }
                }
            }
            (Opcode::Time, []) => Value::Number(self.host.now()),
            (Opcode::Syscall, [id, rest @ ..]) => self.syscalls.call(id.as_number()?, rest)?,
            _ => {
                return Err(Fault::TypeMismatch(format!(
                    "{} does not produce a value with {} operand(s)",
                    op.mnemonic(),
                    args.len()
                )));
            }
        };
        Ok((value, next))
    }

    fn read(&mut self) -> Result<Value, Fault> {
        let Some(line) = self.host.read_line()? else {
            return Err(Fault::Io("end of input".into()));
        };
        Ok(match parse_number_literal(line.trim()) {
            Some(n) => Value::Number(n),
            None => Value::from(line),
        })
    }

    fn length(&self, list: ListRef) -> Result<usize, Fault> {
        match list.handle {
            ListHandle::Scope(id) => self
                .tree
                .get(id)
                .map(|s| s.slots.len())
                .ok_or_else(|| Fault::InvalidJumpTarget(id.to_string())),
            ListHandle::Heap(id) => self.heap.len(id),
        }
    }

    fn get_element(&self, list: ListRef, index: f64) -> Result<Value, Fault> {
        match list.handle {
            ListHandle::Scope(id) => self.tree.get_value(id, index),
            ListHandle::Heap(id) => self.heap.get(id, index),
        }
    }

    fn set_element(&mut self, list: ListRef, index: f64, value: Value) -> Result<(), Fault> {
        match list.handle {
            ListHandle::Scope(id) => self.tree.set_value(id, index, value),
            ListHandle::Heap(id) => self.heap.set(id, index, value),
        }
    }

    /// Text written by `print`: strings raw, numbers in shortest form, lists
    /// as their elements in parentheses. A list that contains itself prints as
    /// `(...)` where it recurs, and output stops with `...` once
    /// `max_render_elements` elements have been written.
    fn render(&self, value: &Value) -> Result<String, Fault> {
        let mut out = String::new();
        let mut walk = RenderWalk {
            path: Vec::new(),
            budget: self.config.max_render_elements,
        };
        self.render_into(value, &mut out, &mut walk, false)?;
        Ok(out)
    }

    fn render_into(
        &self,
        value: &Value,
        out: &mut String,
        walk: &mut RenderWalk,
        nested: bool,
    ) -> Result<(), Fault> {
        use std::fmt::Write;

        match value {
            Value::String(s) if !nested => out.push_str(s),
            Value::Number(_) | Value::String(_) => {
                let _ = write!(out, "{value}");
            }
            Value::List(list)
                if walk.path.contains(&list.handle)
                    || walk.path.len() >= self.config.max_parse_depth =>
            {
                out.push_str("(...)");
            }
            Value::List(list) => {
                let items: Vec<Slot> = match list.handle {
                    ListHandle::Scope(id) => self
                        .tree
                        .get(id)
                        .map(|s| s.slots.to_vec())
                        .unwrap_or_default(),
                    ListHandle::Heap(id) => {
                        let len = self.heap.len(id)?;
                        (0..len.min(walk.budget.saturating_add(1)))
                            .map(|i| self.heap.get(id, i as f64).map(Slot::Value))
                            .collect::<Result<_, _>>()?
                    }
                };
                walk.path.push(list.handle);
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    if walk.budget == 0 {
                        out.push_str("...");
                        break;
                    }
                    walk.budget -= 1;
                    match item {
                        Slot::Value(inner) => self.render_into(inner, out, walk, true)?,
                        other => {
                            let _ = write!(out, "{other}");
                        }
                    }
                }
                out.push(')');
                walk.path.pop();
            }
        }
        Ok(())
    }
}

/// Lists currently being printed and the elements left to print
struct RenderWalk {
    path: Vec<ListHandle>,
    budget: usize,
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::host::CaptureHost;
    use crate::svmp::compile_text;
    use pretty_assertions::assert_eq;

    /// Expected result of running a program
    #[derive(Debug)]
    enum Expect {
        /// Printed transcript and exit code
        Prints(&'static str, i32),
        /// Runtime error whose message contains the fragment
        Fails(&'static str),
    }
    use Expect::{Fails, Prints};

    fn run_source(source: &str, host: CaptureHost) -> (Result<Outcome, Error>, CaptureHost) {
        let config = RuntimeConfig::default().with_step_limit(10_000);
        let tree = compile_text(source, &config).unwrap();
        let mut engine = Engine::new(tree, host, config);
        let result = engine.run();
        (result, engine.into_host())
    }

    fn execute_test_case(source: &str, expected: &Expect, test_id: &str) {
        let (result, host) = run_source(source, CaptureHost::new());
        match (result, expected) {
            (Ok(outcome), Prints(text, code)) => {
                assert_eq!(host.transcript, *text, "{test_id}: transcript of {source}");
                assert_eq!(outcome.exit_code, *code, "{test_id}: exit code");
            }
            (Err(err), Fails(fragment)) => {
                let msg = err.to_string();
                assert!(
                    msg.contains(fragment),
                    "{test_id}: '{msg}' lacks '{fragment}' for {source}"
                );
            }
            (Ok(_), Fails(fragment)) => {
                panic!("{test_id}: expected fault '{fragment}', transcript {:?}", host.transcript)
            }
            (Err(err), Prints(..)) => panic!("{test_id}: unexpected error {err} for {source}"),
        }
    }

    #[test]
    fn test_programs_data_driven() {
        let test_cases: Vec<(&str, Expect)> = vec![
            // printing
            ("(print 1) (print \" \") (println \"a\")", Prints("1 a\n", 0)),
            ("(println 2.5) (println (sub 4))", Prints("2.5\n-4\n", 0)),
            ("(println (list 1 \"a\" (list 2)))", Prints("(1 \"a\" (2))\n", 0)),
            // math
            ("(println (add 1 2 3))", Prints("6\n", 0)),
            ("(println (mul 2 (add 1 2)))", Prints("6\n", 0)),
            ("(println (div 1 4))", Prints("0.25\n", 0)),
            ("(println (div 1 0))", Fails("MathError: division by zero")),
            ("(println (add 1 \"x\"))", Fails("TypeMismatchError")),
            // bindings
            ("(set x 5) (set x (add x 1)) (println x)", Prints("6\n", 0)),
            ("(println y)", Fails("UnboundNameError: 'y'")),
            // exit stops immediately
            ("(println 1) (exit 3) (println 2)", Prints("1\n", 3)),
            ("(exit 2.9)", Prints("", 2)),
            // containers
            ("(set l (list 1 2 3)) (println (length l)) (println (get l 1))", Prints("3\n2\n", 0)),
            ("(set l (list 1 2 3)) (set l 0 9) (println l)", Prints("(9 2 3)\n", 0)),
            ("(set l (list 1 2 3)) (println (get l 5))", Fails("IndexError: index 5")),
            ("(set l (list 1 2 3)) (println (get l -1))", Fails("IndexError")),
            ("(println (length 3))", Fails("TypeMismatchError: expected a list")),
            // heap
            ("(set h (alloc \"number\" 2)) (set h 1 7) (println h)", Prints("(0 7)\n", 0)),
            ("(set h (alloc \"string\" 1)) (println (length h))", Prints("1\n", 0)),
            (
                "(set h (alloc \"number\" 1)) (set h (realloc h 3)) (println h)",
                Prints("(0 0 0)\n", 0),
            ),
            ("(set h (alloc \"number\" 1)) (free h) (println (get h 0))", Fails("UseAfterFreeError")),
            ("(set h (alloc \"number\" 1)) (free h) (free h)", Fails("UseAfterFreeError")),
            ("(set h (alloc \"bool\" 1))", Fails("unknown element type 'bool'")),
            ("(set l (list 1)) (free l)", Fails("cannot be freed")),
            ("(set h (alloc \"number\" 4000000000))", Fails("LimitExceeded: heap limit")),
            (
                "(set h (alloc \"number\" 1)) (set h (realloc h 4000000000))",
                Fails("LimitExceeded: heap limit"),
            ),
            // lists that contain themselves
            (
                "(set l (list 0 0)) (set l 0 l) (set l 1 l) (println l)",
                Prints("((...) (...))\n", 0),
            ),
            (
                "(set h (alloc \"list\" 2)) (set h 0 h) (set h 1 h) (println h)",
                Prints("((...) (...))\n", 0),
            ),
            (
                "(set o (list 1 (list 2))) (set i (get o 1)) (set i 0 o) (println o)",
                Prints("(1 ((...)))\n", 0),
            ),
            // syscalls
            ("(println (syscall 0 \"logged\" 2))", Prints("logged\n", 0)),
            ("(syscall 99)", Fails("SyscallError: unknown syscall id 99")),
            // jumps
            ("(jump 7)", Fails("InvalidJumpTargetError: no scope with id 7")),
            (
                "(jump s) (println \"back\") (scope s (println \"in s\"))",
                Prints("in s\nback\n", 0),
            ),
        ];

        for (i, (source, expected)) in test_cases.iter().enumerate() {
            execute_test_case(source, expected, &format!("#{}", i + 1));
        }
    }

    #[test]
    fn test_loop_counts_and_returns() {
        let source = r#"
            (set x 0)
            (set max 3)
            (jump loop)
            (print "Done!")
            (scope loop
              (println x)
              (set x (add x 1))
              (if (< x max) (jump loop)))
        "#;
        let (result, host) = run_source(source, CaptureHost::new());
        let outcome = result.unwrap();
        assert_eq!(host.lines(), vec!["0", "1", "2", "Done!"]);
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_set_binds_in_current_scope_only() {
        // the inner set shadows; the root binding is untouched
        let source = r#"
            (set x 1)
            (jump inner)
            (println x)
            (scope inner (set x 2) (println x))
        "#;
        let (result, host) = run_source(source, CaptureHost::new());
        result.unwrap();
        assert_eq!(host.lines(), vec!["2", "1"]);
    }

    #[test]
    fn test_lookup_is_upward_only() {
        // a binding made in a sibling scope is invisible
        let source = r#"
            (jump a)
            (jump b)
            (scope a (set secret 1))
            (scope b (println secret))
        "#;
        let (result, _) = run_source(source, CaptureHost::new());
        let err = result.unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::UnboundName(name)) if name == "secret"));
    }

    #[test]
    fn test_try_catches_recoverable_faults() {
        let source = r#"
            (try risky)
            (println error)
            (println "after")
            (scope risky (println "before") (println (div 1 0)) (println "unreachable"))
        "#;
        let (result, host) = run_source(source, CaptureHost::new());
        result.unwrap();
        assert_eq!(
            host.lines(),
            vec!["before", "MathError: division by zero", "after"]
        );
    }

    #[test]
    fn test_try_does_not_catch_fatal_faults() {
        let source = "(try risky) (scope risky (println missing))";
        let (result, _) = run_source(source, CaptureHost::new());
        let err = result.unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::UnboundName(_))));
    }

    #[test]
    fn test_fault_location() {
        let source = "(set l (list 1 2 3))\n(scope s (println 0) (println (get l 10)))\n(jump s)";
        let (result, _) = run_source(source, CaptureHost::new());
        match result.unwrap_err() {
            Error::Runtime { scope, slot, fault } => {
                // root is 0, `(list 1 2 3)` is 1, `s` is 2
                assert_eq!(scope, 2);
                assert_eq!(slot, 2);
                assert_eq!(fault, Fault::Index { index: 10.0, len: 3 });
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn test_io_through_host() {
        let host = CaptureHost::new()
            .with_input(["41", "hello"])
            .with_file("in.txt", "file body");
        let source = r#"
            (set n (read))
            (println (add n 1))
            (println (read))
            (write_file "out.txt" (read_file "in.txt"))
            (println (read))
        "#;
        let (result, host) = run_source(source, host);
        assert_eq!(host.lines(), vec!["42", "hello"]);
        assert_eq!(host.files.get("out.txt").map(String::as_str), Some("file body"));
        let err = result.unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::Io(msg)) if msg == "end of input"));
    }

    #[test]
    fn test_time_uses_host_clock() {
        let mut host = CaptureHost::new();
        host.clock = Some(1234.5);
        let (result, host) = run_source("(println (time))", host);
        result.unwrap();
        assert_eq!(host.transcript, "1234.5\n");
    }

    #[test]
    fn test_frame_limit() {
        // each scope enters the next; only three frames are allowed
        let source = "(jump a) (scope a (jump b)) (scope b (jump c)) (scope c (println 1))";
        let config = RuntimeConfig::default().with_max_frames(3);
        let tree = compile_text(source, &config).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config);
        let err = engine.run().unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::LimitExceeded(_))));

        let tree = compile_text(source, &config.with_max_frames(4)).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config.with_max_frames(4));
        engine.run().unwrap();
        assert_eq!(engine.host().transcript, "1\n");
    }

    #[test]
    fn test_step_limit_stops_infinite_loop() {
        let config = RuntimeConfig::default().with_step_limit(50);
        let tree = compile_text("(jump forever) (scope forever (jump forever))", &config).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config);
        let err = engine.run().unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::LimitExceeded(msg)) if msg.contains("50")));
    }

    #[test]
    fn test_typed_syscall_registration() {
        fn greet(who: &str) -> String {
            format!("hi {who}")
        }
        let config = RuntimeConfig::default();
        let tree = compile_text("(println (syscall 5 \"there\"))", &config).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config);
        engine.register_typed_syscall::<_, (&'static str,), String>(5, "greet", greet);
        engine.run().unwrap();
        assert_eq!(engine.host().transcript, "hi there\n");
    }

    #[test]
    fn test_teardown_releases_heap() {
        let config = RuntimeConfig::default();
        let tree = compile_text("(set h (alloc \"list\" 2)) (exit 0)", &config).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config);
        let outcome = engine.run().unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(engine.heap().live_count(), 0);
    }

    #[test]
    fn test_last_value() {
        let (result, _) = run_source("(set x 1) 42 (add x 1)", CaptureHost::new());
        assert_eq!(result.unwrap().value, Some(Value::from(2)));
    }

    #[test]
    fn test_print_stops_at_element_budget() {
        // c holds b twice and b holds a twice, so output doubles per level
        let source = r#"
(set a (alloc "number" 2))
(set b (alloc "list" 2)) (set b 0 a) (set b 1 a)
(set c (alloc "list" 2)) (set c 0 b) (set c 1 b)
(println c)
"#;
        let cases: Vec<(usize, &str)> = vec![
            (64, "(((0 0) (0 0)) ((0 0) (0 0)))\n"),
            (5, "(((0 0) (...)) ...)\n"),
            (0, "(...)\n"),
        ];
        for (budget, expected) in cases {
            let config = RuntimeConfig::default().with_max_render_elements(budget);
            let tree = compile_text(source, &config).unwrap();
            let mut engine = Engine::new(tree, CaptureHost::new(), config);
            engine.run().unwrap();
            assert_eq!(engine.host().transcript, expected, "budget {budget}");
        }
    }

    #[test]
    fn test_heap_slot_limit_from_config() {
        let source = "(set a (alloc \"number\" 6)) (free a) (set b (alloc \"number\" 6)) (println (length b)) (set c (alloc \"number\" 6))";
        let config = RuntimeConfig::default().with_max_heap_slots(10);
        let tree = compile_text(source, &config).unwrap();
        let mut engine = Engine::new(tree, CaptureHost::new(), config);
        let err = engine.run().unwrap_err();
        assert!(matches!(err.fault(), Some(Fault::LimitExceeded(_))));
        // freeing returned room for the second list
        assert_eq!(engine.host().transcript, "6\n");
    }

    #[test]
    fn test_runs_start_from_the_loaded_program() {
        let source = "(set l (list 1 2)) (println l) (set l 0 (add (get l 0) 10)) (set l 1 (alloc \"number\" 1))";
        let config = RuntimeConfig::default();
        let tree = compile_text(source, &config).unwrap();
        let mut engine = Engine::new(tree.clone(), CaptureHost::new(), config);
        engine.run().unwrap();
        engine.run().unwrap();
        assert_eq!(engine.host().transcript, "(1 2)\n(1 2)\n");

        // the stored heap list never reaches the public tree
        assert_eq!(engine.tree(), &tree);
        let bytes = crate::svmb::encode_binary(engine.tree());
        assert_eq!(crate::svmb::decode_binary(&bytes, &config).unwrap(), tree);
    }
}
