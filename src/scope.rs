//! The scope tree: an arena of chunk-allocated lists addressed by [`ScopeId`].
//!
//! Every list of a program is a scope. IDs are assigned in depth-first
//! pre-order by [`TreeBuilder`]: a list receives the next free ID when it is
//! opened, before any of its descendants, so the root is always `0` and a parent
//! always has a lower ID than its children. Both the text lowering and the
//! binary decoder build through the same builder, which also validates the
//! operand signature of every instruction before a tree can exist.

use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;

use crate::Fault;
use crate::ast::{ListHandle, ListRef, ScopeId, Slot, Value};
use crate::builtinops::{Opcode, Operand, count_operand, slot_index};

/// One list of the program
#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Allocated once; never grows or shrinks
    pub slots: Box<[Slot]>,
    /// Source-level name, only kept for text output
    pub label: Option<Rc<str>>,
}

/// Structural equality: labels are presentation only
impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.parent == other.parent
            && self.children == other.children
            && self.slots == other.slots
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

/// Flattened view of a scope for `inspect` style dumps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSummary {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub label: Option<String>,
    pub children: Vec<ScopeId>,
    pub slot_count: usize,
    pub slots: Vec<String>,
}

impl ScopeTree {
    pub fn root(&self) -> &Scope {
        &self.scopes[0]
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    /// Number of scopes, root included
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.scopes.get(id).and_then(|s| s.parent)
    }

    pub fn label_of(&self, id: ScopeId) -> Option<&str> {
        self.scopes.get(id).and_then(|s| s.label.as_deref())
    }

    pub fn find_label(&self, label: &str) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|s| s.label.as_deref() == Some(label))
            .map(|s| s.id)
    }

    /// Read slot `index` of scope `id`
    pub fn slot(&self, id: ScopeId, index: usize) -> Option<&Slot> {
        self.scopes.get(id).and_then(|s| s.slots.get(index))
    }

    /// Overwrite a value slot in place. Instruction and name slots are code and
    /// cannot be replaced.
    pub(crate) fn set_value(&mut self, id: ScopeId, index: f64, value: Value) -> Result<(), Fault> {
        let scope = self
            .scopes
            .get_mut(id)
            .ok_or_else(|| Fault::InvalidJumpTarget(id.to_string()))?;
        let i = slot_index(index, scope.slots.len())?;
        match &mut scope.slots[i] {
            Slot::Value(current) => {
                *current = value;
                Ok(())
            }
            other => Err(Fault::TypeMismatch(format!(
                "slot {i} of scope {id} holds {other:?}, not a value"
            ))),
        }
    }

    /// Read a value slot, failing for instruction and name slots
    pub fn get_value(&self, id: ScopeId, index: f64) -> Result<Value, Fault> {
        let scope = self
            .scopes
            .get(id)
            .ok_or_else(|| Fault::InvalidJumpTarget(id.to_string()))?;
        let i = slot_index(index, scope.slots.len())?;
        match &scope.slots[i] {
            Slot::Value(value) => Ok(value.clone()),
            other => Err(Fault::TypeMismatch(format!(
                "slot {i} of scope {id} holds {other:?}, not a value"
            ))),
        }
    }

    /// IDs ordered so that every child comes before its parent
    pub fn teardown_order(&self) -> Vec<ScopeId> {
        let mut order = Vec::with_capacity(self.scopes.len());
        let mut stack = vec![(0, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for &child in self.scopes[id].children.iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    pub fn summary(&self) -> Vec<ScopeSummary> {
        self.scopes
            .iter()
            .map(|s| ScopeSummary {
                id: s.id,
                parent: s.parent,
                label: s.label.as_deref().map(str::to_owned),
                children: s.children.clone(),
                slot_count: s.slots.len(),
                slots: s.slots.iter().map(ToString::to_string).collect(),
            })
            .collect()
    }
}

/// An instruction whose operands do not match its signature
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    /// Index of the offending slot within its scope
    pub slot: usize,
    pub message: String,
}

impl Malformed {
    fn new(slot: usize, message: impl Into<String>) -> Self {
        Malformed {
            slot,
            message: message.into(),
        }
    }
}

struct Pending {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    label: Option<Rc<str>>,
    slots: Option<Box<[Slot]>>,
}

/// Assigns pre-order IDs and collects validated scopes into a [`ScopeTree`]
pub struct TreeBuilder {
    pending: Vec<Pending>,
    labels: HashMap<Rc<str>, ScopeId>,
    max_operand_depth: usize,
}

impl TreeBuilder {
    pub fn new(max_operand_depth: usize) -> Self {
        TreeBuilder {
            pending: Vec::new(),
            labels: HashMap::new(),
            max_operand_depth,
        }
    }

    /// Reserve the next ID for a list whose slots are not built yet.
    ///
    /// Must be called for a list before any of its nested lists.
    pub fn open_scope(
        &mut self,
        parent: Option<ScopeId>,
        label: Option<&str>,
    ) -> Result<ScopeId, String> {
        let id = self.pending.len();
        if let Some(parent) = parent
            && !self.pending.get(parent).is_some_and(|p| p.slots.is_none())
        {
            return Err(format!("scope {parent} is not open"));
        }
        let label: Option<Rc<str>> = label.map(Rc::from);
        if let Some(label) = &label {
            if let Some(existing) = self.labels.get(label) {
                return Err(format!(
                    "scope label '{label}' already names scope {existing}"
                ));
            }
            self.labels.insert(label.clone(), id);
        }
        if let Some(p) = parent.and_then(|parent| self.pending.get_mut(parent)) {
            p.children.push(id);
        }
        self.pending.push(Pending {
            parent,
            children: Vec::new(),
            label,
            slots: None,
        });
        Ok(id)
    }

    /// Validate and store the slots of an open list, returning a reference to it
    pub fn close_scope(&mut self, id: ScopeId, slots: Vec<Slot>) -> Result<ListRef, Malformed> {
        validate_scope(&slots, self.max_operand_depth)?;
        let len = slots.len();
        match self.pending.get_mut(id) {
            Some(p) if p.slots.is_none() => p.slots = Some(slots.into_boxed_slice()),
            _ => return Err(Malformed::new(0, format!("scope {id} is not open"))),
        }
        Ok(ListRef::scope(id, len))
    }

    pub fn label_id(&self, label: &str) -> Option<ScopeId> {
        self.labels.get(label).copied()
    }

    /// Overwrite a value slot of an already closed list (label fix-ups)
    pub fn patch(&mut self, id: ScopeId, slot: usize, value: Value) -> Result<(), String> {
        if let Value::List(ListRef {
            handle: ListHandle::Heap(_),
            ..
        }) = value
        {
            return Err(format!("slot {slot} of scope {id} cannot hold a heap list"));
        }
        let target = self
            .pending
            .get_mut(id)
            .and_then(|p| p.slots.as_mut())
            .and_then(|slots| slots.get_mut(slot));
        match target {
            Some(Slot::Value(current)) => {
                *current = value;
                Ok(())
            }
            _ => Err(format!("cannot patch slot {slot} of scope {id}")),
        }
    }

    pub fn finish(self) -> Result<ScopeTree, String> {
        let mut scopes = Vec::with_capacity(self.pending.len());
        for (id, p) in self.pending.into_iter().enumerate() {
            let slots = p.slots.ok_or_else(|| format!("scope {id} was never closed"))?;
            scopes.push(Scope {
                id,
                parent: p.parent,
                children: p.children,
                slots,
                label: p.label,
            });
        }
        if scopes.is_empty() {
            return Err("program has no root list".into());
        }
        tracing::debug!(scopes = scopes.len(), "scope tree built");
        Ok(ScopeTree { scopes })
    }
}

/// Check every instruction of a scope against its operand signature
pub fn validate_scope(slots: &[Slot], max_depth: usize) -> Result<(), Malformed> {
    let mut i = 0;
    while i < slots.len() {
        i = match &slots[i] {
            Slot::Opcode(op) => check_instruction(slots, i, *op, max_depth)?,
            other => {
                check_value(other, i)?;
                i + 1
            }
        };
    }
    Ok(())
}

/// Heap lists only exist while a program runs
fn check_value(slot: &Slot, at: usize) -> Result<(), Malformed> {
    match slot {
        Slot::Value(Value::List(ListRef {
            handle: ListHandle::Heap(_),
            ..
        })) => Err(Malformed::new(at, "a runtime heap list cannot be part of a program")),
        _ => Ok(()),
    }
}

/// Operand count stored after a variadic opcode
pub(crate) fn read_count(slots: &[Slot], at: usize) -> Result<usize, Malformed> {
    match slots.get(at) {
        Some(Slot::Value(Value::Number(n))) => {
            count_operand(*n, "operand count").map_err(|f| Malformed::new(at, f.to_string()))
        }
        Some(other) => Err(Malformed::new(
            at,
            format!("expected an operand count, found {other:?}"),
        )),
        None => Err(Malformed::new(at, "missing operand count")),
    }
}

/// Validate the instruction at `at`, returning the index just past its operands
fn check_instruction(
    slots: &[Slot],
    at: usize,
    op: Opcode,
    depth: usize,
) -> Result<usize, Malformed> {
    if depth == 0 {
        return Err(Malformed::new(at, "operand nesting too deep"));
    }
    let spec = op.spec();
    let mut pos = at + 1;
    let count = if spec.is_counted() {
        let n = read_count(slots, pos)?;
        pos += 1;
        n
    } else {
        spec.operands.len()
    };
    spec.arity
        .validate(count)
        .map_err(|msg| Malformed::new(at, format!("{}: {msg}", op.mnemonic())))?;

    for k in 0..count {
        let Some(slot) = slots.get(pos) else {
            return Err(Malformed::new(
                at,
                format!(
                    "{}: operand {} missing (scope ends)",
                    op.mnemonic(),
                    k + 1
                ),
            ));
        };
        pos = match (spec.operand_kind(k), slot) {
            (Operand::Expr, Slot::Value(_) | Slot::Name(_)) => {
                check_value(slot, pos)?;
                pos + 1
            }
            (Operand::Expr, Slot::Opcode(inner)) => {
                if !inner.spec().yields {
                    return Err(Malformed::new(
                        pos,
                        format!(
                            "{} produces no value and cannot be an operand of {}",
                            inner.mnemonic(),
                            op.mnemonic()
                        ),
                    ));
                }
                check_instruction(slots, pos, *inner, depth - 1)?
            }
            (Operand::Binder, Slot::Name(_)) => pos + 1,
            (Operand::Target, Slot::Value(Value::Number(_))) => pos + 1,
            (kind, other) => {
                let wanted = match kind {
                    Operand::Binder => "a name",
                    Operand::Target => "a scope id",
                    Operand::Expr => "a value",
                };
                return Err(Malformed::new(
                    pos,
                    format!(
                        "{}: operand {} must be {wanted}, found {other:?}",
                        op.mnemonic(),
                        k + 1
                    ),
                ));
            }
        };
    }
    Ok(pos)
}
