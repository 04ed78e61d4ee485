//! Runtime list storage for `alloc`, `free` and `realloc`.
//!
//! Heap lists are index-addressed like scopes, but live in their own store and
//! carry a liveness flag. A freed ID stays allocated as a tombstone so that any
//! surviving [`ListRef`](crate::ast::ListRef) to it reports a use-after-free
//! instead of silently reaching a different list.

use crate::ast::{HeapId, ListRef, Value};
use crate::builtinops::slot_index;
use crate::{Fault, MAX_HEAP_SLOTS};

/// Element kind chosen at `alloc` time; decides the fill value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Number,
    String,
    List,
}

impl ElemType {
    pub fn parse(name: &str) -> Result<Self, Fault> {
        match name {
            "number" => Ok(ElemType::Number),
            "string" => Ok(ElemType::String),
            "list" => Ok(ElemType::List),
            other => Err(Fault::TypeMismatch(format!(
                "unknown element type '{other}' (expected number, string or list)"
            ))),
        }
    }
}

#[derive(Debug)]
struct HeapList {
    elem: ElemType,
    slots: Vec<Value>,
    live: bool,
}

#[derive(Debug)]
pub struct HeapStore {
    lists: Vec<HeapList>,
    /// Live slots plus one per live list
    used: usize,
    limit: usize,
}

impl Default for HeapStore {
    fn default() -> Self {
        Self::with_limit(MAX_HEAP_SLOTS)
    }
}

impl HeapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses to hold more than `limit` slots in total
    pub fn with_limit(limit: usize) -> Self {
        HeapStore {
            lists: Vec::new(),
            used: 0,
            limit,
        }
    }

    /// Reserve room for `slots` slots spread over `lists` new lists
    fn charge(&mut self, slots: usize, lists: usize) -> Result<(), Fault> {
        let wanted = slots.saturating_add(lists);
        if wanted > self.limit.saturating_sub(self.used) {
            return Err(Fault::LimitExceeded(format!(
                "heap limit of {} slots reached ({} in use, {wanted} requested)",
                self.limit, self.used
            )));
        }
        self.used += wanted;
        Ok(())
    }

    fn default_value(&mut self, elem: ElemType) -> Value {
        match elem {
            ElemType::Number => Value::Number(0.0),
            ElemType::String => Value::from(""),
            ElemType::List => Value::List(self.push(ElemType::Number, Vec::new())),
        }
    }

    fn push(&mut self, elem: ElemType, slots: Vec<Value>) -> ListRef {
        let id = self.lists.len();
        let len = slots.len();
        self.lists.push(HeapList {
            elem,
            slots,
            live: true,
        });
        ListRef::heap(id, len)
    }

    /// Allocate `count` slots filled with the element default
    pub fn alloc(&mut self, elem: ElemType, count: usize) -> Result<ListRef, Fault> {
        // list elements are fresh empty lists of their own
        let nested = if elem == ElemType::List { count } else { 0 };
        self.charge(count, 1 + nested)?;
        let slots = (0..count).map(|_| self.default_value(elem)).collect();
        let list = self.push(elem, slots);
        tracing::trace!(id = ?list.handle, count, "alloc");
        Ok(list)
    }

    fn live(&self, id: HeapId) -> Result<&HeapList, Fault> {
        match self.lists.get(id) {
            Some(list) if list.live => Ok(list),
            Some(_) => Err(Fault::UseAfterFree(format!("heap list {id} was freed"))),
            None => Err(Fault::UseAfterFree(format!("heap list {id} was never allocated"))),
        }
    }

    fn live_mut(&mut self, id: HeapId) -> Result<&mut HeapList, Fault> {
        match self.lists.get_mut(id) {
            Some(list) if list.live => Ok(list),
            Some(_) => Err(Fault::UseAfterFree(format!("heap list {id} was freed"))),
            None => Err(Fault::UseAfterFree(format!("heap list {id} was never allocated"))),
        }
    }

    pub fn free(&mut self, id: HeapId) -> Result<(), Fault> {
        let list = self.live_mut(id)?;
        list.live = false;
        let released = std::mem::take(&mut list.slots).len() + 1;
        self.used = self.used.saturating_sub(released);
        tracing::trace!(id, "free");
        Ok(())
    }

    /// Resize a live list, keeping its prefix and filling new slots with the default
    pub fn realloc(&mut self, id: HeapId, count: usize) -> Result<ListRef, Fault> {
        let elem = self.live(id)?.elem;
        let current = self.live(id)?.slots.len();
        if count > current {
            let grow = count - current;
            let nested = if elem == ElemType::List { grow } else { 0 };
            self.charge(grow, nested)?;
        } else {
            self.used = self.used.saturating_sub(current - count);
        }
        let extra: Vec<Value> = (current..count).map(|_| self.default_value(elem)).collect();
        let list = self.live_mut(id)?;
        list.slots.truncate(count);
        list.slots.extend(extra);
        Ok(ListRef::heap(id, count))
    }

    pub fn len(&self, id: HeapId) -> Result<usize, Fault> {
        Ok(self.live(id)?.slots.len())
    }

    pub fn get(&self, id: HeapId, index: f64) -> Result<Value, Fault> {
        let list = self.live(id)?;
        let i = slot_index(index, list.slots.len())?;
        Ok(list.slots[i].clone())
    }

    pub fn set(&mut self, id: HeapId, index: f64, value: Value) -> Result<(), Fault> {
        let list = self.live_mut(id)?;
        let i = slot_index(index, list.slots.len())?;
        list.slots[i] = value;
        Ok(())
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.lists.get(id).is_some_and(|list| list.live)
    }

    /// Number of lists still live
    pub fn live_count(&self) -> usize {
        self.lists.iter().filter(|list| list.live).count()
    }

    /// Release every remaining list, returning how many were still live
    pub fn teardown(&mut self) -> usize {
        let live = self.live_count();
        self.lists.clear();
        self.used = 0;
        live
    }
}
