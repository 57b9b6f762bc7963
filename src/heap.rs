//! Object arena and mark-sweep collector.
//!
//! Every heap object lives in a slot arena owned by the VM and is referred to
//! by a dense [`Handle`]. The object header carries the class pointer, the
//! mark flag, and a next-link threading all live objects into a single chain;
//! the sweep phase walks that chain and unlinks anything the mark phase did
//! not reach. Cyclic graphs (class/metaclass knots, fiber caller chains) need
//! no special casing.
//!
//! The collector is synchronous: allocation may trigger a full collection, so
//! code that allocates more than one object before anchoring the first must
//! protect intermediates with the temp-root stack.

use tracing::debug;

use crate::value::{ObjData, UpvalueObj, Value};

/// Reference to a heap object: an index into the VM's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub fn for_test(raw: u32) -> Handle {
        Handle(raw)
    }
}

/// A heap object: header plus payload. The payload discriminant is the type
/// tag; `class` is null only for strings created before the String class
/// exists, which bootstrap repairs in a final pass.
#[derive(Debug)]
pub struct Obj {
    pub class: Option<Handle>,
    pub is_marked: bool,
    pub next: Option<Handle>,
    pub data: ObjData,
}

/// Collector tuning, filled from the host configuration.
#[derive(Debug, Clone, Copy)]
pub struct HeapTuning {
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: usize,
}

impl Default for HeapTuning {
    fn default() -> Self {
        Self {
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    /// Head of the all-objects chain.
    first: Option<Handle>,
    gray: Vec<Handle>,
    temp_roots: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    tuning: HeapTuning,
    /// Collection is deferred while nonzero (compiler-held values are not
    /// heap-reachable).
    pause_depth: u32,
}

impl Heap {
    pub fn new(tuning: HeapTuning) -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
            first: None,
            gray: Vec::new(),
            temp_roots: Vec::new(),
            bytes_allocated: 0,
            next_gc: tuning.initial_heap_size,
            tuning,
            pause_depth: 0,
        }
    }

    /// Link a new object into the arena and the all-objects chain.
    pub fn alloc(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        self.bytes_allocated += approx_size(&data);
        let obj = Obj {
            class,
            is_marked: false,
            next: self.first,
            data,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                Handle(index)
            }
            None => {
                self.slots.push(Some(obj));
                Handle((self.slots.len() - 1) as u32)
            }
        };
        self.first = Some(handle);
        handle
    }

    /// True when enough has been allocated that the caller should collect.
    pub fn wants_collect(&self) -> bool {
        self.pause_depth == 0 && self.bytes_allocated > self.next_gc
    }

    pub fn pause_collector(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_collector(&mut self) {
        debug_assert!(self.pause_depth > 0);
        self.pause_depth -= 1;
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.index()] {
            Some(obj) => obj,
            None => unreachable!("dangling handle"),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.index()] {
            Some(obj) => obj,
            None => unreachable!("dangling handle"),
        }
    }

    // Typed payload accessors. Callers check the kind first (or hold a handle
    // whose kind is invariant); a mismatch is a runtime bug, not user error.

    pub fn string(&self, handle: Handle) -> &crate::value::StrObj {
        match &self.get(handle).data {
            ObjData::Str(s) => s,
            _ => unreachable!("expected string"),
        }
    }

    pub fn list(&self, handle: Handle) -> &Vec<Value> {
        match &self.get(handle).data {
            ObjData::List(items) => items,
            _ => unreachable!("expected list"),
        }
    }

    pub fn list_mut(&mut self, handle: Handle) -> &mut Vec<Value> {
        match &mut self.get_mut(handle).data {
            ObjData::List(items) => items,
            _ => unreachable!("expected list"),
        }
    }

    pub fn map(&self, handle: Handle) -> &crate::value::MapObj {
        match &self.get(handle).data {
            ObjData::Map(map) => map,
            _ => unreachable!("expected map"),
        }
    }

    pub fn map_mut(&mut self, handle: Handle) -> &mut crate::value::MapObj {
        match &mut self.get_mut(handle).data {
            ObjData::Map(map) => map,
            _ => unreachable!("expected map"),
        }
    }

    pub fn range(&self, handle: Handle) -> crate::value::RangeObj {
        match &self.get(handle).data {
            ObjData::Range(range) => *range,
            _ => unreachable!("expected range"),
        }
    }

    pub fn module(&self, handle: Handle) -> &crate::value::ModuleObj {
        match &self.get(handle).data {
            ObjData::Module(module) => module,
            _ => unreachable!("expected module"),
        }
    }

    pub fn module_mut(&mut self, handle: Handle) -> &mut crate::value::ModuleObj {
        match &mut self.get_mut(handle).data {
            ObjData::Module(module) => module,
            _ => unreachable!("expected module"),
        }
    }

    pub fn fun(&self, handle: Handle) -> &crate::value::FnObj {
        match &self.get(handle).data {
            ObjData::Fn(fun) => fun,
            _ => unreachable!("expected function"),
        }
    }

    pub fn fun_mut(&mut self, handle: Handle) -> &mut crate::value::FnObj {
        match &mut self.get_mut(handle).data {
            ObjData::Fn(fun) => fun,
            _ => unreachable!("expected function"),
        }
    }

    pub fn closure(&self, handle: Handle) -> &crate::value::ClosureObj {
        match &self.get(handle).data {
            ObjData::Closure(closure) => closure,
            _ => unreachable!("expected closure"),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> &UpvalueObj {
        match &self.get(handle).data {
            ObjData::Upvalue(upvalue) => upvalue,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut UpvalueObj {
        match &mut self.get_mut(handle).data {
            ObjData::Upvalue(upvalue) => upvalue,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn class(&self, handle: Handle) -> &crate::value::ClassObj {
        match &self.get(handle).data {
            ObjData::Class(class) => class,
            _ => unreachable!("expected class"),
        }
    }

    pub fn class_mut(&mut self, handle: Handle) -> &mut crate::value::ClassObj {
        match &mut self.get_mut(handle).data {
            ObjData::Class(class) => class,
            _ => unreachable!("expected class"),
        }
    }

    pub fn instance(&self, handle: Handle) -> &crate::value::InstanceObj {
        match &self.get(handle).data {
            ObjData::Instance(instance) => instance,
            _ => unreachable!("expected instance"),
        }
    }

    pub fn instance_mut(&mut self, handle: Handle) -> &mut crate::value::InstanceObj {
        match &mut self.get_mut(handle).data {
            ObjData::Instance(instance) => instance,
            _ => unreachable!("expected instance"),
        }
    }

    pub fn fiber(&self, handle: Handle) -> &crate::value::FiberObj {
        match &self.get(handle).data {
            ObjData::Fiber(fiber) => fiber,
            _ => unreachable!("expected fiber"),
        }
    }

    pub fn fiber_mut(&mut self, handle: Handle) -> &mut crate::value::FiberObj {
        match &mut self.get_mut(handle).data {
            ObjData::Fiber(fiber) => fiber,
            _ => unreachable!("expected fiber"),
        }
    }

    pub fn foreign_mut(&mut self, handle: Handle) -> &mut crate::value::ForeignObj {
        match &mut self.get_mut(handle).data {
            ObjData::Foreign(foreign) => foreign,
            _ => unreachable!("expected foreign"),
        }
    }

    // Temp roots protect fresh objects across allocations that may collect.

    pub fn push_root(&mut self, handle: Handle) {
        self.temp_roots.push(handle);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    // Mark phase.

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark(handle);
        }
    }

    pub fn mark(&mut self, handle: Handle) {
        let obj = self.get_mut(handle);
        if obj.is_marked {
            return;
        }
        obj.is_marked = true;
        self.gray.push(handle);
    }

    pub fn mark_temp_roots(&mut self) {
        let roots: Vec<Handle> = self.temp_roots.clone();
        for handle in roots {
            self.mark(handle);
        }
    }

    /// Drain the gray worklist, marking each object's children.
    pub fn trace_references(&mut self) {
        let mut children: Vec<Handle> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        while let Some(handle) = self.gray.pop() {
            children.clear();
            child_values.clear();
            let obj = self.get(handle);
            if let Some(class) = obj.class {
                children.push(class);
            }
            match &obj.data {
                ObjData::Str(_) | ObjData::Range(_) | ObjData::Foreign(_) => {}
                ObjData::List(items) => child_values.extend_from_slice(items),
                ObjData::Map(map) => {
                    for (k, v) in &map.entries {
                        child_values.push(*k);
                        child_values.push(*v);
                    }
                }
                ObjData::Module(module) => {
                    child_values.extend_from_slice(&module.variables);
                }
                ObjData::Fn(fun) => {
                    child_values.extend_from_slice(&fun.constants);
                    children.push(fun.module);
                }
                ObjData::Closure(closure) => {
                    children.push(closure.fun);
                    children.extend_from_slice(&closure.upvalues);
                }
                ObjData::Upvalue(upvalue) => match upvalue {
                    UpvalueObj::Open { fiber, .. } => children.push(*fiber),
                    UpvalueObj::Closed(value) => child_values.push(*value),
                },
                ObjData::Class(class) => {
                    children.push(class.name);
                    if let Some(superclass) = class.superclass {
                        children.push(superclass);
                    }
                    child_values.push(class.attributes);
                    for method in &class.methods {
                        if let crate::value::Method::Block(closure) = method {
                            children.push(*closure);
                        }
                    }
                }
                ObjData::Instance(instance) => {
                    child_values.extend_from_slice(&instance.fields);
                }
                ObjData::Fiber(fiber) => {
                    child_values.extend_from_slice(&fiber.stack);
                    child_values.push(fiber.error);
                    for frame in &fiber.frames {
                        children.push(frame.closure);
                    }
                    children.extend_from_slice(&fiber.open_upvalues);
                    if let Some(caller) = fiber.caller {
                        children.push(caller);
                    }
                }
            }
            for i in 0..children.len() {
                self.mark(children[i]);
            }
            for i in 0..child_values.len() {
                self.mark_value(child_values[i]);
            }
        }
    }

    /// Unlink and free everything the mark phase did not reach, clear marks,
    /// and set the next collection threshold.
    pub fn sweep(&mut self) -> (usize, usize) {
        let before = self.bytes_allocated;
        let mut surviving = 0usize;
        let mut live_bytes = 0usize;

        // Rebuild the chain in place, dropping unmarked objects.
        let mut prev: Option<Handle> = None;
        let mut current = self.first;
        while let Some(handle) = current {
            let (marked, next) = {
                let obj = self.get(handle);
                (obj.is_marked, obj.next)
            };
            if marked {
                let obj = self.get_mut(handle);
                obj.is_marked = false;
                live_bytes += approx_size(&obj.data);
                surviving += 1;
                prev = Some(handle);
            } else {
                match prev {
                    Some(p) => self.get_mut(p).next = next,
                    None => self.first = next,
                }
                self.slots[handle.index()] = None;
                self.free.push(handle.0);
            }
            current = next;
        }

        self.bytes_allocated = live_bytes;
        let grown = live_bytes + live_bytes * self.tuning.heap_growth_percent / 100;
        self.next_gc = grown.max(self.tuning.min_heap_size);
        debug!(
            before_bytes = before,
            after_bytes = live_bytes,
            surviving, "swept heap"
        );
        (before, live_bytes)
    }

    /// Bootstrap repair pass: strings allocated before the String class was
    /// known carry a null class pointer. Walk the all-objects chain and point
    /// them at the now-known class.
    pub fn adopt_orphan_strings(&mut self, string_class: Handle) {
        let mut current = self.first;
        while let Some(handle) = current {
            let obj = self.get_mut(handle);
            if obj.class.is_none() && matches!(obj.data, ObjData::Str(_)) {
                obj.class = Some(string_class);
            }
            current = obj.next;
        }
    }

    /// Equality per the value model: identical encoding, plus byte-identical
    /// strings. All other heap objects compare by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        let (Value::Obj(ha), Value::Obj(hb)) = (a, b) else {
            return false;
        };
        match (&self.get(ha).data, &self.get(hb).data) {
            (ObjData::Str(sa), ObjData::Str(sb)) => {
                sa.hash() == sb.hash() && sa.bytes() == sb.bytes()
            }
            _ => false,
        }
    }

    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

/// Rough per-object footprint used for collector pacing. Precision is not
/// required; the growth-percent schedule absorbs the slack.
fn approx_size(data: &ObjData) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match data {
        ObjData::Str(s) => s.len(),
        ObjData::List(items) => items.capacity() * std::mem::size_of::<Value>(),
        ObjData::Map(map) => map.entries.capacity() * 2 * std::mem::size_of::<Value>(),
        ObjData::Range(_) | ObjData::Foreign(_) => 0,
        ObjData::Module(module) => {
            module.variables.capacity() * std::mem::size_of::<Value>()
                + module.variable_names.len() * 24
        }
        ObjData::Fn(fun) => {
            fun.code.capacity() * 16 + fun.constants.capacity() * std::mem::size_of::<Value>()
        }
        ObjData::Closure(closure) => closure.upvalues.capacity() * 4,
        ObjData::Upvalue(_) => 0,
        ObjData::Class(class) => class.methods.capacity() * std::mem::size_of::<crate::value::Method>(),
        ObjData::Instance(instance) => instance.fields.len() * std::mem::size_of::<Value>(),
        ObjData::Fiber(fiber) => {
            fiber.stack.capacity() * std::mem::size_of::<Value>() + fiber.frames.capacity() * 24
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StrObj;

    fn tiny_heap() -> Heap {
        Heap::new(HeapTuning {
            initial_heap_size: 1024,
            min_heap_size: 256,
            heap_growth_percent: 50,
        })
    }

    #[test]
    fn test_alloc_links_chain() {
        let mut heap = tiny_heap();
        let a = heap.alloc(None, ObjData::Str(StrObj::from_str("a")));
        let b = heap.alloc(None, ObjData::Str(StrObj::from_str("b")));
        assert_eq!(heap.first, Some(b));
        assert_eq!(heap.get(b).next, Some(a));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let mut heap = tiny_heap();
        let a = heap.alloc(None, ObjData::Str(StrObj::from_str("keep")));
        let _b = heap.alloc(None, ObjData::Str(StrObj::from_str("drop")));
        heap.mark(a);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.first, Some(a));
        assert_eq!(heap.get(a).next, None);
        // The freed slot is reused.
        let c = heap.alloc(None, ObjData::Str(StrObj::from_str("new")));
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.first, Some(c));
    }

    #[test]
    fn test_list_children_survive() {
        let mut heap = tiny_heap();
        let s = heap.alloc(None, ObjData::Str(StrObj::from_str("elem")));
        let list = heap.alloc(None, ObjData::List(vec![Value::Obj(s)]));
        heap.mark(list);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_orphan_string_adoption() {
        let mut heap = tiny_heap();
        let orphan = heap.alloc(None, ObjData::Str(StrObj::from_str("early")));
        let class_stand_in = heap.alloc(None, ObjData::Str(StrObj::from_str("String")));
        heap.adopt_orphan_strings(class_stand_in);
        assert_eq!(heap.get(orphan).class, Some(class_stand_in));
        assert_eq!(heap.get(class_stand_in).class, Some(class_stand_in));
    }

    #[test]
    fn test_string_equality_by_bytes() {
        let mut heap = tiny_heap();
        let a = heap.alloc(None, ObjData::Str(StrObj::from_str("same")));
        let b = heap.alloc(None, ObjData::Str(StrObj::from_str("same")));
        let c = heap.alloc(None, ObjData::Str(StrObj::from_str("other")));
        assert!(heap.values_equal(Value::Obj(a), Value::Obj(b)));
        assert!(!heap.values_equal(Value::Obj(a), Value::Obj(c)));
        assert!(heap.values_equal(Value::Num(1.0), Value::Num(1.0)));
        assert!(!heap.values_equal(Value::Null, Value::Bool(false)));
    }
}
