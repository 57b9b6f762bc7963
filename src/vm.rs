//! The virtual machine: interpreter loop, fiber control, class machinery.
//!
//! The VM owns the heap, the module table, the interned signature table, the
//! core class registry, and the host configuration. Execution always happens
//! on the current fiber; fiber primitives switch it and the dispatch loop
//! reloads its cached frame whenever that happens.
//!
//! Errors never unwind through Rust. A primitive that fails records a value
//! in the current fiber's error slot and returns `false`; the loop then walks
//! the caller chain looking for a fiber entered via `try`, delivering the
//! error as that call's result, or reports a runtime error with a stack trace
//! through the host callback when nothing catches it.

use std::collections::HashMap;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::trace;

use crate::compiler;
use crate::core;
use crate::heap::{Handle, Heap, HeapTuning};
use crate::opcodes::Op;
use crate::symbol::{SymbolId, SymbolTable};
use crate::value::{
    CallFrame, ClassObj, ClosureObj, FiberObj, FiberState, InstanceObj, Method, ModuleObj,
    ObjData, Primitive, StrObj, UpvalueObj, Value, FOREIGN_CLASS_FIELDS,
};

/// Outcome of running a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

/// What an error callback invocation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
    /// One stack frame of a runtime error: `line` and the module identify the
    /// frame, the message names the function.
    StackTrace,
}

pub type WriteFn = Box<dyn FnMut(&str)>;
pub type ErrorFn = Box<dyn FnMut(ErrorKind, Option<&str>, i32, &str)>;
pub type ResolveModuleFn = Box<dyn FnMut(&str, &str) -> String>;
pub type LoadModuleFn = Box<dyn FnMut(&str) -> Option<String>>;
pub type BindForeignMethodFn = Box<dyn FnMut(&str, &str, bool, &str) -> Option<Primitive>>;
pub type BindForeignClassFn = Box<dyn FnMut(&str, &str) -> ForeignClassMethods>;

/// Host hooks for a foreign class.
#[derive(Default)]
pub struct ForeignClassMethods {
    pub allocate: Option<Primitive>,
}

/// Host configuration supplied at VM construction. Everything is optional;
/// missing callbacks degrade (writes vanish, imports fail, `$` returns null).
pub struct Config {
    pub write: Option<WriteFn>,
    pub error: Option<ErrorFn>,
    pub resolve_module: Option<ResolveModuleFn>,
    pub load_module: Option<LoadModuleFn>,
    pub bind_foreign_method: Option<BindForeignMethodFn>,
    pub bind_foreign_class: Option<BindForeignClassFn>,
    /// Handler for the string `$` operator, with the primitive contract.
    pub dollar_operator: Option<Primitive>,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: usize,
}

impl Default for Config {
    fn default() -> Self {
        let tuning = HeapTuning::default();
        Config {
            write: None,
            error: None,
            resolve_module: None,
            load_module: None,
            bind_foreign_method: None,
            bind_foreign_class: None,
            dollar_operator: None,
            initial_heap_size: tuning.initial_heap_size,
            min_heap_size: tuning.min_heap_size,
            heap_growth_percent: tuning.heap_growth_percent,
        }
    }
}

/// Handles to the classes the dispatcher needs by kind. Filled during
/// bootstrap; every slot is `Some` before the first user instruction runs.
#[derive(Debug, Default)]
pub struct CoreClasses {
    pub object: Option<Handle>,
    pub class_: Option<Handle>,
    pub bool_: Option<Handle>,
    pub num: Option<Handle>,
    pub string: Option<Handle>,
    pub list: Option<Handle>,
    pub map: Option<Handle>,
    pub range: Option<Handle>,
    pub fn_: Option<Handle>,
    pub fiber: Option<Handle>,
    pub null: Option<Handle>,
    pub system: Option<Handle>,
}

impl CoreClasses {
    fn roots(&self) -> impl Iterator<Item = Handle> {
        [
            self.object,
            self.class_,
            self.bool_,
            self.num,
            self.string,
            self.list,
            self.map,
            self.range,
            self.fn_,
            self.fiber,
            self.null,
            self.system,
        ]
        .into_iter()
        .flatten()
    }
}

fn required(class: Option<Handle>) -> Handle {
    match class {
        Some(handle) => handle,
        None => unreachable!("core class used before bootstrap"),
    }
}

enum CallOutcome {
    /// Inline primitive finished; keep dispatching in the same frame.
    Continue,
    /// Frames or the current fiber changed; reload cached state.
    Reload,
    /// Leave the interpreter entirely.
    Finish(InterpretResult),
}

const MAX_CALL_FRAMES: usize = 16384;

pub struct Vm {
    pub heap: Heap,
    pub method_names: SymbolTable,
    /// Module table; the core module registers under the `None` key.
    pub modules: HashMap<Option<String>, Handle>,
    pub classes: CoreClasses,
    /// The current fiber. `None` when the VM is idle.
    pub fiber: Option<Handle>,
    pub config: Config,
    /// The module most recently touched by import machinery.
    last_module: Option<Handle>,
    start_time: Instant,
}

impl Vm {
    /// Build a VM and run the bootstrap protocol. Bootstrap interprets the
    /// embedded core script; any failure there is a defect in the runtime
    /// itself and is fatal.
    pub fn new(config: Config) -> Vm {
        let tuning = HeapTuning {
            initial_heap_size: config.initial_heap_size,
            min_heap_size: config.min_heap_size,
            heap_growth_percent: config.heap_growth_percent,
        };
        let mut vm = Vm {
            heap: Heap::new(tuning),
            method_names: SymbolTable::new(),
            modules: HashMap::new(),
            classes: CoreClasses::default(),
            fiber: None,
            config,
            last_module: None,
            start_time: Instant::now(),
        };
        core::initialize(&mut vm);
        vm
    }

    /// Compile and run `source` as the body of the named module.
    pub fn interpret(&mut self, module: &str, source: &str) -> InterpretResult {
        self.interpret_in(Some(module.to_string()), source)
    }

    pub(crate) fn interpret_in(&mut self, name: Option<String>, source: &str) -> InterpretResult {
        trace!(module = ?name, "interpret");
        let Some(closure) = self.compile_in_module(name, source) else {
            return InterpretResult::CompileError;
        };
        self.heap.push_root(closure);
        let fiber = self.new_fiber(closure);
        self.heap.fiber_mut(fiber).state = FiberState::Root;
        self.heap.pop_root();
        self.fiber = Some(fiber);
        self.run_interpreter()
    }

    /// Seconds of wall-clock time since the VM was created.
    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn core_module(&self) -> Handle {
        match self.modules.get(&None) {
            Some(&handle) => handle,
            None => unreachable!("core module missing"),
        }
    }

    /// Look up a module-level variable by name.
    pub fn find_variable(&self, module: Handle, name: &str) -> Option<Value> {
        let module = self.heap.module(module);
        module
            .find_variable(name)
            .map(|index| module.variables[index])
    }

    // ------------------------------------------------------------------
    // Allocation

    fn maybe_collect(&mut self) {
        if self.heap.wants_collect() {
            self.collect_garbage();
        }
    }

    pub fn alloc(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        self.maybe_collect();
        self.heap.alloc(class, data)
    }

    pub fn alloc_string(&mut self, string: StrObj) -> Handle {
        let class = self.classes.string;
        self.alloc(class, ObjData::Str(string))
    }

    pub fn string_value(&mut self, text: &str) -> Value {
        Value::Obj(self.alloc_string(StrObj::from_str(text)))
    }

    pub fn alloc_fn(&mut self, fun: crate::value::FnObj) -> Handle {
        let class = self.classes.fn_;
        self.alloc(class, ObjData::Fn(fun))
    }

    pub fn alloc_closure(&mut self, fun: Handle, upvalues: Vec<Handle>) -> Handle {
        let class = self.classes.fn_;
        self.alloc(class, ObjData::Closure(ClosureObj { fun, upvalues }))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Handle {
        let class = self.classes.list;
        self.alloc(class, ObjData::List(items))
    }

    pub fn alloc_map(&mut self) -> Handle {
        let class = self.classes.map;
        self.alloc(class, ObjData::Map(Default::default()))
    }

    pub fn alloc_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> Handle {
        let class = self.classes.range;
        self.alloc(
            class,
            ObjData::Range(crate::value::RangeObj {
                from,
                to,
                is_inclusive,
            }),
        )
    }

    /// A fiber ready to run `closure`: slot zero holds the closure and the
    /// first frame points at its start.
    pub fn new_fiber(&mut self, closure: Handle) -> Handle {
        let mut stack = Vec::with_capacity(16);
        stack.push(Value::Obj(closure));
        let fiber = FiberObj {
            stack,
            frames: vec![CallFrame {
                closure,
                ip: 0,
                stack_start: 0,
            }],
            open_upvalues: Vec::new(),
            caller: None,
            error: Value::Null,
            state: FiberState::Other,
        };
        let class = self.classes.fiber;
        self.alloc(class, ObjData::Fiber(fiber))
    }

    // ------------------------------------------------------------------
    // Garbage collection

    pub fn collect_garbage(&mut self) {
        trace!("collecting garbage");
        self.heap.mark_temp_roots();
        let modules: Vec<Handle> = self.modules.values().copied().collect();
        for module in modules {
            self.heap.mark(module);
        }
        let classes: Vec<Handle> = self.classes.roots().collect();
        for class in classes {
            self.heap.mark(class);
        }
        if let Some(fiber) = self.fiber {
            self.heap.mark(fiber);
        }
        if let Some(module) = self.last_module {
            self.heap.mark(module);
        }
        self.heap.trace_references();
        self.heap.sweep();
    }

    // ------------------------------------------------------------------
    // Host callbacks

    pub fn report_error(&mut self, kind: ErrorKind, module: Option<&str>, line: i32, message: &str) {
        if let Some(callback) = self.config.error.as_mut() {
            callback(kind, module, line, message);
        }
    }

    pub fn write_text(&mut self, text: &str) {
        if let Some(callback) = self.config.write.as_mut() {
            callback(text);
        }
    }

    // ------------------------------------------------------------------
    // Classes

    /// The class used for method dispatch on a value.
    pub fn class_of(&self, value: Value) -> Handle {
        match value {
            Value::Null | Value::Undefined => required(self.classes.null),
            Value::Bool(_) => required(self.classes.bool_),
            Value::Num(_) => required(self.classes.num),
            Value::Obj(handle) => match &self.heap.get(handle).data {
                ObjData::Str(_) => required(self.classes.string),
                ObjData::List(_) => required(self.classes.list),
                ObjData::Map(_) => required(self.classes.map),
                ObjData::Range(_) => required(self.classes.range),
                ObjData::Closure(_) => required(self.classes.fn_),
                ObjData::Fiber(_) => required(self.classes.fiber),
                ObjData::Class(_) | ObjData::Instance(_) | ObjData::Foreign(_) => {
                    match self.heap.get(handle).class {
                        Some(class) => class,
                        None => required(self.classes.object),
                    }
                }
                // Raw functions, upvalues, and modules are internal and never
                // method receivers.
                _ => required(self.classes.object),
            },
        }
    }

    /// A class with no metaclass wiring; bootstrap and `create_class` connect
    /// the rest.
    pub(crate) fn new_single_class(&mut self, num_fields: i32, name: Handle) -> Handle {
        let class = ClassObj {
            name,
            superclass: None,
            methods: Vec::new(),
            num_fields,
            attributes: Value::Null,
            foreign_alloc: None,
        };
        self.alloc(None, ObjData::Class(class))
    }

    /// Bind `superclass`, inheriting its fields and copying its method table
    /// so lookup stays a dense index.
    pub(crate) fn bind_superclass(&mut self, subclass: Handle, superclass: Handle) {
        let methods = self.heap.class(superclass).methods.clone();
        let super_fields = self.heap.class(superclass).num_fields;
        let class = self.heap.class_mut(subclass);
        class.superclass = Some(superclass);
        if class.num_fields != FOREIGN_CLASS_FIELDS && super_fields != FOREIGN_CLASS_FIELDS {
            class.num_fields += super_fields;
        }
        class.methods = methods;
    }

    /// Runtime class creation: expects `[name, superclass]` on the stack and
    /// replaces them with the new class, or records an error.
    fn create_class(&mut self, fiber: Handle, num_fields: i32) -> bool {
        let len = self.heap.fiber(fiber).stack.len();
        let name_value = self.heap.fiber(fiber).stack[len - 2];
        let superclass_value = self.heap.fiber(fiber).stack[len - 1];
        self.heap.fiber_mut(fiber).stack.pop();

        let name_handle = match name_value.as_handle() {
            Some(handle) => handle,
            None => unreachable!("class name is compiled as a string"),
        };
        let name_text = self.heap.string(name_handle).to_string_lossy();

        let superclass = match superclass_value.as_handle() {
            Some(handle) if matches!(self.heap.get(handle).data, ObjData::Class(_)) => handle,
            _ => {
                self.fiber_error(&format!(
                    "Class '{}' cannot inherit from a non-class object.",
                    name_text
                ));
                return false;
            }
        };
        let sealed = [
            self.classes.object,
            self.classes.class_,
            self.classes.bool_,
            self.classes.num,
            self.classes.string,
            self.classes.list,
            self.classes.map,
            self.classes.range,
            self.classes.fn_,
            self.classes.fiber,
            self.classes.null,
        ];
        if sealed.iter().flatten().any(|&s| s == superclass) {
            let super_name = self.class_name(superclass);
            self.fiber_error(&format!(
                "Class '{}' cannot inherit from built-in class '{}'.",
                name_text, super_name
            ));
            return false;
        }
        let super_fields = self.heap.class(superclass).num_fields;
        if super_fields == FOREIGN_CLASS_FIELDS {
            let super_name = self.class_name(superclass);
            self.fiber_error(&format!(
                "Class '{}' cannot inherit from foreign class '{}'.",
                name_text, super_name
            ));
            return false;
        }
        if num_fields == FOREIGN_CLASS_FIELDS && super_fields > 0 {
            self.fiber_error(&format!(
                "Foreign class '{}' may not inherit from a class with fields.",
                name_text
            ));
            return false;
        }
        if num_fields != FOREIGN_CLASS_FIELDS && num_fields + super_fields > 255 {
            self.fiber_error(&format!(
                "Class '{}' may not have more than 255 fields, including inherited ones.",
                name_text
            ));
            return false;
        }

        let class = self.new_class(superclass, num_fields, name_handle);
        let len = self.heap.fiber(fiber).stack.len();
        self.heap.fiber_mut(fiber).stack[len - 1] = Value::Obj(class);
        true
    }

    /// Build a class and its metaclass. The metaclass subclasses the
    /// superclass's metaclass, so class-side methods are inherited.
    pub(crate) fn new_class(
        &mut self,
        superclass: Handle,
        num_fields: i32,
        name: Handle,
    ) -> Handle {
        let name_text = self.heap.string(name).to_string_lossy();
        self.heap.push_root(name);
        let metaclass_name = self.alloc_string(StrObj::from_str(&format!(
            "{} metaclass",
            name_text
        )));
        self.heap.push_root(metaclass_name);
        let metaclass = self.new_single_class(0, metaclass_name);
        self.heap.pop_root();
        self.heap.push_root(metaclass);
        self.heap.get_mut(metaclass).class = self.classes.class_;
        let super_meta = match self.heap.get(superclass).class {
            Some(meta) => meta,
            None => required(self.classes.class_),
        };
        self.bind_superclass(metaclass, super_meta);

        let class = self.new_single_class(num_fields, name);
        self.heap.get_mut(class).class = Some(metaclass);
        self.heap.pop_root();
        self.heap.pop_root();
        self.heap.push_root(class);
        self.bind_superclass(class, superclass);
        self.heap.pop_root();
        class
    }

    pub(crate) fn class_name(&self, class: Handle) -> String {
        self.heap.string(self.heap.class(class).name).to_string_lossy()
    }

    /// Install a method in a class's table, rebasing a script method's field
    /// accesses past the inherited fields and patching its super calls.
    fn bind_method(
        &mut self,
        is_static: bool,
        symbol: SymbolId,
        module: Handle,
        class: Handle,
        method_value: Value,
    ) -> bool {
        let target = if is_static {
            match self.heap.get(class).class {
                Some(metaclass) => metaclass,
                None => unreachable!("class without metaclass"),
            }
        } else {
            class
        };
        let handle = match method_value.as_handle() {
            Some(handle) => handle,
            None => unreachable!("method value is a closure or signature string"),
        };
        let method = match &self.heap.get(handle).data {
            ObjData::Str(signature) => {
                let signature = signature.to_string_lossy();
                let class_name = self.class_name(class);
                let module_name = self
                    .heap
                    .module(module)
                    .name
                    .clone()
                    .unwrap_or_else(|| "core".to_string());
                let bound = match self.config.bind_foreign_method.as_mut() {
                    Some(bind) => bind(&module_name, &class_name, is_static, &signature),
                    None => None,
                };
                match bound {
                    Some(primitive) => Method::Foreign(primitive),
                    None => {
                        self.fiber_error(&format!(
                            "Could not find foreign method '{}' for class {} in module '{}'.",
                            signature, class_name, module_name
                        ));
                        return false;
                    }
                }
            }
            ObjData::Closure(_) => {
                self.rebase_method_code(target, handle);
                Method::Block(handle)
            }
            _ => unreachable!("method value is a closure or signature string"),
        };
        self.heap.class_mut(target).set_method(symbol, method);
        true
    }

    /// Field indexes in a method body are relative to the class's own fields;
    /// shift them past the inherited ones, and point super calls at the
    /// actual superclass.
    fn rebase_method_code(&mut self, class: Handle, closure: Handle) {
        let offset = match self.heap.class(class).superclass {
            Some(superclass) => {
                let fields = self.heap.class(superclass).num_fields;
                if fields == FOREIGN_CLASS_FIELDS {
                    0
                } else {
                    fields as u8
                }
            }
            None => 0,
        };
        let superclass_value = match self.heap.class(class).superclass {
            Some(superclass) => Value::Obj(superclass),
            None => Value::Null,
        };
        let fun = self.heap.closure(closure).fun;
        let fun_obj = self.heap.fun_mut(fun);
        let mut patched_constants: Vec<(usize, Value)> = Vec::new();
        for op in fun_obj.code.iter_mut() {
            match op {
                Op::LoadFieldThis(field) | Op::StoreFieldThis(field)
                | Op::LoadField(field) | Op::StoreField(field) => {
                    *field += offset;
                }
                Op::Super { constant, .. } => {
                    patched_constants.push((*constant as usize, superclass_value));
                }
                _ => {}
            }
        }
        for (index, value) in patched_constants {
            fun_obj.constants[index] = value;
        }
    }

    // ------------------------------------------------------------------
    // Fiber plumbing

    /// Record an error value on the current fiber. Returns `false` so
    /// primitives can `return vm.fiber_error(...)`.
    pub fn fiber_error(&mut self, message: &str) -> bool {
        let value = self.string_value(message);
        self.fiber_error_value(value)
    }

    pub fn fiber_error_value(&mut self, value: Value) -> bool {
        if let Some(fiber) = self.fiber {
            self.heap.fiber_mut(fiber).error = value;
        }
        false
    }

    /// Push a call frame for `closure` over the `num_args` values on top of
    /// `fiber`'s stack.
    pub fn call_function(&mut self, fiber: Handle, closure: Handle, num_args: usize) -> bool {
        if self.heap.fiber(fiber).frames.len() >= MAX_CALL_FRAMES {
            return self.fiber_error("Stack overflow.");
        }
        let stack_start = self.heap.fiber(fiber).stack.len() - num_args;
        self.heap.fiber_mut(fiber).frames.push(CallFrame {
            closure,
            ip: 0,
            stack_start,
        });
        true
    }

    /// Shared entry for `call`/`transfer`/`try`: validate, thread the caller
    /// link, deliver the resume value, and make `fiber` current.
    pub(crate) fn run_fiber(
        &mut self,
        fiber: Handle,
        args: &[Value],
        is_call: bool,
        has_value: bool,
        verb: &str,
    ) -> bool {
        if self.heap.fiber(fiber).has_error() {
            return self.fiber_error(&format!("Cannot {} an aborted fiber.", verb));
        }
        if is_call {
            if self.heap.fiber(fiber).caller.is_some() {
                return self.fiber_error("Fiber has already been called.");
            }
            if self.heap.fiber(fiber).state == FiberState::Root {
                return self.fiber_error("Cannot call root fiber.");
            }
            self.heap.fiber_mut(fiber).caller = self.fiber;
        }
        if self.heap.fiber(fiber).frames.is_empty() {
            return self.fiber_error(&format!("Cannot {} a finished fiber.", verb));
        }

        // The calling fiber keeps one slot for the result of this switch; a
        // passed value occupied a second, which is no longer needed.
        if has_value {
            if let Some(current) = self.fiber {
                self.heap.fiber_mut(current).stack.pop();
            }
        }

        let resume_value = if has_value { args[1] } else { Value::Null };
        let first_run = {
            let target = self.heap.fiber(fiber);
            target.frames.len() == 1 && target.frames[0].ip == 0
        };
        if first_run {
            // Starting fresh: bind the value as the function's parameter if
            // it takes one.
            let closure = self.heap.fiber(fiber).frames[0].closure;
            let arity = self.heap.fun(self.heap.closure(closure).fun).arity;
            if arity == 1 {
                self.heap.fiber_mut(fiber).stack.push(resume_value);
            }
        } else {
            // Resuming: the pending yield/transfer sees the value as its
            // result.
            let len = self.heap.fiber(fiber).stack.len();
            self.heap.fiber_mut(fiber).stack[len - 1] = resume_value;
        }
        trace!(?verb, "fiber switch");
        self.fiber = Some(fiber);
        false
    }

    fn store_ip(&mut self, fiber: Handle, ip: usize) {
        if let Some(frame) = self.heap.fiber_mut(fiber).frames.last_mut() {
            frame.ip = ip;
        }
    }

    /// Unwind after an error was stored on the current fiber. Every fiber on
    /// the call chain is aborted with the same error. Returns `true` when a
    /// `try` fiber caught it and execution continues on its caller.
    fn unwind(&mut self) -> bool {
        let Some(start) = self.fiber else {
            return false;
        };
        let error = self.heap.fiber(start).error;
        let mut current = start;
        loop {
            self.heap.fiber_mut(current).error = error;
            if self.heap.fiber(current).state == FiberState::Try {
                let caller = self.heap.fiber(current).caller;
                self.heap.fiber_mut(current).caller = None;
                if let Some(caller) = caller {
                    let len = self.heap.fiber(caller).stack.len();
                    self.heap.fiber_mut(caller).stack[len - 1] = error;
                    self.fiber = Some(caller);
                    return true;
                }
                break;
            }
            let caller = self.heap.fiber(current).caller;
            self.heap.fiber_mut(current).caller = None;
            match caller {
                Some(caller) => current = caller,
                None => break,
            }
        }
        self.report_uncaught_error();
        self.fiber = None;
        false
    }

    /// Runtime-error callback followed by one stack-trace entry per frame of
    /// the erroring fiber, innermost first.
    fn report_uncaught_error(&mut self) {
        let Some(fiber) = self.fiber else {
            return;
        };
        let error = self.heap.fiber(fiber).error;
        let message = match error.as_handle() {
            Some(handle) => match &self.heap.get(handle).data {
                ObjData::Str(text) => text.to_string_lossy(),
                _ => "[error object]".to_string(),
            },
            None => "[error object]".to_string(),
        };
        self.report_error(ErrorKind::Runtime, None, -1, &message);

        let mut trace_entries: Vec<(Option<String>, i32, String)> = Vec::new();
        for frame in self.heap.fiber(fiber).frames.iter().rev() {
            let fun = self.heap.closure(frame.closure).fun;
            let fun_obj = self.heap.fun(fun);
            let line = fun_obj
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            let module_name = self.heap.module(fun_obj.module).name.clone();
            trace_entries.push((module_name, line as i32, fun_obj.name.clone()));
        }
        for (module, line, name) in trace_entries {
            self.report_error(ErrorKind::StackTrace, module.as_deref(), line, &name);
        }
    }

    // ------------------------------------------------------------------
    // Modules

    fn compile_in_module(&mut self, name: Option<String>, source: &str) -> Option<Handle> {
        let module = self.ensure_module(name);
        let fun = compiler::compile(self, module, source)?;
        self.heap.push_root(fun);
        let closure = self.alloc_closure(fun, Vec::new());
        self.heap.pop_root();
        Some(closure)
    }

    fn ensure_module(&mut self, name: Option<String>) -> Handle {
        if let Some(&module) = self.modules.get(&name) {
            return module;
        }
        let mut module = ModuleObj::new(name.clone());
        // Every module implicitly imports the core module's variables.
        if let Some(&core) = self.modules.get(&None) {
            module.variables = self.heap.module(core).variables.clone();
            module.variable_names = self.heap.module(core).variable_names.clone();
        }
        let handle = self.alloc(None, ObjData::Module(module));
        self.modules.insert(name, handle);
        handle
    }

    pub(crate) fn create_core_module(&mut self) -> Handle {
        let module = ModuleObj::new(None);
        let handle = self.alloc(None, ObjData::Module(module));
        self.modules.insert(None, handle);
        handle
    }

    pub(crate) fn define_module_variable(
        &mut self,
        module: Handle,
        name: &str,
        value: Value,
    ) -> usize {
        let module_obj = self.heap.module_mut(module);
        match module_obj.find_variable(name) {
            Some(index) => {
                module_obj.variables[index] = value;
                index
            }
            None => {
                module_obj.variables.push(value);
                module_obj.variable_names.push(name.to_string());
                module_obj.variables.len() - 1
            }
        }
    }

    /// Resolve and load a module for `import`, returning its body closure, or
    /// the module itself when it is already loaded.
    fn import_module(&mut self, importer: Handle, name: &str) -> Result<Value, ()> {
        let importer_name = self
            .heap
            .module(importer)
            .name
            .clone()
            .unwrap_or_else(|| "core".to_string());
        let resolved = match self.config.resolve_module.as_mut() {
            Some(resolve) => resolve(&importer_name, name),
            None => name.to_string(),
        };
        if let Some(&module) = self.modules.get(&Some(resolved.clone())) {
            self.last_module = Some(module);
            return Ok(Value::Obj(module));
        }
        let source = match self.config.load_module.as_mut() {
            Some(load) => load(&resolved),
            None => None,
        };
        let Some(source) = source else {
            self.fiber_error(&format!("Could not load module '{}'.", resolved));
            return Err(());
        };
        match self.compile_in_module(Some(resolved.clone()), &source) {
            Some(closure) => Ok(Value::Obj(closure)),
            None => {
                self.fiber_error(&format!("Could not compile module '{}'.", resolved));
                Err(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Upvalues

    fn capture_upvalue(&mut self, fiber: Handle, slot: usize) -> Handle {
        let existing = self
            .heap
            .fiber(fiber)
            .open_upvalues
            .iter()
            .copied()
            .find(|&handle| match self.heap.upvalue(handle) {
                UpvalueObj::Open { slot: s, .. } => *s == slot,
                UpvalueObj::Closed(_) => false,
            });
        if let Some(handle) = existing {
            return handle;
        }
        let upvalue = self.alloc(None, ObjData::Upvalue(UpvalueObj::Open { fiber, slot }));
        let open = &mut self.heap.fiber_mut(fiber).open_upvalues;
        open.push(upvalue);
        upvalue
    }

    /// Close every open upvalue pointing at `from_slot` or above.
    fn close_upvalues(&mut self, fiber: Handle, from_slot: usize) {
        let mut to_close: Vec<(Handle, usize)> = Vec::new();
        let open: Vec<Handle> = self.heap.fiber(fiber).open_upvalues.clone();
        let mut remaining: Vec<Handle> = Vec::with_capacity(open.len());
        for handle in open {
            match self.heap.upvalue(handle) {
                UpvalueObj::Open { slot, .. } if *slot >= from_slot => {
                    to_close.push((handle, *slot));
                }
                _ => remaining.push(handle),
            }
        }
        self.heap.fiber_mut(fiber).open_upvalues = remaining;
        for (handle, slot) in to_close {
            let value = self.heap.fiber(fiber).stack[slot];
            *self.heap.upvalue_mut(handle) = UpvalueObj::Closed(value);
        }
    }

    fn read_upvalue(&self, upvalue: Handle) -> Value {
        match self.heap.upvalue(upvalue) {
            UpvalueObj::Open { fiber, slot } => self.heap.fiber(*fiber).stack[*slot],
            UpvalueObj::Closed(value) => *value,
        }
    }

    fn write_upvalue(&mut self, upvalue: Handle, value: Value) {
        match self.heap.upvalue(upvalue) {
            UpvalueObj::Open { fiber, slot } => {
                let (fiber, slot) = (*fiber, *slot);
                self.heap.fiber_mut(fiber).stack[slot] = value;
            }
            UpvalueObj::Closed(_) => {
                *self.heap.upvalue_mut(upvalue) = UpvalueObj::Closed(value);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch

    fn method_call(
        &mut self,
        fiber: Handle,
        ip: usize,
        class: Handle,
        symbol: SymbolId,
        num_args: usize,
    ) -> CallOutcome {
        let method = self.heap.class(class).method(symbol);
        let base = self.heap.fiber(fiber).stack.len() - num_args;
        match method {
            Method::None => {
                let class_name = self.class_name(class);
                let signature = self.method_names.name(symbol).to_string();
                self.runtime_error(
                    fiber,
                    ip,
                    &format!("{} does not implement '{}'.", class_name, signature),
                )
            }
            Method::Primitive(primitive) | Method::Foreign(primitive) => {
                let mut args: SmallVec<[Value; 17]> = SmallVec::new();
                args.extend_from_slice(&self.heap.fiber(fiber).stack[base..]);
                if primitive(self, &mut args) {
                    let stack = &mut self.heap.fiber_mut(fiber).stack;
                    stack.truncate(base);
                    stack.push(args[0]);
                    CallOutcome::Continue
                } else {
                    self.store_ip(fiber, ip);
                    self.after_switch_or_error()
                }
            }
            Method::FunctionCall(primitive) => {
                let receiver = self.heap.fiber(fiber).stack[base];
                let closure = match receiver.as_handle() {
                    Some(handle)
                        if matches!(self.heap.get(handle).data, ObjData::Closure(_)) =>
                    {
                        handle
                    }
                    _ => unreachable!("call target is a closure"),
                };
                let arity = self.heap.fun(self.heap.closure(closure).fun).arity as usize;
                if num_args - 1 < arity {
                    return self.runtime_error(fiber, ip, "Function expects more arguments.");
                }
                self.store_ip(fiber, ip);
                let mut args: SmallVec<[Value; 17]> = SmallVec::new();
                args.extend_from_slice(&self.heap.fiber(fiber).stack[base..]);
                let _ = primitive(self, &mut args);
                self.after_switch_or_error()
            }
            Method::Block(closure) => {
                self.store_ip(fiber, ip);
                if !self.call_function(fiber, closure, num_args) {
                    return self.after_switch_or_error();
                }
                CallOutcome::Reload
            }
        }
    }

    /// A primitive reported `false`: either the current fiber changed, the VM
    /// went idle, or an error needs unwinding.
    fn after_switch_or_error(&mut self) -> CallOutcome {
        match self.fiber {
            None => CallOutcome::Finish(InterpretResult::Success),
            Some(current) => {
                if self.heap.fiber(current).has_error() {
                    if self.unwind() {
                        CallOutcome::Reload
                    } else {
                        CallOutcome::Finish(InterpretResult::RuntimeError)
                    }
                } else {
                    CallOutcome::Reload
                }
            }
        }
    }

    fn runtime_error(&mut self, fiber: Handle, ip: usize, message: &str) -> CallOutcome {
        self.store_ip(fiber, ip);
        self.fiber_error(message);
        if self.unwind() {
            CallOutcome::Reload
        } else {
            CallOutcome::Finish(InterpretResult::RuntimeError)
        }
    }

    /// The dispatch loop. Runs until the current fiber chain completes, the
    /// VM goes idle, or an uncaught runtime error surfaces.
    pub(crate) fn run_interpreter(&mut self) -> InterpretResult {
        'reload: loop {
            let Some(fiber) = self.fiber else {
                return InterpretResult::Success;
            };
            let frame = match self.heap.fiber(fiber).frames.last() {
                Some(frame) => *frame,
                None => return InterpretResult::Success,
            };
            let closure = frame.closure;
            let stack_start = frame.stack_start;
            let fun = self.heap.closure(closure).fun;
            let mut ip = frame.ip;

            // The inner loop breaks with an outcome when cached frame state
            // goes stale or the interpreter is done.
            let outcome = loop {
                let op = self.heap.fun(fun).code[ip];
                ip += 1;
                match op {
                    Op::Constant(index) => {
                        let value = self.heap.fun(fun).constants[index as usize];
                        self.heap.fiber_mut(fiber).stack.push(value);
                    }
                    Op::Null => self.heap.fiber_mut(fiber).stack.push(Value::Null),
                    Op::False => self.heap.fiber_mut(fiber).stack.push(Value::Bool(false)),
                    Op::True => self.heap.fiber_mut(fiber).stack.push(Value::Bool(true)),
                    Op::LoadLocal(slot) => {
                        let value = self.heap.fiber(fiber).stack[stack_start + slot as usize];
                        self.heap.fiber_mut(fiber).stack.push(value);
                    }
                    Op::StoreLocal(slot) => {
                        let value = *self.heap.fiber(fiber).stack.last().expect("stack empty");
                        self.heap.fiber_mut(fiber).stack[stack_start + slot as usize] = value;
                    }
                    Op::LoadUpvalue(index) => {
                        let upvalue = self.heap.closure(closure).upvalues[index as usize];
                        let value = self.read_upvalue(upvalue);
                        self.heap.fiber_mut(fiber).stack.push(value);
                    }
                    Op::StoreUpvalue(index) => {
                        let upvalue = self.heap.closure(closure).upvalues[index as usize];
                        let value = *self.heap.fiber(fiber).stack.last().expect("stack empty");
                        self.write_upvalue(upvalue, value);
                    }
                    Op::LoadModuleVar(index) => {
                        let module = self.heap.fun(fun).module;
                        let value = self.heap.module(module).variables[index as usize];
                        self.heap.fiber_mut(fiber).stack.push(value);
                    }
                    Op::StoreModuleVar(index) => {
                        let module = self.heap.fun(fun).module;
                        let value = *self.heap.fiber(fiber).stack.last().expect("stack empty");
                        self.heap.module_mut(module).variables[index as usize] = value;
                    }
                    Op::LoadFieldThis(field) => {
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Instance(_)) =>
                            {
                                let value = self.heap.instance(handle).fields[field as usize];
                                self.heap.fiber_mut(fiber).stack.push(value);
                            }
                            _ => break self.runtime_error(fiber, ip, "Only instances have fields."),
                        }
                    }
                    Op::StoreFieldThis(field) => {
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        let value = *self.heap.fiber(fiber).stack.last().expect("stack empty");
                        match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Instance(_)) =>
                            {
                                self.heap.instance_mut(handle).fields[field as usize] = value;
                            }
                            _ => break self.runtime_error(fiber, ip, "Only instances have fields."),
                        }
                    }
                    Op::LoadField(field) => {
                        let receiver = self.heap.fiber_mut(fiber).stack.pop().expect("stack");
                        match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Instance(_)) =>
                            {
                                let value = self.heap.instance(handle).fields[field as usize];
                                self.heap.fiber_mut(fiber).stack.push(value);
                            }
                            _ => break self.runtime_error(fiber, ip, "Only instances have fields."),
                        }
                    }
                    Op::StoreField(field) => {
                        let receiver = self.heap.fiber_mut(fiber).stack.pop().expect("stack");
                        let value = *self.heap.fiber(fiber).stack.last().expect("stack empty");
                        match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Instance(_)) =>
                            {
                                self.heap.instance_mut(handle).fields[field as usize] = value;
                            }
                            _ => break self.runtime_error(fiber, ip, "Only instances have fields."),
                        }
                    }
                    Op::Pop => {
                        self.heap.fiber_mut(fiber).stack.pop();
                    }
                    Op::Call { arity, symbol } => {
                        let num_args = arity as usize + 1;
                        let base = self.heap.fiber(fiber).stack.len() - num_args;
                        let receiver = self.heap.fiber(fiber).stack[base];
                        let class = self.class_of(receiver);
                        match self.method_call(fiber, ip, class, symbol, num_args) {
                            CallOutcome::Continue => {}
                            outcome => break outcome,
                        }
                    }
                    Op::Super {
                        arity,
                        symbol,
                        constant,
                    } => {
                        let num_args = arity as usize + 1;
                        let superclass_value = self.heap.fun(fun).constants[constant as usize];
                        let class = match superclass_value.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Class(_)) =>
                            {
                                handle
                            }
                            _ => {
                                break self.runtime_error(
                                    fiber,
                                    ip,
                                    "Cannot use 'super' in a function.",
                                );
                            }
                        };
                        match self.method_call(fiber, ip, class, symbol, num_args) {
                            CallOutcome::Continue => {}
                            outcome => break outcome,
                        }
                    }
                    Op::Jump(target) => ip = target,
                    Op::JumpIfFalse(target) => {
                        let condition = self.heap.fiber_mut(fiber).stack.pop().expect("stack");
                        if condition.is_falsey() {
                            ip = target;
                        }
                    }
                    Op::And(target) => {
                        let condition = *self.heap.fiber(fiber).stack.last().expect("stack");
                        if condition.is_falsey() {
                            ip = target;
                        } else {
                            self.heap.fiber_mut(fiber).stack.pop();
                        }
                    }
                    Op::Or(target) => {
                        let condition = *self.heap.fiber(fiber).stack.last().expect("stack");
                        if condition.is_falsey() {
                            self.heap.fiber_mut(fiber).stack.pop();
                        } else {
                            ip = target;
                        }
                    }
                    Op::Loop(target) => ip = target,
                    Op::CloseUpvalue => {
                        let top = self.heap.fiber(fiber).stack.len() - 1;
                        self.close_upvalues(fiber, top);
                        self.heap.fiber_mut(fiber).stack.pop();
                    }
                    Op::Return => {
                        let result = self.heap.fiber_mut(fiber).stack.pop().expect("stack");
                        self.close_upvalues(fiber, stack_start);
                        self.heap.fiber_mut(fiber).frames.pop();
                        let finished = self.heap.fiber(fiber).frames.is_empty();
                        if finished {
                            match self.heap.fiber(fiber).caller {
                                None => {
                                    // The last fiber is done; leave the result
                                    // in slot zero for the host.
                                    let stack = &mut self.heap.fiber_mut(fiber).stack;
                                    stack.clear();
                                    stack.push(result);
                                    return InterpretResult::Success;
                                }
                                Some(caller) => {
                                    self.heap.fiber_mut(fiber).caller = None;
                                    self.fiber = Some(caller);
                                    let len = self.heap.fiber(caller).stack.len();
                                    self.heap.fiber_mut(caller).stack[len - 1] = result;
                                    break CallOutcome::Reload;
                                }
                            }
                        } else {
                            // The receiver slot of the finished call becomes
                            // the result.
                            let stack = &mut self.heap.fiber_mut(fiber).stack;
                            stack.truncate(stack_start);
                            stack.push(result);
                            break CallOutcome::Reload;
                        }
                    }
                    Op::Closure(constant) => {
                        let fun_value = self.heap.fun(fun).constants[constant as usize];
                        let new_fun = match fun_value.as_handle() {
                            Some(handle) => handle,
                            None => unreachable!("closure constant is a function"),
                        };
                        let specs = self.heap.fun(new_fun).upvalues.clone();
                        let mut upvalues: Vec<Handle> = Vec::with_capacity(specs.len());
                        for spec in specs {
                            if spec.is_local {
                                let upvalue =
                                    self.capture_upvalue(fiber, stack_start + spec.index as usize);
                                upvalues.push(upvalue);
                            } else {
                                let upvalue =
                                    self.heap.closure(closure).upvalues[spec.index as usize];
                                upvalues.push(upvalue);
                            }
                        }
                        let new_closure = self.alloc_closure(new_fun, upvalues);
                        self.heap
                            .fiber_mut(fiber)
                            .stack
                            .push(Value::Obj(new_closure));
                    }
                    Op::Construct => {
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        let class = match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Class(_)) =>
                            {
                                handle
                            }
                            _ => unreachable!("constructor receiver is a class"),
                        };
                        let num_fields = self.heap.class(class).num_fields.max(0) as usize;
                        let instance = self.alloc(
                            Some(class),
                            ObjData::Instance(InstanceObj {
                                fields: vec![Value::Null; num_fields].into_boxed_slice(),
                            }),
                        );
                        self.heap.fiber_mut(fiber).stack[stack_start] = Value::Obj(instance);
                    }
                    Op::ForeignConstruct => {
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        let class = match receiver.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Class(_)) =>
                            {
                                handle
                            }
                            _ => unreachable!("constructor receiver is a class"),
                        };
                        let Some(allocate) = self.heap.class(class).foreign_alloc else {
                            break self.runtime_error(
                                fiber,
                                ip,
                                "Foreign class has no allocator.",
                            );
                        };
                        let len = self.heap.fiber(fiber).stack.len();
                        let mut args: SmallVec<[Value; 17]> = SmallVec::new();
                        args.extend_from_slice(&self.heap.fiber(fiber).stack[stack_start..len]);
                        if allocate(self, &mut args) {
                            self.heap.fiber_mut(fiber).stack[stack_start] = args[0];
                        } else {
                            self.store_ip(fiber, ip);
                            break self.after_switch_or_error();
                        }
                    }
                    Op::Class { num_fields } => {
                        if !self.create_class(fiber, num_fields as i32) {
                            self.store_ip(fiber, ip);
                            break if self.unwind() {
                                CallOutcome::Reload
                            } else {
                                CallOutcome::Finish(InterpretResult::RuntimeError)
                            };
                        }
                    }
                    Op::ForeignClass => {
                        if !self.create_class(fiber, FOREIGN_CLASS_FIELDS) {
                            self.store_ip(fiber, ip);
                            break if self.unwind() {
                                CallOutcome::Reload
                            } else {
                                CallOutcome::Finish(InterpretResult::RuntimeError)
                            };
                        }
                        let len = self.heap.fiber(fiber).stack.len();
                        let class_value = self.heap.fiber(fiber).stack[len - 1];
                        if let Some(class) = class_value.as_handle() {
                            let class_name = self.class_name(class);
                            let module = self.heap.fun(fun).module;
                            let module_name = self
                                .heap
                                .module(module)
                                .name
                                .clone()
                                .unwrap_or_else(|| "core".to_string());
                            let methods = match self.config.bind_foreign_class.as_mut() {
                                Some(bind) => bind(&module_name, &class_name),
                                None => ForeignClassMethods::default(),
                            };
                            self.heap.class_mut(class).foreign_alloc = methods.allocate;
                        }
                    }
                    Op::MethodInstance(symbol) | Op::MethodStatic(symbol) => {
                        let is_static = matches!(op, Op::MethodStatic(_));
                        let len = self.heap.fiber(fiber).stack.len();
                        let class_value = self.heap.fiber(fiber).stack[len - 1];
                        let method_value = self.heap.fiber(fiber).stack[len - 2];
                        let class = match class_value.as_handle() {
                            Some(handle)
                                if matches!(self.heap.get(handle).data, ObjData::Class(_)) =>
                            {
                                handle
                            }
                            _ => unreachable!("method binds to a class"),
                        };
                        let module = self.heap.fun(fun).module;
                        if self.bind_method(is_static, symbol, module, class, method_value) {
                            let stack = &mut self.heap.fiber_mut(fiber).stack;
                            stack.pop();
                            stack.pop();
                        } else {
                            self.store_ip(fiber, ip);
                            break if self.unwind() {
                                CallOutcome::Reload
                            } else {
                                CallOutcome::Finish(InterpretResult::RuntimeError)
                            };
                        }
                    }
                    Op::ImportModule(constant) => {
                        let name_value = self.heap.fun(fun).constants[constant as usize];
                        let name = match name_value.as_handle() {
                            Some(handle) => self.heap.string(handle).to_string_lossy(),
                            None => unreachable!("import name is a string"),
                        };
                        let module = self.heap.fun(fun).module;
                        match self.import_module(module, &name) {
                            Ok(value) => {
                                self.heap.fiber_mut(fiber).stack.push(value);
                                let is_closure = value.as_handle().map_or(false, |handle| {
                                    matches!(self.heap.get(handle).data, ObjData::Closure(_))
                                });
                                if is_closure {
                                    // Run the module body in place.
                                    let body = match value.as_handle() {
                                        Some(handle) => handle,
                                        None => unreachable!(),
                                    };
                                    self.store_ip(fiber, ip);
                                    if !self.call_function(fiber, body, 1) {
                                        break self.after_switch_or_error();
                                    }
                                    break CallOutcome::Reload;
                                }
                            }
                            Err(()) => {
                                self.store_ip(fiber, ip);
                                break if self.unwind() {
                                    CallOutcome::Reload
                                } else {
                                    CallOutcome::Finish(InterpretResult::RuntimeError)
                                };
                            }
                        }
                    }
                    Op::ImportVariable(constant) => {
                        let name_value = self.heap.fun(fun).constants[constant as usize];
                        let name = match name_value.as_handle() {
                            Some(handle) => self.heap.string(handle).to_string_lossy(),
                            None => unreachable!("import name is a string"),
                        };
                        let Some(module) = self.last_module else {
                            break self.runtime_error(fiber, ip, "No module was imported.");
                        };
                        match self.find_variable(module, &name) {
                            Some(value) => self.heap.fiber_mut(fiber).stack.push(value),
                            None => {
                                let module_name = self
                                    .heap
                                    .module(module)
                                    .name
                                    .clone()
                                    .unwrap_or_else(|| "core".to_string());
                                break self.runtime_error(
                                    fiber,
                                    ip,
                                    &format!(
                                        "Could not find a variable named '{}' in module '{}'.",
                                        name, module_name
                                    ),
                                );
                            }
                        }
                    }
                    Op::EndModule => {
                        let module = self.heap.fun(fun).module;
                        self.last_module = Some(module);
                        self.heap.fiber_mut(fiber).stack.push(Value::Null);
                    }
                }
            };

            match outcome {
                CallOutcome::Reload => continue 'reload,
                CallOutcome::Finish(result) => return result,
                CallOutcome::Continue => unreachable!("inner loop breaks with a transition"),
            }
        }
    }
}
