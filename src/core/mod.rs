//! Core class bootstrap and primitive registration.
//!
//! The original runtime collected its primitives by scanning annotated
//! functions; here the table is spelled out statically. Each entry names the
//! class (as declared by the bootstrap script), the method signature, whether
//! it binds to the class or its metaclass, and the native function.
//!
//! `initialize` runs the bootstrap protocol: build the
//! Object/Class/Object-metaclass triangle, interpret the embedded script that
//! declares the remaining built-in classes in the language itself, attach
//! primitives to each declared class, and finally adopt any string allocated
//! before the String class existed.

mod primitives;
mod script;

use tracing::debug;

use crate::heap::Handle;
use crate::value::{Method, Primitive, StrObj, Value};
use crate::vm::{InterpretResult, Vm};

use primitives::*;

/// How a registered native is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// Executed inline; the result replaces the receiver slot.
    Primitive,
    /// `Fn.call(...)`: the dispatcher transfers control into the receiver
    /// closure instead of running the native to completion.
    FunctionCall,
}

pub struct PrimitiveDef {
    pub class_name: &'static str,
    pub signature: &'static str,
    pub on_metaclass: bool,
    pub kind: PrimitiveKind,
    pub function: Primitive,
}

const fn prim(
    class_name: &'static str,
    signature: &'static str,
    function: Primitive,
) -> PrimitiveDef {
    PrimitiveDef {
        class_name,
        signature,
        on_metaclass: false,
        kind: PrimitiveKind::Primitive,
        function,
    }
}

const fn static_prim(
    class_name: &'static str,
    signature: &'static str,
    function: Primitive,
) -> PrimitiveDef {
    PrimitiveDef {
        class_name,
        signature,
        on_metaclass: true,
        kind: PrimitiveKind::Primitive,
        function,
    }
}

const fn call_prim(
    class_name: &'static str,
    signature: &'static str,
    function: Primitive,
) -> PrimitiveDef {
    PrimitiveDef {
        class_name,
        signature,
        on_metaclass: false,
        kind: PrimitiveKind::FunctionCall,
        function,
    }
}

/// Every native method of the core, keyed by class name and signature.
pub static CORE_PRIMITIVES: &[PrimitiveDef] = &[
    prim("Object", "!", object_not),
    prim("Object", "==(_)", object_eqeq),
    prim("Object", "!=(_)", object_bangeq),
    prim("Object", "is(_)", object_is),
    prim("Object", "toString", object_to_string),
    prim("Object", "type", object_type),
    prim("Object metaclass", "same(_,_)", object_same),
    prim("Class", "name", class_name),
    prim("Class", "supertype", class_supertype),
    prim("Class", "toString", class_to_string),
    prim("Class", "attributes", class_attributes),
    prim("Bool", "!", bool_not),
    prim("Bool", "toString", bool_to_string),
    prim("Null", "!", null_not),
    prim("Null", "toString", null_to_string),
    static_prim("Num", "fromString(_)", num_from_string),
    static_prim("Num", "infinity", num_infinity),
    static_prim("Num", "nan", num_nan),
    static_prim("Num", "pi", num_pi),
    static_prim("Num", "tau", num_tau),
    static_prim("Num", "largest", num_largest),
    static_prim("Num", "smallest", num_smallest),
    static_prim("Num", "maxSafeInteger", num_max_safe_integer),
    static_prim("Num", "minSafeInteger", num_min_safe_integer),
    prim("Num", "+(_)", num_plus),
    prim("Num", "-(_)", num_minus),
    prim("Num", "*(_)", num_multiply),
    prim("Num", "/(_)", num_divide),
    prim("Num", "%(_)", num_mod),
    prim("Num", "<(_)", num_lt),
    prim("Num", ">(_)", num_gt),
    prim("Num", "<=(_)", num_lte),
    prim("Num", ">=(_)", num_gte),
    prim("Num", "&(_)", num_bitwise_and),
    prim("Num", "|(_)", num_bitwise_or),
    prim("Num", "^(_)", num_bitwise_xor),
    prim("Num", "<<(_)", num_shift_left),
    prim("Num", ">>(_)", num_shift_right),
    prim("Num", "-", num_neg),
    prim("Num", "~", num_bitwise_not),
    prim("Num", "..(_)", num_dotdot),
    prim("Num", "...(_)", num_dotdotdot),
    prim("Num", "==(_)", num_eqeq),
    prim("Num", "!=(_)", num_bangeq),
    prim("Num", "abs", num_abs),
    prim("Num", "acos", num_acos),
    prim("Num", "asin", num_asin),
    prim("Num", "atan", num_atan),
    prim("Num", "atan(_)", num_atan2),
    prim("Num", "cbrt", num_cbrt),
    prim("Num", "ceil", num_ceil),
    prim("Num", "cos", num_cos),
    prim("Num", "floor", num_floor),
    prim("Num", "fraction", num_fraction),
    prim("Num", "isInfinity", num_is_infinity),
    prim("Num", "isInteger", num_is_integer),
    prim("Num", "isNan", num_is_nan),
    prim("Num", "log", num_log),
    prim("Num", "log2", num_log2),
    prim("Num", "exp", num_exp),
    prim("Num", "min(_)", num_min),
    prim("Num", "max(_)", num_max),
    prim("Num", "clamp(_,_)", num_clamp),
    prim("Num", "pow(_)", num_pow),
    prim("Num", "round", num_round),
    prim("Num", "sign", num_sign),
    prim("Num", "sin", num_sin),
    prim("Num", "sqrt", num_sqrt),
    prim("Num", "tan", num_tan),
    prim("Num", "toString", num_to_string),
    prim("Num", "truncate", num_truncate),
    static_prim("String", "fromCodePoint(_)", string_from_code_point),
    static_prim("String", "fromByte(_)", string_from_byte),
    prim("String", "+(_)", string_plus),
    prim("String", "[_]", string_subscript),
    prim("String", "byteAt_(_)", string_byte_at),
    prim("String", "byteCount_", string_byte_count),
    prim("String", "codePointAt_(_)", string_code_point_at),
    prim("String", "contains(_)", string_contains),
    prim("String", "endsWith(_)", string_ends_with),
    prim("String", "startsWith(_)", string_starts_with),
    prim("String", "indexOf(_)", string_index_of1),
    prim("String", "indexOf(_,_)", string_index_of2),
    prim("String", "iterate(_)", string_iterate),
    prim("String", "iterateByte_(_)", string_iterate_byte),
    prim("String", "iteratorValue(_)", string_iterator_value),
    prim("String", "toString", string_to_string),
    prim("String", "$(_)", string_dollar),
    static_prim("List", "filled(_,_)", list_filled),
    static_prim("List", "new()", list_new),
    prim("List", "[_]", list_subscript),
    prim("List", "[_]=(_)", list_subscript_setter),
    prim("List", "add(_)", list_add),
    prim("List", "addCore_(_)", list_add_core),
    prim("List", "clear()", list_clear),
    prim("List", "count", list_count),
    prim("List", "insert(_,_)", list_insert),
    prim("List", "iterate(_)", list_iterate),
    prim("List", "iteratorValue(_)", list_iterator_value),
    prim("List", "removeAt(_)", list_remove_at),
    prim("List", "remove(_)", list_remove_value),
    prim("List", "indexOf(_)", list_index_of),
    prim("List", "swap(_,_)", list_swap),
    static_prim("Map", "new()", map_new),
    prim("Map", "[_]", map_subscript),
    prim("Map", "[_]=(_)", map_subscript_setter),
    prim("Map", "addCore_(_,_)", map_add_core),
    prim("Map", "clear()", map_clear),
    prim("Map", "containsKey(_)", map_contains_key),
    prim("Map", "count", map_count),
    prim("Map", "remove(_)", map_remove),
    prim("Map", "iterate(_)", map_iterate),
    prim("Map", "keyIteratorValue_(_)", map_key_iterator_value),
    prim("Map", "valueIteratorValue_(_)", map_value_iterator_value),
    prim("Range", "from", range_from),
    prim("Range", "to", range_to),
    prim("Range", "min", range_min),
    prim("Range", "max", range_max),
    prim("Range", "isInclusive", range_is_inclusive),
    prim("Range", "iterate(_)", range_iterate),
    prim("Range", "iteratorValue(_)", range_iterator_value),
    prim("Range", "toString", range_to_string),
    static_prim("Fn", "new(_)", fn_new),
    prim("Fn", "arity", fn_arity),
    prim("Fn", "toString", fn_to_string),
    call_prim("Fn", "call()", fn_call),
    call_prim("Fn", "call(_)", fn_call),
    call_prim("Fn", "call(_,_)", fn_call),
    call_prim("Fn", "call(_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    call_prim("Fn", "call(_,_,_,_,_,_,_,_,_,_,_,_,_,_,_,_)", fn_call),
    static_prim("Fiber", "new(_)", fiber_new),
    static_prim("Fiber", "abort(_)", fiber_abort),
    static_prim("Fiber", "current", fiber_current),
    static_prim("Fiber", "suspend()", fiber_suspend),
    static_prim("Fiber", "yield()", fiber_yield),
    static_prim("Fiber", "yield(_)", fiber_yield1),
    prim("Fiber", "call()", fiber_call),
    prim("Fiber", "call(_)", fiber_call1),
    prim("Fiber", "error", fiber_error),
    prim("Fiber", "isDone", fiber_is_done),
    prim("Fiber", "transfer()", fiber_transfer),
    prim("Fiber", "transfer(_)", fiber_transfer1),
    prim("Fiber", "transferError(_)", fiber_transfer_error),
    prim("Fiber", "try()", fiber_try),
    prim("Fiber", "try(_)", fiber_try1),
    static_prim("System", "clock", system_clock),
    static_prim("System", "gc()", system_gc),
    static_prim("System", "writeString_(_)", system_write_string),
];

/// Bind every table entry for `class_name` into `class` (or its metaclass).
fn attach_primitives(vm: &mut Vm, class: Handle, class_name: &str) {
    let mut bound = 0usize;
    for def in CORE_PRIMITIVES {
        if def.class_name != class_name {
            continue;
        }
        let target = if def.on_metaclass {
            match vm.heap.get(class).class {
                Some(metaclass) => metaclass,
                None => unreachable!("metaclass missing during registration"),
            }
        } else {
            class
        };
        let symbol = vm.method_names.ensure(def.signature);
        let method = match def.kind {
            PrimitiveKind::Primitive => Method::Primitive(def.function),
            PrimitiveKind::FunctionCall => Method::FunctionCall(def.function),
        };
        vm.heap.class_mut(target).set_method(symbol, method);
        bound += 1;
    }
    debug!(class = class_name, methods = bound, "attached primitives");
}

/// Create a bare class and register it as a core module variable.
fn define_class(vm: &mut Vm, module: Handle, name: &str) -> Handle {
    let name_handle = vm.alloc_string(StrObj::from_str(name));
    vm.heap.push_root(name_handle);
    let class = vm.new_single_class(0, name_handle);
    vm.heap.pop_root();
    vm.heap.push_root(class);
    vm.define_module_variable(module, name, Value::Obj(class));
    vm.heap.pop_root();
    class
}

/// Fetch a class the bootstrap script declared.
fn core_class(vm: &Vm, module: Handle, name: &str) -> Handle {
    match vm.find_variable(module, name) {
        Some(Value::Obj(handle)) => handle,
        _ => unreachable!("bootstrap script must declare {}", name),
    }
}

pub(crate) fn initialize(vm: &mut Vm) {
    let core = vm.create_core_module();

    // Object is the root: a single class with no superclass.
    let object = define_class(vm, core, "Object");
    vm.classes.object = Some(object);
    attach_primitives(vm, object, "Object");

    // Class sits under Object so classes respond to the base protocol.
    let class_class = define_class(vm, core, "Class");
    vm.classes.class_ = Some(class_class);
    vm.bind_superclass(class_class, object);
    attach_primitives(vm, class_class, "Class");

    // Close the triangle: Object's metaclass is an instance of Class and a
    // subclass of it; Class is its own class.
    let object_metaclass = define_class(vm, core, "Object metaclass");
    vm.heap.get_mut(object).class = Some(object_metaclass);
    vm.heap.get_mut(object_metaclass).class = Some(class_class);
    vm.heap.get_mut(class_class).class = Some(class_class);
    vm.bind_superclass(object_metaclass, class_class);
    attach_primitives(vm, object_metaclass, "Object metaclass");

    // The rest of the built-in classes are declared in the language itself.
    let result = vm.interpret_in(None, script::CORE_SOURCE);
    assert!(
        result == InterpretResult::Success,
        "core bootstrap script failed to load"
    );

    let bool_class = core_class(vm, core, "Bool");
    vm.classes.bool_ = Some(bool_class);
    attach_primitives(vm, bool_class, "Bool");

    let fiber_class = core_class(vm, core, "Fiber");
    vm.classes.fiber = Some(fiber_class);
    attach_primitives(vm, fiber_class, "Fiber");

    let fn_class = core_class(vm, core, "Fn");
    vm.classes.fn_ = Some(fn_class);
    attach_primitives(vm, fn_class, "Fn");

    let null_class = core_class(vm, core, "Null");
    vm.classes.null = Some(null_class);
    attach_primitives(vm, null_class, "Null");

    let num_class = core_class(vm, core, "Num");
    vm.classes.num = Some(num_class);
    attach_primitives(vm, num_class, "Num");

    let string_class = core_class(vm, core, "String");
    vm.classes.string = Some(string_class);
    attach_primitives(vm, string_class, "String");

    let list_class = core_class(vm, core, "List");
    vm.classes.list = Some(list_class);
    attach_primitives(vm, list_class, "List");

    let map_class = core_class(vm, core, "Map");
    vm.classes.map = Some(map_class);
    attach_primitives(vm, map_class, "Map");

    let range_class = core_class(vm, core, "Range");
    vm.classes.range = Some(range_class);
    attach_primitives(vm, range_class, "Range");

    let system_class = core_class(vm, core, "System");
    vm.classes.system = Some(system_class);
    attach_primitives(vm, system_class, "System");

    // Strings allocated before the String class existed have a null class
    // pointer; repair them in one pass over the object chain.
    vm.heap.adopt_orphan_strings(string_class);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_no_duplicate_entries() {
        let mut seen = std::collections::HashSet::new();
        for def in CORE_PRIMITIVES {
            let key = (def.class_name, def.signature, def.on_metaclass);
            assert!(seen.insert(key), "duplicate entry {:?}", key);
        }
    }

    #[test]
    fn test_fn_call_arities_cover_zero_to_sixteen() {
        let count = CORE_PRIMITIVES
            .iter()
            .filter(|def| def.class_name == "Fn" && def.signature.starts_with("call"))
            .count();
        assert_eq!(count, 17);
    }
}
