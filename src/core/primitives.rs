//! Native method bodies for the built-in classes.
//!
//! Every function here follows the primitive contract: `args[0]` is the
//! receiver, `args[1..]` the call arguments. Returning `true` means the
//! result replaced `args[0]`; returning `false` means a fiber switch is
//! pending or an error was recorded on the current fiber.
//!
//! Validation failures store a message string in the fiber's error slot via
//! the shared validators and bail with `false`; nothing here panics on bad
//! user input.

use crate::heap::Handle;
use crate::value::{num_to_string as format_num, FiberState, ObjData, RangeObj, StrObj, Value};
use crate::vm::Vm;

// ----------------------------------------------------------------------
// Validators

fn validate_num(vm: &mut Vm, value: Value, arg_name: &str) -> Option<f64> {
    match value {
        Value::Num(n) => Some(n),
        _ => {
            vm.fiber_error(&format!("{} must be a number.", arg_name));
            None
        }
    }
}

fn validate_int_value(vm: &mut Vm, value: f64, arg_name: &str) -> Option<f64> {
    if value.trunc() == value && value.is_finite() {
        Some(value)
    } else {
        vm.fiber_error(&format!("{} must be an integer.", arg_name));
        None
    }
}

fn validate_int(vm: &mut Vm, value: Value, arg_name: &str) -> Option<f64> {
    let value = validate_num(vm, value, arg_name)?;
    validate_int_value(vm, value, arg_name)
}

fn validate_index_value(vm: &mut Vm, value: f64, count: usize, arg_name: &str) -> Option<usize> {
    let mut value = validate_int_value(vm, value, arg_name)?;
    // Negative indices count from the end.
    if value < 0.0 {
        value += count as f64;
    }
    if value >= 0.0 && value < count as f64 {
        Some(value as usize)
    } else {
        vm.fiber_error(&format!("{} out of bounds.", arg_name));
        None
    }
}

fn validate_index(vm: &mut Vm, value: Value, count: usize, arg_name: &str) -> Option<usize> {
    let value = validate_num(vm, value, arg_name)?;
    validate_index_value(vm, value, count, arg_name)
}

fn validate_string(vm: &mut Vm, value: Value, arg_name: &str) -> Option<Handle> {
    match value.as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Str(_)) => Some(handle),
        _ => {
            vm.fiber_error(&format!("{} must be a string.", arg_name));
            None
        }
    }
}

fn validate_fn(vm: &mut Vm, value: Value, arg_name: &str) -> Option<Handle> {
    match value.as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Closure(_)) => Some(handle),
        _ => {
            vm.fiber_error(&format!("{} must be a function.", arg_name));
            None
        }
    }
}

/// Map keys must be value types: their equality is stable identity or
/// content, never user-defined.
fn validate_key(vm: &mut Vm, value: Value) -> bool {
    let ok = match value {
        Value::Null | Value::Bool(_) | Value::Num(_) => true,
        Value::Undefined => false,
        Value::Obj(handle) => matches!(
            vm.heap.get(handle).data,
            ObjData::Str(_) | ObjData::Range(_) | ObjData::Class(_)
        ),
    };
    if !ok {
        vm.fiber_error("Key must be a value type.");
    }
    ok
}

/// Resolve a range over a sequence of `length` elements into (start, count,
/// step), handling negative indices, exclusivity, and the empty-at-end edge
/// case.
fn calculate_range(
    vm: &mut Vm,
    range: RangeObj,
    length: usize,
) -> Option<(usize, usize, isize)> {
    // An empty range at the very end is allowed so `seq[0..-1]` can copy an
    // empty sequence.
    if range.from == length as f64
        && range.to == if range.is_inclusive { -1.0 } else { length as f64 }
    {
        return Some((0, 0, 0));
    }
    let from = validate_index_value(vm, range.from, length, "Range start")?;
    let mut to = validate_int_value(vm, range.to, "Range end")?;
    if to < 0.0 {
        to += length as f64;
    }
    // Convert the exclusive form to inclusive.
    if !range.is_inclusive {
        if to == from as f64 {
            return Some((from, 0, 0));
        }
        to += if to >= from as f64 { -1.0 } else { 1.0 };
    }
    if to < 0.0 || to >= length as f64 {
        vm.fiber_error("Range end out of bounds.");
        return None;
    }
    let to = to as usize;
    let count = from.abs_diff(to) + 1;
    let step = if from < to { 1 } else { -1 };
    Some((from, count, step))
}

// ----------------------------------------------------------------------
// UTF-8 helpers

/// Decode the code point starting at `bytes[0]`, or -1 when the sequence is
/// malformed or truncated (a continuation byte in the lead position is
/// malformed).
pub(crate) fn utf8_decode(bytes: &[u8]) -> i32 {
    let Some(&first) = bytes.first() else {
        return -1;
    };
    if first <= 0x7f {
        return first as i32;
    }
    let (mut value, remaining) = if first & 0xe0 == 0xc0 {
        ((first & 0x1f) as u32, 1)
    } else if first & 0xf0 == 0xe0 {
        ((first & 0x0f) as u32, 2)
    } else if first & 0xf8 == 0xf0 {
        ((first & 0x07) as u32, 3)
    } else {
        return -1;
    };
    if remaining > bytes.len() - 1 {
        return -1;
    }
    for &byte in &bytes[1..=remaining] {
        if byte & 0xc0 != 0x80 {
            return -1;
        }
        value = value << 6 | (byte & 0x3f) as u32;
    }
    value as i32
}

/// Encode a code point (anything up to 0x10ffff, surrogates included) as
/// UTF-8 bytes.
pub(crate) fn utf8_encode(value: u32, out: &mut Vec<u8>) {
    if value <= 0x7f {
        out.push(value as u8);
    } else if value <= 0x7ff {
        out.push(0xc0 | (value >> 6) as u8);
        out.push(0x80 | (value & 0x3f) as u8);
    } else if value <= 0xffff {
        out.push(0xe0 | (value >> 12) as u8);
        out.push(0x80 | ((value >> 6) & 0x3f) as u8);
        out.push(0x80 | (value & 0x3f) as u8);
    } else {
        out.push(0xf0 | (value >> 18) as u8);
        out.push(0x80 | ((value >> 12) & 0x3f) as u8);
        out.push(0x80 | ((value >> 6) & 0x3f) as u8);
        out.push(0x80 | (value & 0x3f) as u8);
    }
}

/// The one-code-point string starting at byte `index`, or the raw byte when
/// it is not a valid UTF-8 sequence start.
fn code_point_string(vm: &mut Vm, string: Handle, index: usize) -> Value {
    let bytes = vm.heap.string(string).bytes();
    let code_point = utf8_decode(&bytes[index..]);
    let piece = if code_point == -1 {
        vec![bytes[index]]
    } else {
        let mut out = Vec::new();
        utf8_encode(code_point as u32, &mut out);
        out
    };
    Value::Obj(vm.alloc_string(StrObj::new(piece)))
}

fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return if start <= haystack.len() { Some(start) } else { None };
    }
    if start >= haystack.len() || needle.len() > haystack.len() - start {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|found| found + start)
}

fn fiber_handle(vm: &Vm, value: Value) -> Handle {
    match value.as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Fiber(_)) => handle,
        _ => unreachable!("receiver is a fiber"),
    }
}

fn class_handle(vm: &Vm, value: Value) -> Handle {
    match value.as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Class(_)) => handle,
        _ => unreachable!("receiver is a class"),
    }
}

// ----------------------------------------------------------------------
// Bool

pub(crate) fn bool_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let value = matches!(args[0], Value::Bool(false));
    args[0] = Value::Bool(value);
    true
}

pub(crate) fn bool_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let text = if matches!(args[0], Value::Bool(true)) {
        "true"
    } else {
        "false"
    };
    args[0] = vm.string_value(text);
    true
}

// ----------------------------------------------------------------------
// Object

pub(crate) fn object_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(false);
    true
}

pub(crate) fn object_eqeq(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(vm.heap.values_equal(args[0], args[1]));
    true
}

pub(crate) fn object_bangeq(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(!vm.heap.values_equal(args[0], args[1]));
    true
}

pub(crate) fn object_is(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = match args[1].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Class(_)) => handle,
        _ => return vm.fiber_error("Right operand must be a class."),
    };
    let mut class = vm.class_of(args[0]);
    loop {
        if class == target {
            args[0] = Value::Bool(true);
            return true;
        }
        match vm.heap.class(class).superclass {
            Some(superclass) => class = superclass,
            None => {
                args[0] = Value::Bool(false);
                return true;
            }
        }
    }
}

pub(crate) fn object_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = vm.class_of(args[0]);
    let name = vm.class_name(class);
    args[0] = vm.string_value(&format!("instance of {}", name));
    true
}

pub(crate) fn object_type(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Obj(vm.class_of(args[0]));
    true
}

/// Identity-style equality on the Object metaclass, immune to `==` overrides.
pub(crate) fn object_same(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(vm.heap.values_equal(args[1], args[2]));
    true
}

// ----------------------------------------------------------------------
// Class

pub(crate) fn class_name(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = class_handle(vm, args[0]);
    args[0] = Value::Obj(vm.heap.class(class).name);
    true
}

pub(crate) fn class_supertype(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = class_handle(vm, args[0]);
    args[0] = match vm.heap.class(class).superclass {
        Some(superclass) => Value::Obj(superclass),
        None => Value::Null,
    };
    true
}

pub(crate) fn class_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = class_handle(vm, args[0]);
    args[0] = Value::Obj(vm.heap.class(class).name);
    true
}

pub(crate) fn class_attributes(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = class_handle(vm, args[0]);
    args[0] = vm.heap.class(class).attributes;
    true
}

// ----------------------------------------------------------------------
// Null

pub(crate) fn null_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(true);
    true
}

pub(crate) fn null_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = vm.string_value("null");
    true
}

// ----------------------------------------------------------------------
// Num

fn receiver_num(args: &[Value]) -> f64 {
    match args[0] {
        Value::Num(n) => n,
        _ => unreachable!("receiver is a number"),
    }
}

macro_rules! num_binary_op {
    ($name:ident, $op:tt) => {
        pub(crate) fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(rhs) = validate_num(vm, args[1], "Right operand") else {
                return false;
            };
            args[0] = Value::Num(receiver_num(args) $op rhs);
            true
        }
    };
}

macro_rules! num_compare_op {
    ($name:ident, $op:tt) => {
        pub(crate) fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(rhs) = validate_num(vm, args[1], "Right operand") else {
                return false;
            };
            args[0] = Value::Bool(receiver_num(args) $op rhs);
            true
        }
    };
}

macro_rules! num_bitwise_op {
    ($name:ident, $body:expr) => {
        pub(crate) fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(rhs) = validate_num(vm, args[1], "Right operand") else {
                return false;
            };
            let left = receiver_num(args) as u32;
            let right = rhs as u32;
            let apply: fn(u32, u32) -> u32 = $body;
            args[0] = Value::Num(apply(left, right) as f64);
            true
        }
    };
}

macro_rules! num_math_fn {
    ($name:ident, $method:ident) => {
        pub(crate) fn $name(_vm: &mut Vm, args: &mut [Value]) -> bool {
            args[0] = Value::Num(receiver_num(args).$method());
            true
        }
    };
}

num_binary_op!(num_plus, +);
num_binary_op!(num_minus, -);
num_binary_op!(num_multiply, *);
num_binary_op!(num_divide, /);
num_binary_op!(num_mod, %);
num_compare_op!(num_lt, <);
num_compare_op!(num_gt, >);
num_compare_op!(num_lte, <=);
num_compare_op!(num_gte, >=);
num_bitwise_op!(num_bitwise_and, |a, b| a & b);
num_bitwise_op!(num_bitwise_or, |a, b| a | b);
num_bitwise_op!(num_bitwise_xor, |a, b| a ^ b);
num_bitwise_op!(num_shift_left, |a, b| a.wrapping_shl(b));
num_bitwise_op!(num_shift_right, |a, b| a.wrapping_shr(b));
num_math_fn!(num_abs, abs);
num_math_fn!(num_acos, acos);
num_math_fn!(num_asin, asin);
num_math_fn!(num_atan, atan);
num_math_fn!(num_cbrt, cbrt);
num_math_fn!(num_ceil, ceil);
num_math_fn!(num_cos, cos);
num_math_fn!(num_floor, floor);
num_math_fn!(num_round, round);
num_math_fn!(num_sin, sin);
num_math_fn!(num_sqrt, sqrt);
num_math_fn!(num_tan, tan);
num_math_fn!(num_log, ln);
num_math_fn!(num_log2, log2);
num_math_fn!(num_exp, exp);
num_math_fn!(num_truncate, trunc);

pub(crate) fn num_neg(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(-receiver_num(args));
    true
}

pub(crate) fn num_bitwise_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    // Reinterpret as unsigned 32-bit and complement.
    args[0] = Value::Num(!(receiver_num(args) as u32) as f64);
    true
}

pub(crate) fn num_atan2(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(rhs) = validate_num(vm, args[1], "x value") else {
        return false;
    };
    args[0] = Value::Num(receiver_num(args).atan2(rhs));
    true
}

pub(crate) fn num_pow(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(rhs) = validate_num(vm, args[1], "Power value") else {
        return false;
    };
    args[0] = Value::Num(receiver_num(args).powf(rhs));
    true
}

pub(crate) fn num_fraction(_vm: &mut Vm, args: &mut [Value]) -> bool {
    // fmod keeps the sign of the receiver.
    args[0] = Value::Num(receiver_num(args) % 1.0);
    true
}

pub(crate) fn num_is_infinity(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(receiver_num(args).is_infinite());
    true
}

pub(crate) fn num_is_integer(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = receiver_num(args);
    args[0] = Value::Bool(n.is_finite() && n.trunc() == n);
    true
}

pub(crate) fn num_is_nan(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(receiver_num(args).is_nan());
    true
}

pub(crate) fn num_sign(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = receiver_num(args);
    let sign = if n > 0.0 {
        1.0
    } else if n < 0.0 {
        -1.0
    } else {
        0.0
    };
    args[0] = Value::Num(sign);
    true
}

pub(crate) fn num_min(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(rhs) = validate_num(vm, args[1], "Other value") else {
        return false;
    };
    let n = receiver_num(args);
    args[0] = Value::Num(if n < rhs { n } else { rhs });
    true
}

pub(crate) fn num_max(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(rhs) = validate_num(vm, args[1], "Other value") else {
        return false;
    };
    let n = receiver_num(args);
    args[0] = Value::Num(if n > rhs { n } else { rhs });
    true
}

pub(crate) fn num_clamp(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(min) = validate_num(vm, args[1], "Min value") else {
        return false;
    };
    let Some(max) = validate_num(vm, args[2], "Max value") else {
        return false;
    };
    let n = receiver_num(args);
    let clamped = if n < min {
        min
    } else if n > max {
        max
    } else {
        n
    };
    args[0] = Value::Num(clamped);
    true
}

pub(crate) fn num_dotdot(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(to) = validate_num(vm, args[1], "Right hand side of range") else {
        return false;
    };
    let from = receiver_num(args);
    args[0] = Value::Obj(vm.alloc_range(from, to, true));
    true
}

pub(crate) fn num_dotdotdot(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(to) = validate_num(vm, args[1], "Right hand side of range") else {
        return false;
    };
    let from = receiver_num(args);
    args[0] = Value::Obj(vm.alloc_range(from, to, false));
    true
}

/// `==` with a non-number is false, not an error.
pub(crate) fn num_eqeq(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let result = match args[1] {
        Value::Num(rhs) => receiver_num(args) == rhs,
        _ => false,
    };
    args[0] = Value::Bool(result);
    true
}

pub(crate) fn num_bangeq(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let result = match args[1] {
        Value::Num(rhs) => receiver_num(args) != rhs,
        _ => true,
    };
    args[0] = Value::Bool(result);
    true
}

pub(crate) fn num_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let text = format_num(receiver_num(args));
    args[0] = vm.string_value(&text);
    true
}

pub(crate) fn num_from_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(handle) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let text = vm.heap.string(handle).to_string_lossy();
    let trimmed = text.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok().map(|v| v as f64)
    } else {
        trimmed.parse::<f64>().ok()
    };
    args[0] = match parsed {
        Some(n) if !trimmed.is_empty() => Value::Num(n),
        _ => Value::Null,
    };
    true
}

macro_rules! num_constant {
    ($name:ident, $value:expr) => {
        pub(crate) fn $name(_vm: &mut Vm, args: &mut [Value]) -> bool {
            args[0] = Value::Num($value);
            true
        }
    };
}

num_constant!(num_infinity, f64::INFINITY);
num_constant!(num_nan, f64::NAN);
num_constant!(num_pi, 3.14159265358979323846264338327950288);
num_constant!(num_tau, 6.28318530717958647692528676655900577);
num_constant!(num_largest, f64::MAX);
num_constant!(num_smallest, f64::MIN_POSITIVE);
num_constant!(num_max_safe_integer, 9007199254740991.0);
num_constant!(num_min_safe_integer, -9007199254740991.0);

// ----------------------------------------------------------------------
// String

fn receiver_string(vm: &Vm, args: &[Value]) -> Handle {
    match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Str(_)) => handle,
        _ => unreachable!("receiver is a string"),
    }
}

pub(crate) fn string_plus(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Right operand") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let mut bytes = vm.heap.string(receiver).bytes().to_vec();
    bytes.extend_from_slice(vm.heap.string(other).bytes());
    args[0] = Value::Obj(vm.alloc_string(StrObj::new(bytes)));
    true
}

pub(crate) fn string_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    match args[1] {
        Value::Num(_) => {
            let Some(index) = validate_index(vm, args[1], length, "Subscript") else {
                return false;
            };
            args[0] = code_point_string(vm, receiver, index);
            true
        }
        Value::Obj(handle) if matches!(vm.heap.get(handle).data, ObjData::Range(_)) => {
            let range = vm.heap.range(handle);
            let Some((start, count, step)) = calculate_range(vm, range, length) else {
                return false;
            };
            let source = vm.heap.string(receiver).bytes().to_vec();
            let mut out = Vec::new();
            for i in 0..count {
                let index = (start as isize + i as isize * step) as usize;
                let code_point = utf8_decode(&source[index..]);
                if code_point != -1 {
                    utf8_encode(code_point as u32, &mut out);
                }
            }
            args[0] = Value::Obj(vm.alloc_string(StrObj::new(out)));
            true
        }
        _ => vm.fiber_error("Subscript must be a number or a range."),
    }
}

pub(crate) fn string_byte_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    let Some(index) = validate_index(vm, args[1], length, "Index") else {
        return false;
    };
    args[0] = Value::Num(vm.heap.string(receiver).bytes()[index] as f64);
    true
}

pub(crate) fn string_byte_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    args[0] = Value::Num(vm.heap.string(receiver).len() as f64);
    true
}

pub(crate) fn string_code_point_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    let Some(index) = validate_index(vm, args[1], length, "Index") else {
        return false;
    };
    let bytes = vm.heap.string(receiver).bytes();
    let value = if bytes[index] & 0xc0 == 0x80 {
        // A continuation byte is not a code point start.
        -1
    } else {
        utf8_decode(&bytes[index..])
    };
    args[0] = Value::Num(value as f64);
    true
}

pub(crate) fn string_contains(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let found = find_bytes(
        vm.heap.string(receiver).bytes(),
        vm.heap.string(other).bytes(),
        0,
    );
    args[0] = Value::Bool(found.is_some());
    true
}

pub(crate) fn string_ends_with(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let haystack = vm.heap.string(receiver).bytes();
    let needle = vm.heap.string(other).bytes();
    args[0] = Value::Bool(haystack.ends_with(needle));
    true
}

pub(crate) fn string_starts_with(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let haystack = vm.heap.string(receiver).bytes();
    let needle = vm.heap.string(other).bytes();
    args[0] = Value::Bool(haystack.starts_with(needle));
    true
}

pub(crate) fn string_index_of1(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let found = find_bytes(
        vm.heap.string(receiver).bytes(),
        vm.heap.string(other).bytes(),
        0,
    );
    args[0] = Value::Num(found.map_or(-1.0, |index| index as f64));
    true
}

pub(crate) fn string_index_of2(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(other) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    let Some(start) = validate_index(vm, args[2], length, "Start") else {
        return false;
    };
    let found = find_bytes(
        vm.heap.string(receiver).bytes(),
        vm.heap.string(other).bytes(),
        start,
    );
    args[0] = Value::Num(found.map_or(-1.0, |index| index as f64));
    true
}

/// Iteration steps over UTF-8 continuation bytes so indexes always land on
/// code point starts.
pub(crate) fn string_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    if args[1].is_null() {
        args[0] = if length == 0 {
            Value::Bool(false)
        } else {
            Value::Num(0.0)
        };
        return true;
    }
    let Some(index) = validate_int(vm, args[1], "Iterator") else {
        return false;
    };
    if index < 0.0 || index >= length as f64 {
        args[0] = Value::Bool(false);
        return true;
    }
    let mut index = index as usize;
    loop {
        index += 1;
        if index >= length {
            args[0] = Value::Bool(false);
            return true;
        }
        if vm.heap.string(receiver).bytes()[index] & 0xc0 != 0x80 {
            break;
        }
    }
    args[0] = Value::Num(index as f64);
    true
}

pub(crate) fn string_iterate_byte(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    if args[1].is_null() {
        args[0] = if length == 0 {
            Value::Bool(false)
        } else {
            Value::Num(0.0)
        };
        return true;
    }
    let Some(index) = validate_int(vm, args[1], "Iterator") else {
        return false;
    };
    if index < 0.0 || index + 1.0 >= length as f64 {
        args[0] = Value::Bool(false);
        return true;
    }
    args[0] = Value::Num(index + 1.0);
    true
}

pub(crate) fn string_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_string(vm, args);
    let length = vm.heap.string(receiver).len();
    let Some(index) = validate_index(vm, args[1], length, "Iterator") else {
        return false;
    };
    args[0] = code_point_string(vm, receiver, index);
    true
}

pub(crate) fn string_to_string(_vm: &mut Vm, _args: &mut [Value]) -> bool {
    true
}

pub(crate) fn string_from_code_point(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(code_point) = validate_int(vm, args[1], "Code point") else {
        return false;
    };
    if code_point < 0.0 {
        return vm.fiber_error("Code point cannot be negative.");
    }
    if code_point > 0x10ffff as f64 {
        return vm.fiber_error("Code point cannot be greater than 0x10ffff.");
    }
    let mut out = Vec::new();
    utf8_encode(code_point as u32, &mut out);
    args[0] = Value::Obj(vm.alloc_string(StrObj::new(out)));
    true
}

pub(crate) fn string_from_byte(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(byte) = validate_int(vm, args[1], "Byte") else {
        return false;
    };
    if byte < 0.0 {
        return vm.fiber_error("Byte cannot be negative.");
    }
    if byte > 0xff as f64 {
        return vm.fiber_error("Byte cannot be greater than 0xff.");
    }
    args[0] = Value::Obj(vm.alloc_string(StrObj::new(vec![byte as u8])));
    true
}

/// `$` delegates to the host-configured handler; null when unset.
pub(crate) fn string_dollar(vm: &mut Vm, args: &mut [Value]) -> bool {
    match vm.config.dollar_operator {
        Some(handler) => handler(vm, args),
        None => {
            args[0] = Value::Null;
            true
        }
    }
}

// ----------------------------------------------------------------------
// List

fn receiver_list(vm: &Vm, args: &[Value]) -> Handle {
    match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::List(_)) => handle,
        _ => unreachable!("receiver is a list"),
    }
}

pub(crate) fn list_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Obj(vm.alloc_list(Vec::new()));
    true
}

pub(crate) fn list_filled(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(size) = validate_int(vm, args[1], "Size") else {
        return false;
    };
    if size < 0.0 {
        return vm.fiber_error("Size cannot be negative.");
    }
    let list = vec![args[2]; size as usize];
    args[0] = Value::Obj(vm.alloc_list(list));
    true
}

pub(crate) fn list_add(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    vm.heap.list_mut(receiver).push(args[1]);
    args[0] = args[1];
    true
}

/// Used by list literals: adds and leaves the list itself for chaining.
pub(crate) fn list_add_core(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    vm.heap.list_mut(receiver).push(args[1]);
    true
}

pub(crate) fn list_clear(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    vm.heap.list_mut(receiver).clear();
    args[0] = Value::Null;
    true
}

pub(crate) fn list_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    args[0] = Value::Num(vm.heap.list(receiver).len() as f64);
    true
}

pub(crate) fn list_insert(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    // count + 1 so a value can be appended one past the end.
    let Some(index) = validate_index(vm, args[1], count + 1, "Index") else {
        return false;
    };
    vm.heap.list_mut(receiver).insert(index, args[2]);
    args[0] = args[2];
    true
}

pub(crate) fn list_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    if args[1].is_null() {
        args[0] = if count == 0 {
            Value::Bool(false)
        } else {
            Value::Num(0.0)
        };
        return true;
    }
    let Some(index) = validate_int(vm, args[1], "Iterator") else {
        return false;
    };
    if index < 0.0 || index + 1.0 >= count as f64 {
        args[0] = Value::Bool(false);
        return true;
    }
    args[0] = Value::Num(index + 1.0);
    true
}

pub(crate) fn list_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let Some(index) = validate_index(vm, args[1], count, "Iterator") else {
        return false;
    };
    args[0] = vm.heap.list(receiver)[index];
    true
}

pub(crate) fn list_remove_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let Some(index) = validate_index(vm, args[1], count, "Index") else {
        return false;
    };
    args[0] = vm.heap.list_mut(receiver).remove(index);
    true
}

pub(crate) fn list_remove_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let mut found = None;
    for index in 0..count {
        let element = vm.heap.list(receiver)[index];
        if vm.heap.values_equal(element, args[1]) {
            found = Some(index);
            break;
        }
    }
    args[0] = match found {
        Some(index) => vm.heap.list_mut(receiver).remove(index),
        None => Value::Null,
    };
    true
}

pub(crate) fn list_index_of(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let mut result = -1.0;
    for index in 0..count {
        let element = vm.heap.list(receiver)[index];
        if vm.heap.values_equal(element, args[1]) {
            result = index as f64;
            break;
        }
    }
    args[0] = Value::Num(result);
    true
}

pub(crate) fn list_swap(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let Some(a) = validate_index(vm, args[1], count, "Index 0") else {
        return false;
    };
    let Some(b) = validate_index(vm, args[2], count, "Index 1") else {
        return false;
    };
    vm.heap.list_mut(receiver).swap(a, b);
    true
}

pub(crate) fn list_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    match args[1] {
        Value::Num(_) => {
            let Some(index) = validate_index(vm, args[1], count, "Subscript") else {
                return false;
            };
            args[0] = vm.heap.list(receiver)[index];
            true
        }
        Value::Obj(handle) if matches!(vm.heap.get(handle).data, ObjData::Range(_)) => {
            let range = vm.heap.range(handle);
            let Some((start, length, step)) = calculate_range(vm, range, count) else {
                return false;
            };
            let mut result = Vec::with_capacity(length);
            for i in 0..length {
                let index = (start as isize + i as isize * step) as usize;
                result.push(vm.heap.list(receiver)[index]);
            }
            args[0] = Value::Obj(vm.alloc_list(result));
            true
        }
        _ => vm.fiber_error("Subscript must be a number or a range."),
    }
}

pub(crate) fn list_subscript_setter(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_list(vm, args);
    let count = vm.heap.list(receiver).len();
    let Some(index) = validate_index(vm, args[1], count, "Subscript") else {
        return false;
    };
    vm.heap.list_mut(receiver)[index] = args[2];
    args[0] = args[2];
    true
}

// ----------------------------------------------------------------------
// Map

fn receiver_map(vm: &Vm, args: &[Value]) -> Handle {
    match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Map(_)) => handle,
        _ => unreachable!("receiver is a map"),
    }
}

fn map_find(vm: &Vm, map: Handle, key: Value) -> Option<usize> {
    let entries = &vm.heap.map(map).entries;
    (0..entries.len()).find(|&index| vm.heap.values_equal(entries[index].0, key))
}

pub(crate) fn map_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Obj(vm.alloc_map());
    true
}

pub(crate) fn map_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    if !validate_key(vm, args[1]) {
        return false;
    }
    let receiver = receiver_map(vm, args);
    args[0] = match map_find(vm, receiver, args[1]) {
        Some(index) => vm.heap.map(receiver).entries[index].1,
        None => Value::Null,
    };
    true
}

pub(crate) fn map_subscript_setter(vm: &mut Vm, args: &mut [Value]) -> bool {
    if !validate_key(vm, args[1]) {
        return false;
    }
    let receiver = receiver_map(vm, args);
    match map_find(vm, receiver, args[1]) {
        Some(index) => vm.heap.map_mut(receiver).entries[index].1 = args[2],
        None => vm.heap.map_mut(receiver).entries.push((args[1], args[2])),
    }
    args[0] = args[2];
    true
}

pub(crate) fn map_add_core(vm: &mut Vm, args: &mut [Value]) -> bool {
    if !validate_key(vm, args[1]) {
        return false;
    }
    let receiver = receiver_map(vm, args);
    match map_find(vm, receiver, args[1]) {
        Some(index) => vm.heap.map_mut(receiver).entries[index].1 = args[2],
        None => vm.heap.map_mut(receiver).entries.push((args[1], args[2])),
    }
    true
}

pub(crate) fn map_clear(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_map(vm, args);
    vm.heap.map_mut(receiver).entries.clear();
    args[0] = Value::Null;
    true
}

pub(crate) fn map_contains_key(vm: &mut Vm, args: &mut [Value]) -> bool {
    if !validate_key(vm, args[1]) {
        return false;
    }
    let receiver = receiver_map(vm, args);
    args[0] = Value::Bool(map_find(vm, receiver, args[1]).is_some());
    true
}

pub(crate) fn map_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_map(vm, args);
    args[0] = Value::Num(vm.heap.map(receiver).entries.len() as f64);
    true
}

pub(crate) fn map_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_map(vm, args);
    let count = vm.heap.map(receiver).entries.len();
    if args[1].is_null() {
        args[0] = if count == 0 {
            Value::Bool(false)
        } else {
            Value::Num(0.0)
        };
        return true;
    }
    let Some(index) = validate_int(vm, args[1], "Iterator") else {
        return false;
    };
    if index < 0.0 || index + 1.0 >= count as f64 {
        args[0] = Value::Bool(false);
        return true;
    }
    args[0] = Value::Num(index + 1.0);
    true
}

pub(crate) fn map_remove(vm: &mut Vm, args: &mut [Value]) -> bool {
    if !validate_key(vm, args[1]) {
        return false;
    }
    let receiver = receiver_map(vm, args);
    args[0] = match map_find(vm, receiver, args[1]) {
        Some(index) => vm.heap.map_mut(receiver).entries.remove(index).1,
        None => Value::Null,
    };
    true
}

pub(crate) fn map_key_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_map(vm, args);
    let count = vm.heap.map(receiver).entries.len();
    let Some(index) = validate_index(vm, args[1], count, "Iterator") else {
        return false;
    };
    args[0] = vm.heap.map(receiver).entries[index].0;
    true
}

pub(crate) fn map_value_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let receiver = receiver_map(vm, args);
    let count = vm.heap.map(receiver).entries.len();
    let Some(index) = validate_index(vm, args[1], count, "Iterator") else {
        return false;
    };
    args[0] = vm.heap.map(receiver).entries[index].1;
    true
}

// ----------------------------------------------------------------------
// Range

fn receiver_range(vm: &Vm, args: &[Value]) -> RangeObj {
    match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Range(_)) => {
            vm.heap.range(handle)
        }
        _ => unreachable!("receiver is a range"),
    }
}

pub(crate) fn range_from(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(receiver_range(vm, args).from);
    true
}

pub(crate) fn range_to(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(receiver_range(vm, args).to);
    true
}

pub(crate) fn range_min(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(receiver_range(vm, args).min());
    true
}

pub(crate) fn range_max(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(receiver_range(vm, args).max());
    true
}

pub(crate) fn range_is_inclusive(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(receiver_range(vm, args).is_inclusive);
    true
}

/// Ranges iterate in unit steps toward `to`, never yielding past it.
pub(crate) fn range_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let range = receiver_range(vm, args);
    if range.from == range.to && !range.is_inclusive {
        args[0] = Value::Bool(false);
        return true;
    }
    if args[1].is_null() {
        args[0] = Value::Num(range.from);
        return true;
    }
    let Some(mut iterator) = validate_num(vm, args[1], "Iterator") else {
        return false;
    };
    if range.from < range.to {
        iterator += 1.0;
        let done = if range.is_inclusive {
            iterator > range.to
        } else {
            iterator >= range.to
        };
        if done {
            args[0] = Value::Bool(false);
            return true;
        }
    } else {
        iterator -= 1.0;
        let done = if range.is_inclusive {
            iterator < range.to
        } else {
            iterator <= range.to
        };
        if done {
            args[0] = Value::Bool(false);
            return true;
        }
    }
    args[0] = Value::Num(iterator);
    true
}

pub(crate) fn range_iterator_value(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = args[1];
    true
}

pub(crate) fn range_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let range = receiver_range(vm, args);
    let text = format!(
        "{}{}{}",
        format_num(range.from),
        if range.is_inclusive { ".." } else { "..." },
        format_num(range.to)
    );
    args[0] = vm.string_value(&text);
    true
}

// ----------------------------------------------------------------------
// Fn

pub(crate) fn fn_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    if validate_fn(vm, args[1], "Argument").is_none() {
        return false;
    }
    // The block argument is already a function; return it.
    args[0] = args[1];
    true
}

pub(crate) fn fn_arity(vm: &mut Vm, args: &mut [Value]) -> bool {
    let closure = match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Closure(_)) => handle,
        _ => unreachable!("receiver is a function"),
    };
    let arity = vm.heap.fun(vm.heap.closure(closure).fun).arity;
    args[0] = Value::Num(arity as f64);
    true
}

pub(crate) fn fn_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = vm.string_value("<fn>");
    true
}

/// `Fn.call(...)` with every arity: pushes a frame for the receiver closure
/// on the current fiber. Registered with the FUNCTION_CALL kind so the
/// dispatcher stores the frame first.
pub(crate) fn fn_call(vm: &mut Vm, args: &mut [Value]) -> bool {
    let closure = match args[0].as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Closure(_)) => handle,
        _ => unreachable!("receiver is a function"),
    };
    if let Some(fiber) = vm.fiber {
        vm.call_function(fiber, closure, args.len());
    }
    false
}

// ----------------------------------------------------------------------
// Fiber

pub(crate) fn fiber_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(closure) = validate_fn(vm, args[1], "Argument") else {
        return false;
    };
    let arity = vm.heap.fun(vm.heap.closure(closure).fun).arity;
    if arity > 1 {
        return vm.fiber_error("Function cannot take more than one parameter.");
    }
    let fiber = vm.new_fiber(closure);
    args[0] = Value::Obj(fiber);
    true
}

/// Storing null is not an abort; the dispatcher keeps running in that case.
pub(crate) fn fiber_abort(vm: &mut Vm, args: &mut [Value]) -> bool {
    let error = args[1];
    vm.fiber_error_value(error);
    error.is_null()
}

pub(crate) fn fiber_current(vm: &mut Vm, args: &mut [Value]) -> bool {
    match vm.fiber {
        Some(fiber) => {
            args[0] = Value::Obj(fiber);
            true
        }
        None => unreachable!("a fiber is always current while executing"),
    }
}

/// Relinquish control entirely; the VM goes idle until the host resumes it.
pub(crate) fn fiber_suspend(vm: &mut Vm, _args: &mut [Value]) -> bool {
    vm.fiber = None;
    false
}

pub(crate) fn fiber_yield(vm: &mut Vm, _args: &mut [Value]) -> bool {
    fiber_yield_value(vm, Value::Null, false)
}

pub(crate) fn fiber_yield1(vm: &mut Vm, args: &mut [Value]) -> bool {
    fiber_yield_value(vm, args[1], true)
}

fn fiber_yield_value(vm: &mut Vm, value: Value, has_value: bool) -> bool {
    let Some(current) = vm.fiber else {
        return false;
    };
    let caller = vm.heap.fiber(current).caller;
    vm.fiber = caller;
    vm.heap.fiber_mut(current).caller = None;
    vm.heap.fiber_mut(current).state = FiberState::Other;
    if let Some(caller) = caller {
        vm.heap.fiber_mut(caller).state = FiberState::Other;
        // The caller's `call` returns the yielded value.
        let len = vm.heap.fiber(caller).stack.len();
        vm.heap.fiber_mut(caller).stack[len - 1] = value;
        if has_value {
            // Two slots went into the yield call; one result slot remains for
            // when this fiber is resumed.
            vm.heap.fiber_mut(current).stack.pop();
        }
    }
    false
}

pub(crate) fn fiber_call(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, true, false, "call")
}

pub(crate) fn fiber_call1(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, true, true, "call")
}

pub(crate) fn fiber_error(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    args[0] = vm.heap.fiber(fiber).error;
    true
}

pub(crate) fn fiber_is_done(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    args[0] = Value::Bool(vm.heap.fiber(fiber).is_done());
    true
}

pub(crate) fn fiber_transfer(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, false, false, "transfer to")
}

pub(crate) fn fiber_transfer1(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, false, true, "transfer to")
}

/// Transfer, then poison the target so it unwinds when it resumes.
pub(crate) fn fiber_transfer_error(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, false, true, "transfer to");
    let error = args[1];
    vm.fiber_error_value(error);
    false
}

pub(crate) fn fiber_try(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, true, false, "try");
    fiber_mark_try(vm);
    false
}

pub(crate) fn fiber_try1(vm: &mut Vm, args: &mut [Value]) -> bool {
    let fiber = fiber_handle(vm, args[0]);
    vm.run_fiber(fiber, args, true, true, "try");
    fiber_mark_try(vm);
    false
}

fn fiber_mark_try(vm: &mut Vm) {
    // Only if the switch actually happened; a validation error leaves the
    // erroring fiber current.
    if let Some(current) = vm.fiber {
        if !vm.heap.fiber(current).has_error() {
            vm.heap.fiber_mut(current).state = FiberState::Try;
        }
    }
}

// ----------------------------------------------------------------------
// System

pub(crate) fn system_clock(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(vm.elapsed_seconds());
    true
}

pub(crate) fn system_gc(vm: &mut Vm, args: &mut [Value]) -> bool {
    vm.collect_garbage();
    args[0] = Value::Null;
    true
}

pub(crate) fn system_write_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(handle) = validate_string(vm, args[1], "Argument") else {
        return false;
    };
    let text = vm.heap.string(handle).to_string_lossy();
    vm.write_text(&text);
    args[0] = args[1];
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_decode_round_trip() {
        for &code_point in &[0x24u32, 0xa2, 0x20ac, 0x10348] {
            let mut bytes = Vec::new();
            utf8_encode(code_point, &mut bytes);
            assert_eq!(utf8_decode(&bytes), code_point as i32);
        }
    }

    #[test]
    fn test_utf8_decode_rejects_malformed() {
        assert_eq!(utf8_decode(&[0x80]), -1);
        assert_eq!(utf8_decode(&[0xc3]), -1);
        assert_eq!(utf8_decode(&[0xc3, 0x28]), -1);
        assert_eq!(utf8_decode(&[0xff]), -1);
    }

    #[test]
    fn test_find_bytes() {
        assert_eq!(find_bytes(b"hello world", b"world", 0), Some(6));
        assert_eq!(find_bytes(b"hello", b"world", 0), None);
        assert_eq!(find_bytes(b"aaa", b"a", 1), Some(1));
        assert_eq!(find_bytes(b"abc", b"", 2), Some(2));
        assert_eq!(find_bytes(b"abc", b"c", 3), None);
    }
}
