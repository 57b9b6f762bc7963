//! End-to-end language behavior: expressions, control flow, classes,
//! closures, and error reporting through the host callbacks.

mod common;

use common::{run, run_error, run_ok, run_with_config};
use siskin::value::{ForeignObj, ObjData, Value};
use siskin::{Config, ErrorKind, InterpretResult, Vm};

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(run_ok("System.print(1 + 2 * 3)\n"), "7\n");
    assert_eq!(run_ok("System.print((1 + 2) * 3)\n"), "9\n");
    assert_eq!(run_ok("System.print(7 % 3)\n"), "1\n");
    assert_eq!(run_ok("System.print(1 / 2)\n"), "0.5\n");
    assert_eq!(run_ok("System.print(-(3) + 1)\n"), "-2\n");
}

#[test]
fn test_comparison_and_logic() {
    assert_eq!(run_ok("System.print(1 < 2 && 2 <= 2)\n"), "true\n");
    assert_eq!(run_ok("System.print(1 > 2 || 2 >= 3)\n"), "false\n");
    assert_eq!(run_ok("System.print(!true)\n"), "false\n");
    assert_eq!(run_ok("System.print(null || \"fallback\")\n"), "fallback\n");
    assert_eq!(run_ok("System.print(false && 1)\n"), "false\n");
    assert_eq!(run_ok("System.print(true ? \"yes\" : \"no\")\n"), "yes\n");
}

#[test]
fn test_bitwise_operators() {
    assert_eq!(run_ok("System.print(5 & 3)\n"), "1\n");
    assert_eq!(run_ok("System.print(5 | 3)\n"), "7\n");
    assert_eq!(run_ok("System.print(5 ^ 3)\n"), "6\n");
    assert_eq!(run_ok("System.print(1 << 4)\n"), "16\n");
    assert_eq!(run_ok("System.print(16 >> 2)\n"), "4\n");
    assert_eq!(run_ok("System.print(~0)\n"), "4294967295\n");
}

#[test]
fn test_equality_across_types() {
    assert_eq!(run_ok("System.print(1 == \"1\")\n"), "false\n");
    assert_eq!(run_ok("System.print(1 != \"1\")\n"), "true\n");
    assert_eq!(run_ok("System.print(\"a\" == \"a\")\n"), "true\n");
    assert_eq!(run_ok("System.print(null == false)\n"), "false\n");
}

#[test]
fn test_num_methods() {
    assert_eq!(run_ok("System.print(3.75.fraction)\n"), "0.75\n");
    assert_eq!(run_ok("System.print((-3.75).fraction)\n"), "-0.75\n");
    assert_eq!(run_ok("System.print((-3.75).truncate)\n"), "-3\n");
    assert_eq!(run_ok("System.print((-8).sign)\n"), "-1\n");
    assert_eq!(run_ok("System.print(0.sign)\n"), "0\n");
    assert_eq!(run_ok("System.print(10.clamp(1, 5))\n"), "5\n");
    assert_eq!(run_ok("System.print(2.pow(10))\n"), "1024\n");
    assert_eq!(run_ok("System.print(9.sqrt)\n"), "3\n");
    assert_eq!(run_ok("System.print(3.7.floor)\n"), "3\n");
    assert_eq!(run_ok("System.print((0 / 0).isNan)\n"), "true\n");
    assert_eq!(run_ok("System.print((1 / 0).isInfinity)\n"), "true\n");
    assert_eq!(run_ok("System.print(4.isInteger)\n"), "true\n");
    assert_eq!(run_ok("System.print(4.5.isInteger)\n"), "false\n");
    assert_eq!(run_ok("System.print(3.min(7))\n"), "3\n");
    assert_eq!(run_ok("System.print(3.max(7))\n"), "7\n");
}

#[test]
fn test_num_constants() {
    assert_eq!(run_ok("System.print(Num.pi)\n"), "3.141592653589793\n");
    assert_eq!(
        run_ok("System.print(Num.maxSafeInteger)\n"),
        "9007199254740991\n"
    );
    assert_eq!(
        run_ok("System.print(Num.minSafeInteger)\n"),
        "-9007199254740991\n"
    );
    assert_eq!(run_ok("System.print(Num.largest > 1e308)\n"), "true\n");
    assert_eq!(
        run_ok("System.print(Num.smallest > 0 && Num.smallest < 1e-307)\n"),
        "true\n"
    );
    assert_eq!(run_ok("System.print(Num.nan.isNan)\n"), "true\n");
    assert_eq!(run_ok("System.print(Num.infinity.isInfinity)\n"), "true\n");
    assert_eq!(run_ok("System.print(Num.tau > 6.28 && Num.tau < 6.29)\n"), "true\n");
}

#[test]
fn test_num_from_string_round_trip() {
    assert_eq!(run_ok("System.print(Num.fromString(\"42\"))\n"), "42\n");
    assert_eq!(run_ok("System.print(Num.fromString(\"3.25\"))\n"), "3.25\n");
    assert_eq!(run_ok("System.print(Num.fromString(\"nope\"))\n"), "null\n");
    assert_eq!(
        run_ok("var n = 12.5\nSystem.print(Num.fromString(n.toString) == n)\n"),
        "true\n"
    );
}

#[test]
fn test_type_reflection() {
    assert_eq!(run_ok("System.print(3.type)\n"), "Num\n");
    assert_eq!(run_ok("System.print(3.type.name)\n"), "Num\n");
    assert_eq!(run_ok("System.print(3 is Num)\n"), "true\n");
    assert_eq!(run_ok("System.print(3 is Object)\n"), "true\n");
    assert_eq!(run_ok("System.print(\"s\" is Sequence)\n"), "true\n");
    assert_eq!(run_ok("System.print(3 is String)\n"), "false\n");
    assert_eq!(run_ok("System.print(Object.supertype)\n"), "null\n");
    assert_eq!(run_ok("System.print(String.supertype.name)\n"), "Sequence\n");
    assert_eq!(run_ok("System.print(Object.name)\n"), "Object\n");
    assert_eq!(run_ok("System.print(Bool.attributes)\n"), "null\n");
    assert_eq!(run_ok("System.print(Object.same(1, 1))\n"), "true\n");
    assert_eq!(run_ok("System.print(Object.same(1, 2))\n"), "false\n");
}

#[test]
fn test_variables_and_scope() {
    assert_eq!(run_ok("var x = 3\nx = x + 1\nSystem.print(x)\n"), "4\n");
    assert_eq!(
        run_ok("var x = \"outer\"\n{\n  var x = \"inner\"\n  System.print(x)\n}\nSystem.print(x)\n"),
        "inner\nouter\n"
    );
}

#[test]
fn test_while_break_continue() {
    let source = "\
var i = 0
var total = 0
while (true) {
  i = i + 1
  if (i > 5) break
  if (i % 2 == 0) continue
  total = total + i
}
System.print(total)
";
    assert_eq!(run_ok(source), "9\n");
}

#[test]
fn test_for_over_range() {
    assert_eq!(run_ok("for (i in 1..3) System.print(i)\n"), "1\n2\n3\n");
}

#[test]
fn test_conditionals() {
    let source = "\
var check = Fn.new {|n|
  if (n < 0) {
    System.print(\"negative\")
  } else if (n == 0) {
    System.print(\"zero\")
  } else {
    System.print(\"positive\")
  }
}
check.call(-1)
check.call(0)
check.call(5)
";
    assert_eq!(run_ok(source), "negative\nzero\npositive\n");
}

#[test]
fn test_functions_and_closures() {
    let source = "\
var makeCounter = Fn.new {
  var count = 0
  return Fn.new {
    count = count + 1
    return count
  }
}
var counter = makeCounter.call()
System.print(counter.call())
System.print(counter.call())
var other = makeCounter.call()
System.print(other.call())
";
    assert_eq!(run_ok(source), "1\n2\n1\n");
}

#[test]
fn test_function_arity_and_recursion() {
    assert_eq!(run_ok("System.print(Fn.new {|a, b| a + b }.arity)\n"), "2\n");
    let source = "\
var fib = Fn.new {|n|
  if (n < 2) return n
  return fib.call(n - 1) + fib.call(n - 2)
}
System.print(fib.call(10))
";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn test_function_missing_arguments_errors() {
    let message = run_error("Fn.new {|a, b| a + b }.call(1)\n");
    assert_eq!(message, "Function expects more arguments.");
}

#[test]
fn test_classes_fields_and_constructors() {
    let source = "\
class Point {
  construct new(x, y) {
    _x = x
    _y = y
  }
  x { _x }
  y { _y }
  x=(value) { _x = value }
  +(other) { Point.new(_x + other.x, _y + other.y) }
  toString { \"(\" + _x.toString + \", \" + _y.toString + \")\" }
}
var p = Point.new(1, 2)
System.print(p.x)
p.x = 10
System.print(p)
System.print(p + Point.new(1, 1))
";
    assert_eq!(run_ok(source), "1\n(10, 2)\n(11, 3)\n");
}

#[test]
fn test_inheritance_and_super() {
    let source = "\
class Animal {
  construct new(name) {
    _name = name
  }
  name { _name }
  speak { _name + \" makes a sound\" }
}
class Dog is Animal {
  construct new(name) {
    super(name)
  }
  speak { super.speak + \" (woof)\" }
}
var d = Dog.new(\"Rex\")
System.print(d.speak)
System.print(d is Animal)
System.print(d.type.name)
";
    assert_eq!(
        run_ok(source),
        "Rex makes a sound (woof)\ntrue\nDog\n"
    );
}

#[test]
fn test_constructors_are_inherited() {
    let source = "\
class Base {
  construct new(tag) {
    _tag = tag
  }
  tag { _tag }
}
class Derived is Base {}
System.print(Derived.new(\"d\").tag)
";
    assert_eq!(run_ok(source), "d\n");
}

#[test]
fn test_static_methods() {
    let source = "\
class Config {
  static version { \"1.2\" }
  static describe(name) { name + \" v\" + version }
}
System.print(Config.describe(\"tool\"))
";
    assert_eq!(run_ok(source), "tool v1.2\n");
}

#[test]
fn test_instance_default_to_string() {
    let source = "\
class Widget {
  construct new() {}
}
System.print(Widget.new())
";
    assert_eq!(run_ok(source), "instance of Widget\n");
}

#[test]
fn test_subscript_methods_on_user_class() {
    let source = "\
class Grid {
  construct new() {
    _cells = []
  }
  [index] { _cells[index] }
  [index]=(value) {
    while (_cells.count <= index) _cells.add(null)
    _cells[index] = value
  }
}
var g = Grid.new()
g[2] = \"x\"
System.print(g[2])
System.print(g[0])
";
    assert_eq!(run_ok(source), "x\nnull\n");
}

#[test]
fn test_sealed_classes_cannot_be_inherited() {
    let message = run_error("class Sneaky is Num {}\n");
    assert_eq!(
        message,
        "Class 'Sneaky' cannot inherit from built-in class 'Num'."
    );
}

#[test]
fn test_inheriting_from_non_class_errors() {
    let message = run_error("class Bad is 3 {}\n");
    assert_eq!(message, "Class 'Bad' cannot inherit from a non-class object.");
}

#[test]
fn test_method_not_found() {
    let message = run_error("true.frob\n");
    assert_eq!(message, "Bool does not implement 'frob'.");
    let message = run_error("3.frob(1, 2)\n");
    assert_eq!(message, "Num does not implement 'frob(_,_)'.");
}

#[test]
fn test_stack_trace_reported() {
    let run = run("var f = Fn.new { [1][3] }\nf.call()\n");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run
        .errors
        .iter()
        .any(|(kind, message)| *kind == ErrorKind::Runtime
            && message == "Subscript out of bounds."));
    let trace: Vec<&String> = run
        .errors
        .iter()
        .filter(|(kind, _)| *kind == ErrorKind::StackTrace)
        .map(|(_, message)| message)
        .collect();
    assert!(trace.iter().any(|name| name.as_str() == "(fn)"));
    assert!(trace.iter().any(|name| name.as_str() == "(script)"));
}

#[test]
fn test_compile_errors_reported() {
    let run = run("var = 3\n");
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run
        .errors
        .iter()
        .any(|(kind, _)| *kind == ErrorKind::Compile));
}

#[test]
fn test_undefined_variable_is_a_compile_error() {
    let run = run("System.print(missing)\n");
    assert_eq!(run.result, InterpretResult::CompileError);
}

#[test]
fn test_system_clock_and_gc() {
    assert_eq!(run_ok("System.print(System.clock >= 0)\n"), "true\n");
    assert_eq!(run_ok("System.gc()\nSystem.print(\"after\")\n"), "after\n");
}

#[test]
fn test_write_and_print_all() {
    assert_eq!(run_ok("System.write(\"a\")\nSystem.write(\"b\")\n"), "ab");
    assert_eq!(run_ok("System.printAll([\"a\", 1, true])\n"), "a1true\n");
    assert_eq!(run_ok("System.writeAll([\"x\", \"y\"])\n"), "xy");
    assert_eq!(run_ok("System.print\n"), "\n");
}

#[test]
fn test_collector_survives_garbage_churn() {
    let mut config = Config::default();
    config.initial_heap_size = 50 * 1024;
    config.min_heap_size = 10 * 1024;
    config.heap_growth_percent = 50;
    let source = "\
var keep = []
var i = 0
while (i < 500) {
  var garbage = \"tmp-\" + i.toString
  if (i % 100 == 0) keep.add(garbage)
  i = i + 1
}
System.print(keep.count)
System.print(keep[0])
";
    let run = run_with_config(config, source);
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "5\ntmp-0\n");
}

#[test]
fn test_imports_load_modules() {
    let mut config = Config::default();
    config.load_module = Some(Box::new(|name| {
        if name == "greeting" {
            Some("var message = \"hi from module\"\nSystem.print(\"loading\")\n".to_string())
        } else {
            None
        }
    }));
    let source = "\
import \"greeting\" for message
System.print(message)
";
    let run = run_with_config(config, source);
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "loading\nhi from module\n");
}

#[test]
fn test_import_missing_module_errors() {
    let run = run("import \"nowhere\"\n");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run
        .errors
        .iter()
        .any(|(kind, message)| *kind == ErrorKind::Runtime
            && message == "Could not load module 'nowhere'."));
}

fn double_it(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[1].as_num().unwrap_or(0.0);
    args[0] = Value::Num(n * 2.0);
    true
}

#[test]
fn test_foreign_methods_bind_through_the_host() {
    let mut config = Config::default();
    config.bind_foreign_method = Some(Box::new(|module, class, is_static, signature| {
        if module == "main" && class == "Echo" && !is_static && signature == "twice(_)" {
            Some(double_it)
        } else {
            None
        }
    }));
    let source = "\
class Echo {
  construct new() {}
  foreign twice(n)
}
System.print(Echo.new().twice(21))
";
    let run = run_with_config(config, source);
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "42\n");
}

#[test]
fn test_unbound_foreign_method_errors() {
    let run = run("class Echo {\n  foreign twice(n)\n}\n");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.iter().any(|(kind, message)| {
        *kind == ErrorKind::Runtime
            && message == "Could not find foreign method 'twice(_)' for class Echo in module 'main'."
    }));
}

fn blob_allocate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = match args[0] {
        Value::Obj(handle) => handle,
        _ => return vm.fiber_error("expected class receiver"),
    };
    let handle = vm.alloc(
        Some(class),
        ObjData::Foreign(ForeignObj { data: vec![7] }),
    );
    args[0] = Value::Obj(handle);
    true
}

#[test]
fn test_foreign_classes_allocate_through_the_host() {
    let mut config = Config::default();
    config.bind_foreign_class = Some(Box::new(|_module, _class| {
        siskin::ForeignClassMethods {
            allocate: Some(blob_allocate),
        }
    }));
    let source = "\
foreign class Blob {
  construct new() {}
}
var b = Blob.new()
System.print(b is Blob)
System.print(b.type.name)
";
    let run = run_with_config(config, source);
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "true\nBlob\n");
}

#[test]
fn test_dollar_operator_defaults_to_null() {
    assert_eq!(run_ok("System.print(\"probe\" $ 1)\n"), "null\n");
}

#[test]
fn test_dollar_operator_uses_host_hook() {
    let mut config = Config::default();
    config.dollar_operator = Some(|vm, args| {
        args[0] = vm.string_value("handled");
        true
    });
    let run = run_with_config(config, "System.print(\"probe\" $ 1)\n");
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "handled\n");
}
