//! Fiber control flow: call, yield, transfer, try, abort, and the documented
//! precondition errors.

mod common;

use common::{run, run_error, run_ok};
use siskin::{ErrorKind, InterpretResult};

#[test]
fn test_call_with_parameter() {
    assert_eq!(
        run_ok("var f = Fiber.new {|x| System.print(x + 1) }\nf.call(41)\n"),
        "42\n"
    );
}

#[test]
fn test_call_binds_null_when_no_value_given() {
    assert_eq!(
        run_ok("var f = Fiber.new {|x| System.print(x) }\nf.call()\n"),
        "null\n"
    );
}

#[test]
fn test_yield_and_resume() {
    let source = "\
var f = Fiber.new {
  Fiber.yield(7)
  return 9
}
System.print(f.call())
System.print(f.isDone)
System.print(f.call())
System.print(f.isDone)
";
    assert_eq!(run_ok(source), "7\nfalse\n9\ntrue\n");
}

#[test]
fn test_yield_without_value_produces_null() {
    let source = "\
var f = Fiber.new {
  Fiber.yield()
  return 2
}
System.print(f.call())
System.print(f.call())
";
    assert_eq!(run_ok(source), "null\n2\n");
}

#[test]
fn test_resume_value_becomes_yield_result() {
    let source = "\
var f = Fiber.new {
  var got = Fiber.yield(\"first\")
  System.print(got)
}
System.print(f.call())
f.call(\"second\")
";
    assert_eq!(run_ok(source), "first\nsecond\n");
}

#[test]
fn test_generator_pattern() {
    let source = "\
var counter = Fiber.new {
  var i = 1
  while (true) {
    Fiber.yield(i)
    i = i + 1
  }
}
System.print(counter.call())
System.print(counter.call())
System.print(counter.call())
";
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn test_try_catches_abort() {
    assert_eq!(
        run_ok("var f = Fiber.new { Fiber.abort(\"oops\") }\nSystem.print(f.try())\n"),
        "oops\n"
    );
}

#[test]
fn test_try_catches_runtime_errors() {
    let source = "\
var f = Fiber.new { [1][9] }
System.print(f.try())
System.print(f.isDone)
System.print(f.error)
";
    assert_eq!(
        run_ok(source),
        "Subscript out of bounds.\ntrue\nSubscript out of bounds.\n"
    );
}

#[test]
fn test_try_with_successful_fiber_returns_its_value() {
    assert_eq!(
        run_ok("var f = Fiber.new { 3 }\nSystem.print(f.try())\n"),
        "3\n"
    );
}

#[test]
fn test_abort_with_null_is_not_an_abort() {
    assert_eq!(
        run_ok("Fiber.abort(null)\nSystem.print(\"still here\")\n"),
        "still here\n"
    );
}

#[test]
fn test_uncaught_abort_reaches_the_host() {
    assert_eq!(run_error("Fiber.abort(\"boom\")\n"), "boom");
}

#[test]
fn test_error_slot_reflects_abort_value() {
    let source = "\
var f = Fiber.new { Fiber.abort(\"bad\") }
f.try()
System.print(f.error)
System.print(f.isDone)
";
    assert_eq!(run_ok(source), "bad\ntrue\n");
}

#[test]
fn test_error_is_null_before_any_abort() {
    assert_eq!(
        run_ok("var f = Fiber.new { 1 }\nSystem.print(f.error)\n"),
        "null\n"
    );
}

#[test]
fn test_transfer_abandons_the_calling_chain() {
    let source = "\
var other = Fiber.new {
  System.print(2)
}
System.print(1)
other.transfer()
System.print(3)
";
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn test_transfer_with_value_starts_parameterized_fiber() {
    assert_eq!(
        run_ok("var f = Fiber.new {|x| System.print(x) }\nf.transfer(5)\n"),
        "5\n"
    );
}

#[test]
fn test_transfer_error_poisons_the_target() {
    let run = run("var f = Fiber.new { System.print(\"never\") }\nf.transferError(\"poison\")\n");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(!run.output.contains("never"));
    assert!(run
        .errors
        .iter()
        .any(|(kind, message)| *kind == ErrorKind::Runtime && message == "poison"));
}

#[test]
fn test_current_is_a_fiber() {
    assert_eq!(run_ok("System.print(Fiber.current is Fiber)\n"), "true\n");
}

#[test]
fn test_suspend_goes_idle() {
    let run = run("System.print(1)\nFiber.suspend()\nSystem.print(2)\n");
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "1\n");
}

#[test]
fn test_cannot_call_root_fiber() {
    assert_eq!(run_error("Fiber.current.call()\n"), "Cannot call root fiber.");
}

#[test]
fn test_cannot_call_finished_fiber() {
    assert_eq!(
        run_error("var f = Fiber.new { 1 }\nf.call()\nf.call()\n"),
        "Cannot call a finished fiber."
    );
}

#[test]
fn test_cannot_call_aborted_fiber() {
    let source = "\
var f = Fiber.new { Fiber.abort(\"x\") }
f.try()
f.call()
";
    assert_eq!(run_error(source), "Cannot call an aborted fiber.");
}

#[test]
fn test_cannot_call_fiber_already_on_the_chain() {
    let source = "\
var a = null
var b = Fiber.new { a.call() }
a = Fiber.new { b.call() }
a.call()
";
    assert_eq!(run_error(source), "Fiber has already been called.");
}

#[test]
fn test_fiber_new_requires_function() {
    assert_eq!(
        run_error("Fiber.new(3)\n"),
        "Argument must be a function."
    );
    assert_eq!(
        run_error("Fiber.new {|a, b| a }\n"),
        "Function cannot take more than one parameter."
    );
}

#[test]
fn test_nested_fibers_unwind_through_callers() {
    let source = "\
var inner = Fiber.new { Fiber.abort(\"deep\") }
var outer = Fiber.new { inner.call() }
System.print(outer.try())
System.print(outer.error)
System.print(inner.error)
";
    assert_eq!(run_ok(source), "deep\ndeep\ndeep\n");
}

#[test]
fn test_fiber_is_done_only_after_completion() {
    let source = "\
var f = Fiber.new { Fiber.yield() }
System.print(f.isDone)
f.call()
System.print(f.isDone)
f.call()
System.print(f.isDone)
";
    assert_eq!(run_ok(source), "false\nfalse\ntrue\n");
}
