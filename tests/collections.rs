//! Lists, maps, ranges, and the Sequence protocol family.

mod common;

use common::{run_error, run_ok};

#[test]
fn test_list_literals_and_printing() {
    assert_eq!(run_ok("System.print([])\n"), "[]\n");
    assert_eq!(run_ok("System.print([1, 2, 3])\n"), "[1, 2, 3]\n");
    assert_eq!(run_ok("System.print([1, \"two\", true, null])\n"), "[1, two, true, null]\n");
}

#[test]
fn test_list_filled() {
    assert_eq!(run_ok("System.print(List.filled(3, \"x\"))\n"), "[x, x, x]\n");
    assert_eq!(run_ok("System.print(List.filled(0, 1))\n"), "[]\n");
    assert_eq!(
        run_error("List.filled(-1, 1)\n"),
        "Size cannot be negative."
    );
}

#[test]
fn test_list_add_insert_remove_round_trip() {
    let source = "\
var l = [1, 2, 3]
l.insert(1, 9)
System.print(l)
System.print(l.removeAt(1))
System.print(l)
";
    assert_eq!(run_ok(source), "[1, 9, 2, 3]\n9\n[1, 2, 3]\n");
}

#[test]
fn test_list_insert_at_end_and_out_of_bounds() {
    assert_eq!(
        run_ok("var l = [1]\nl.insert(1, 2)\nSystem.print(l)\n"),
        "[1, 2]\n"
    );
    assert_eq!(run_error("[1].insert(5, 2)\n"), "Index out of bounds.");
    assert_eq!(run_error("[1][5]\n"), "Subscript out of bounds.");
}

#[test]
fn test_list_subscript_assignment_returns_value() {
    assert_eq!(
        run_ok("var l = [1, 2]\nSystem.print(l[1] = 9)\nSystem.print(l)\n"),
        "9\n[1, 9]\n"
    );
}

#[test]
fn test_list_negative_indexing() {
    assert_eq!(run_ok("System.print([1, 2, 3][-1])\n"), "3\n");
}

#[test]
fn test_list_range_subscript() {
    assert_eq!(run_ok("System.print([1, 2, 3, 4][1..2])\n"), "[2, 3]\n");
    assert_eq!(run_ok("System.print([1, 2, 3, 4][1...3])\n"), "[2, 3]\n");
    assert_eq!(run_ok("System.print([1, 2, 3][2..0])\n"), "[3, 2, 1]\n");
    assert_eq!(run_ok("System.print([1, 2, 3][0..-1])\n"), "[1, 2, 3]\n");
    assert_eq!(run_ok("System.print([][0..-1])\n"), "[]\n");
}

#[test]
fn test_list_search_and_swap() {
    assert_eq!(run_ok("System.print([1, 2, 3].indexOf(2))\n"), "1\n");
    assert_eq!(run_ok("System.print([1, 2, 3].indexOf(9))\n"), "-1\n");
    assert_eq!(run_ok("System.print([1, 2, 3].remove(2))\n"), "2\n");
    assert_eq!(run_ok("System.print([1, 2, 3].remove(9))\n"), "null\n");
    assert_eq!(
        run_ok("var l = [1, 2]\nl.swap(0, 1)\nSystem.print(l)\n"),
        "[2, 1]\n"
    );
}

#[test]
fn test_list_iteration_visits_every_element() {
    // Iteration must not stop one element early.
    let source = "\
var seen = []
for (x in [\"a\", \"b\", \"c\"]) seen.add(x)
System.print(seen.count)
System.print(seen)
";
    assert_eq!(run_ok(source), "3\n[a, b, c]\n");
    assert_eq!(run_ok("for (x in [7]) System.print(x)\n"), "7\n");
    assert_eq!(run_ok("for (x in []) System.print(x)\nSystem.print(\"end\")\n"), "end\n");
}

#[test]
fn test_list_concat_and_repeat() {
    assert_eq!(run_ok("System.print([1, 2] + [3])\n"), "[1, 2, 3]\n");
    assert_eq!(run_ok("System.print([1, 2] * 2)\n"), "[1, 2, 1, 2]\n");
    assert_eq!(run_ok("System.print([1] * 0)\n"), "[]\n");
}

#[test]
fn test_list_sort() {
    assert_eq!(run_ok("System.print([3, 1, 2].sort())\n"), "[1, 2, 3]\n");
    assert_eq!(
        run_ok("System.print([1, 3, 2].sort {|a, b| a > b })\n"),
        "[3, 2, 1]\n"
    );
}

#[test]
fn test_list_clear_and_add_all() {
    assert_eq!(
        run_ok("var l = [1, 2]\nl.clear()\nSystem.print(l.count)\n"),
        "0\n"
    );
    assert_eq!(
        run_ok("var l = [1]\nl.addAll([2, 3])\nSystem.print(l)\n"),
        "[1, 2, 3]\n"
    );
}

#[test]
fn test_map_basics() {
    let source = "\
var m = Map.new()
m[\"a\"] = 1
m[\"b\"] = 2
System.print(m.count)
System.print(m[\"a\"])
System.print(m[\"missing\"])
System.print(m.containsKey(\"b\"))
System.print(m.remove(\"a\"))
System.print(m.count)
";
    assert_eq!(run_ok(source), "2\n1\nnull\ntrue\n1\n1\n");
}

#[test]
fn test_map_keys_values_and_entries() {
    let source = "\
var m = Map.new()
m[\"x\"] = 10
System.print(m.keys.toList)
System.print(m.values.toList)
for (entry in m) {
  System.print(entry.key)
  System.print(entry.value)
}
System.print(m)
";
    assert_eq!(run_ok(source), "[x]\n[10]\nx\n10\n{x: 10}\n");
}

#[test]
fn test_map_overwrite_and_clear() {
    let source = "\
var m = Map.new()
m[\"k\"] = 1
m[\"k\"] = 2
System.print(m[\"k\"])
System.print(m.count)
m.clear()
System.print(m.count)
";
    assert_eq!(run_ok(source), "2\n1\n0\n");
}

#[test]
fn test_map_key_must_be_value_type() {
    assert_eq!(
        run_error("var m = Map.new()\nm[[1]] = 2\n"),
        "Key must be a value type."
    );
}

#[test]
fn test_range_endpoints() {
    let source = "\
var r = 1..5
System.print(r.from)
System.print(r.to)
System.print(r.isInclusive)
System.print((3...1).min)
System.print((3...1).max)
System.print(r)
System.print(1...5)
";
    assert_eq!(run_ok(source), "1\n5\ntrue\n1\n3\n1..5\n1...5\n");
}

#[test]
fn test_range_iteration_boundaries() {
    assert_eq!(run_ok("for (i in 1..1) System.print(i)\n"), "1\n");
    assert_eq!(
        run_ok("for (i in 1...1) System.print(i)\nSystem.print(\"end\")\n"),
        "end\n"
    );
    assert_eq!(run_ok("for (i in 3..1) System.print(i)\n"), "3\n2\n1\n");
    assert_eq!(run_ok("for (i in 1...4) System.print(i)\n"), "1\n2\n3\n");
}

#[test]
fn test_sequence_map_to_list() {
    assert_eq!(
        run_ok("System.print((1..5).map {|x| x * x }.toList)\n"),
        "[1, 4, 9, 16, 25]\n"
    );
}

#[test]
fn test_sequence_where_skip_take() {
    assert_eq!(
        run_ok("System.print((1..6).where {|x| x % 2 == 0 }.toList)\n"),
        "[2, 4, 6]\n"
    );
    assert_eq!(run_ok("System.print((1..5).skip(2).toList)\n"), "[3, 4, 5]\n");
    assert_eq!(run_ok("System.print((1..5).take(2).toList)\n"), "[1, 2]\n");
}

#[test]
fn test_sequence_reduce_and_joins() {
    assert_eq!(run_ok("System.print((1..3).reduce {|a, b| a + b })\n"), "6\n");
    assert_eq!(
        run_ok("System.print((1..4).reduce(10) {|a, b| a + b })\n"),
        "20\n"
    );
    assert_eq!(run_ok("System.print([\"a\", \"b\"].join(\"-\"))\n"), "a-b\n");
    assert_eq!(run_ok("System.print([1, 2].join())\n"), "12\n");
}

#[test]
fn test_sequence_predicates() {
    assert_eq!(run_ok("System.print((1..4).all {|x| x > 0 })\n"), "true\n");
    assert_eq!(run_ok("System.print((1..4).any {|x| x > 3 })\n"), "true\n");
    assert_eq!(run_ok("System.print((1..4).any {|x| x > 9 })\n"), "false\n");
    assert_eq!(run_ok("System.print([1, 2, 3].contains(2))\n"), "true\n");
    assert_eq!(run_ok("System.print([].isEmpty)\n"), "true\n");
    assert_eq!(run_ok("System.print([1].isEmpty)\n"), "false\n");
    assert_eq!(run_ok("System.print((1..5).count {|x| x > 2 })\n"), "3\n");
    assert_eq!(run_ok("System.print((1..5).count)\n"), "5\n");
}
