//! String semantics: byte vs code point views, searching, slicing, and the
//! construction primitives.

mod common;

use common::{run_error, run_ok};

#[test]
fn test_count_is_code_points_and_byte_count_is_bytes() {
    assert_eq!(run_ok("System.print(\"hello\".count)\n"), "5\n");
    assert_eq!(
        run_ok("System.print(\"h\\u00e9llo\".count)\nSystem.print(\"h\\u00e9llo\".byteCount_)\n"),
        "5\n6\n"
    );
    assert_eq!(run_ok("System.print(\"\".count)\n"), "0\n");
}

#[test]
fn test_concat_and_repeat() {
    assert_eq!(run_ok("System.print(\"foo\" + \"bar\")\n"), "foobar\n");
    assert_eq!(run_ok("System.print(\"ab\" * 3)\n"), "ababab\n");
    assert_eq!(run_error("\"a\" + 1\n"), "Right operand must be a string.");
}

#[test]
fn test_subscript_yields_code_points() {
    assert_eq!(run_ok("System.print(\"hello\"[1])\n"), "e\n");
    assert_eq!(run_ok("System.print(\"h\\u00e9llo\"[1])\n"), "\u{e9}\n");
    assert_eq!(run_ok("System.print(\"hello\"[-1])\n"), "o\n");
    assert_eq!(run_error("\"abc\"[10]\n"), "Subscript out of bounds.");
}

#[test]
fn test_range_subscript_selects_code_points() {
    assert_eq!(run_ok("System.print(\"hello\"[1..3])\n"), "ell\n");
    assert_eq!(run_ok("System.print(\"hello\"[1...3])\n"), "el\n");
    assert_eq!(run_ok("System.print(\"hello\"[3..1])\n"), "lle\n");
    assert_eq!(run_ok("System.print(\"hello\"[0..-1])\n"), "hello\n");
}

#[test]
fn test_byte_and_code_point_access() {
    assert_eq!(run_ok("System.print(\"A\".byteAt_(0))\n"), "65\n");
    assert_eq!(run_ok("System.print(\"h\\u00e9\".codePointAt_(1))\n"), "233\n");
    // A continuation byte is not a code point start.
    assert_eq!(run_ok("System.print(\"h\\u00e9\".codePointAt_(2))\n"), "-1\n");
    assert_eq!(run_ok("System.print(\"abc\".bytes[1])\n"), "98\n");
    assert_eq!(run_ok("System.print(\"h\\u00e9llo\".bytes.count)\n"), "6\n");
    assert_eq!(run_ok("System.print(\"h\\u00e9llo\".codePoints.count)\n"), "5\n");
}

#[test]
fn test_from_code_point_round_trip() {
    assert_eq!(run_ok("System.print(String.fromCodePoint(65))\n"), "A\n");
    assert_eq!(
        run_ok("System.print(String.fromCodePoint(233))\n"),
        "\u{e9}\n"
    );
    let source = "\
var s = \"h\\u00e9llo\"
System.print(String.fromCodePoint(s.codePointAt_(1)) == s[1])
";
    assert_eq!(run_ok(source), "true\n");
}

#[test]
fn test_from_code_point_bounds() {
    assert_eq!(
        run_error("String.fromCodePoint(-1)\n"),
        "Code point cannot be negative."
    );
    assert_eq!(
        run_error("String.fromCodePoint(0x110000)\n"),
        "Code point cannot be greater than 0x10ffff."
    );
    assert_eq!(
        run_error("String.fromCodePoint(1.5)\n"),
        "Code point must be an integer."
    );
}

#[test]
fn test_from_byte_bounds() {
    assert_eq!(run_ok("System.print(String.fromByte(65))\n"), "A\n");
    assert_eq!(run_error("String.fromByte(-1)\n"), "Byte cannot be negative.");
    assert_eq!(
        run_error("String.fromByte(256)\n"),
        "Byte cannot be greater than 0xff."
    );
}

#[test]
fn test_searching() {
    assert_eq!(run_ok("System.print(\"banana\".contains(\"nan\"))\n"), "true\n");
    assert_eq!(run_ok("System.print(\"banana\".contains(\"x\"))\n"), "false\n");
    assert_eq!(run_ok("System.print(\"banana\".indexOf(\"na\"))\n"), "2\n");
    assert_eq!(run_ok("System.print(\"banana\".indexOf(\"na\", 3))\n"), "4\n");
    assert_eq!(run_ok("System.print(\"banana\".indexOf(\"x\"))\n"), "-1\n");
    assert_eq!(run_ok("System.print(\"file.txt\".endsWith(\".txt\"))\n"), "true\n");
    assert_eq!(run_ok("System.print(\"file.txt\".startsWith(\"file\"))\n"), "true\n");
}

#[test]
fn test_split_and_replace() {
    assert_eq!(
        run_ok("System.print(\"a,b,c\".split(\",\"))\n"),
        "[a, b, c]\n"
    );
    assert_eq!(run_ok("System.print(\"a,\".split(\",\"))\n"), "[a, ]\n");
    assert_eq!(
        run_ok("System.print(\"aaa\".replace(\"a\", \"b\"))\n"),
        "bbb\n"
    );
    assert_eq!(
        run_ok("System.print(\"hello world\".replace(\"world\", \"there\"))\n"),
        "hello there\n"
    );
}

#[test]
fn test_iteration_skips_continuation_bytes() {
    let source = "\
var starts = []
var s = \"h\\u00e9llo\"
var iter = s.iterate(null)
while (iter != false) {
  starts.add(iter)
  iter = s.iterate(iter)
}
System.print(starts)
";
    // The two-byte code point occupies bytes 1 and 2.
    assert_eq!(run_ok(source), "[0, 1, 3, 4, 5]\n");
}

#[test]
fn test_for_iteration_yields_characters() {
    let source = "\
var chars = []
for (c in \"h\\u00e9y\") chars.add(c)
System.print(chars.count)
System.print(chars[1])
";
    assert_eq!(run_ok(source), "3\n\u{e9}\n");
}

#[test]
fn test_to_string_is_identity() {
    assert_eq!(run_ok("var s = \"same\"\nSystem.print(Object.same(s, s.toString))\n"), "true\n");
}
