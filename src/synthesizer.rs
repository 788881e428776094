//! Builds the Python script that runs one submission against one test case.
//!
//! The script feeds the test input through an in-memory `sys.stdin`, captures
//! everything written to `sys.stdout`, and finishes with a verdict line:
//! `<seal> PASS` or `<seal> FAIL: ...`. The seal is fresh for every script,
//! so a verdict printed by the submission itself never carries it.

use std::fmt::Write;

use uuid::Uuid;

pub const VERDICT_PASS: &str = "PASS";

pub const VERDICT_FAIL: &str = "FAIL";

/// Prefix of the verdict line printed when the submission raised
pub const VERDICT_EXCEPTION: &str = "FAIL: Exception occurred";

const PRELUDE: &str = "# -*- coding: utf-8 -*-
import builtins
import io
import os
import sys

";

// Everything the harness needs after the submission ran is bound to a local
// before `exec`. The submission gets its own builtins table, so patching
// `print` or `repr` there cannot reach the harness. Fault texts go through
// `str.__repr__`, which never yields a line break.
const RUNNER: &str = r#"

def _run_test(source, input_data, expected_output, seal):
    write = sys.__stdout__.write
    flush = sys.__stdout__.flush
    describe = str.__repr__
    kind_of = type
    text_of = str
    fault_base = BaseException
    exit_type = SystemExit

    # 脚本经由 stdin 读入, 关闭后提交的代码无法再读到它
    try:
        os.close(0)
    except OSError:
        pass

    real_stdin, real_stdout = sys.stdin, sys.stdout
    buffer = io.StringIO()
    fault = None
    scope = {"__name__": "__main__", "__builtins__": dict(builtins.__dict__)}
    sys.stdin = io.StringIO(input_data)
    sys.stdout = buffer
    try:
        exec(compile(source, "<submission>", "exec"), scope)
    except exit_type:
        pass
    except fault_base as e:
        fault = e
    finally:
        sys.stdin, sys.stdout = real_stdin, real_stdout

    result = buffer.getvalue().strip()
    expected = expected_output.strip()
    if result:
        write(result + "\n")
    if fault is not None:
        try:
            kind = describe(kind_of(fault).__name__)[1:-1]
        except fault_base:
            kind = "Exception"
        try:
            message = describe(text_of(fault))
        except fault_base:
            message = "'<unprintable>'"
        write("%s FAIL: Exception occurred - %s: %s\n" % (seal, kind, message))
    elif result == expected:
        write("%s PASS\n" % seal)
    else:
        write("%s FAIL: Expected %s, got %s\n" % (seal, describe(expected), describe(result)))
    flush()


_run_test(_USER_CODE, _TEST_INPUT, _EXPECTED_OUTPUT, globals().pop("_SEAL"))
"#;

/// A synthesized test script with the seal its verdict line starts with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScript {
  source: String,
  seal: String,
}

impl TestScript {
  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn seal(&self) -> &str {
    &self.seal
  }
}

/// Fresh random seal for one test script
pub fn new_seal() -> String {
  Uuid::new_v4().simple().to_string()
}

/// Generate the test script for `user_code` and one test case
pub fn synthesize(user_code: &str, test_input: &str, expected_output: &str) -> TestScript {
  synthesize_with_seal(user_code, test_input, expected_output, &new_seal())
}

/// Same as [`synthesize`] with a caller-chosen seal
pub fn synthesize_with_seal(
  user_code: &str,
  test_input: &str,
  expected_output: &str,
  seal: &str,
) -> TestScript {
  let mut source = String::with_capacity(
    PRELUDE.len() + RUNNER.len() + user_code.len() + test_input.len() + expected_output.len() + 192,
  );
  source.push_str(PRELUDE);
  source.push_str("_USER_CODE = ");
  source.push_str(&python_literal(user_code));
  source.push_str("\n_TEST_INPUT = ");
  source.push_str(&python_literal(test_input));
  source.push_str("\n_EXPECTED_OUTPUT = ");
  source.push_str(&python_literal(expected_output));
  source.push_str("\n_SEAL = ");
  source.push_str(&python_literal(seal));
  source.push_str(RUNNER);
  TestScript {
    source,
    seal: seal.to_string(),
  }
}

/// Quote `text` as a single-line Python string literal.
///
/// Every character that could end the literal or the line is escaped.
pub fn python_literal(text: &str) -> String {
  let mut literal = String::with_capacity(text.len() + 2);
  literal.push('"');
  for c in text.chars() {
    match c {
      '\\' => literal.push_str("\\\\"),
      '"' => literal.push_str("\\\""),
      '\'' => literal.push_str("\\'"),
      '\n' => literal.push_str("\\n"),
      '\r' => literal.push_str("\\r"),
      '\t' => literal.push_str("\\t"),
      c if (c as u32) < 0x20 || c as u32 == 0x7f => {
        let _ = write!(literal, "\\x{:02x}", c as u32);
      }
      // Line separators Python's tokenizer would treat as line breaks
      '\u{85}' | '\u{2028}' | '\u{2029}' => {
        let _ = write!(literal, "\\u{:04x}", c as u32);
      }
      c => literal.push(c),
    }
  }
  literal.push('"');
  literal
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_escape_quotes_and_backslashes() {
    assert_eq!(python_literal(r#"a"b'c\d"#), r#""a\"b\'c\\d""#);
  }

  #[test]
  fn it_should_keep_literal_on_one_line() {
    let literal = python_literal("line 1\nline 2\r\n\tend\u{2028}");
    assert!(!literal.contains('\n'));
    assert!(!literal.contains('\r'));
    assert_eq!(literal, r#""line 1\nline 2\r\n\tend\u2028""#);
  }

  #[test]
  fn it_should_escape_control_characters() {
    assert_eq!(python_literal("\u{0}\u{1b}\u{7f}"), r#""\x00\x1b\x7f""#);
  }

  #[test]
  fn it_should_keep_unicode() {
    assert_eq!(python_literal("Дано число"), "\"Дано число\"");
  }

  #[test]
  fn it_should_seal_every_script_differently() {
    let first = synthesize("print(1)", "", "1");
    let second = synthesize("print(1)", "", "1");
    assert_eq!(first.seal().len(), 32);
    assert_ne!(first.seal(), second.seal());
    assert!(first
      .source()
      .contains(&format!("_SEAL = \"{}\"", first.seal())));
  }
}
