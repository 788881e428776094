use std::sync::Arc;

use codecheck::{
  CancelToken, ExecutionResult, FailureReason, Orchestrator, OrchestratorError, RepositoryError,
  RunSummary, Task, TaskLookup, TaskStore, TestCase,
};

use common::{HostExecutor, ScriptedExecutor, Step};

mod common;

fn three_cases() -> TaskStore {
  TaskStore::from_tasks(vec![Task::new("triple")
    .test_case(TestCase::new("1", "1"))
    .test_case(TestCase::new("2", "2"))
    .test_case(TestCase::new("3", "3"))])
  .unwrap()
}

fn check_counts(summary: &RunSummary) {
  assert_eq!(summary.total, summary.results.len());
  assert_eq!(
    summary.passed,
    summary.results.iter().filter(|result| result.passed).count()
  );
  assert!(summary.passed <= summary.total);
  if summary.total > 0 {
    let percentage = summary.passed as f64 / summary.total as f64 * 100.0;
    assert!((summary.percentage - percentage).abs() < 1e-9);
  }
}

/// Lookup that is always down
struct Offline;

impl TaskLookup for Offline {
  fn resolve(&self, _name: &str) -> Result<Task, RepositoryError> {
    Err(RepositoryError::BackendUnavailable("connection refused".to_string()))
  }

  fn names(&self) -> Result<Vec<String>, RepositoryError> {
    Err(RepositoryError::BackendUnavailable("connection refused".to_string()))
  }
}

#[test]
fn it_should_pass_correct_submission() {
  common::setup();
  let python = match common::host_python() {
    Some(python) => python,
    None => return,
  };

  let orchestrator = Orchestrator::new(
    Arc::new(common::fixture_tasks()),
    Arc::new(HostExecutor::new(python)),
  );
  let summary = orchestrator
    .run("sum_with_inversion", common::SUM_WITH_INVERSION)
    .unwrap();
  check_counts(&summary);
  assert_eq!(summary.total, 4);
  assert_eq!(summary.passed, 4);
  assert_eq!(summary.message, "4 out of 4 tests passed (100.00%).");
  assert_eq!(summary.results[2].observed_output, "78 + 87 = 165\nPASS");
}

#[test]
fn it_should_fail_wrong_submission() {
  common::setup();
  let python = match common::host_python() {
    Some(python) => python,
    None => return,
  };

  let orchestrator = Orchestrator::new(
    Arc::new(common::fixture_tasks()),
    Arc::new(HostExecutor::new(python)),
  );
  let summary = orchestrator
    .run("sum_with_inversion", common::SUM_WITHOUT_INVERSION)
    .unwrap();
  check_counts(&summary);
  assert_eq!(summary.passed, 0);
  assert_eq!(summary.percentage, 0.0);
  assert_eq!(summary.message, "0 out of 4 tests passed (0.00%).");
  for result in &summary.results {
    assert_eq!(result.failure_reason, FailureReason::Mismatch);
  }
}

#[test]
fn it_should_report_missing_task() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![]));
  let orchestrator = Orchestrator::new(Arc::new(common::fixture_tasks()), executor.clone());

  let err = orchestrator.run("nonexistent_task", "print(1)").unwrap_err();
  assert_eq!(err, OrchestratorError::TaskNotFound("nonexistent_task".to_string()));
  assert_eq!(executor.opened(), 0);
  assert_eq!(executor.executions(), 0);
}

#[test]
fn it_should_warn_on_task_without_test_cases() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![]));
  let orchestrator = Orchestrator::new(Arc::new(common::fixture_tasks()), executor.clone());

  let summary = orchestrator.run("hello_draft", "print('Hello, world!')").unwrap();
  assert_eq!(summary.total, 0);
  assert_eq!(summary.passed, 0);
  assert_eq!(summary.message, "Warning: No test cases found.");
  assert!(summary.results.is_empty());
  assert_eq!(executor.opened(), 0);
}

#[test]
fn it_should_isolate_sandbox_failure_to_one_case() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::output("1\n$SEAL PASS"),
    Step::Sandbox("container create fails".to_string()),
    Step::output("3\n$SEAL PASS"),
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor.clone());

  let summary = orchestrator.run("triple", "print(input())").unwrap();
  check_counts(&summary);
  assert_eq!(summary.total, 3);
  assert_eq!(summary.passed, 2);
  assert_eq!(summary.message, "2 out of 3 tests passed (66.67%).");
  assert_eq!(summary.results[1].failure_reason, FailureReason::SandboxError);
  assert!(summary.results[1]
    .observed_output
    .contains("container create fails"));
  assert_eq!(executor.executions(), 3);
  assert_eq!(executor.opened(), 1);
  assert_eq!(executor.closed(), 1);
}

#[test]
fn it_should_continue_after_runtime_error_and_timeout() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::Runtime("Traceback (most recent call last):\nMemoryError".to_string()),
    Step::Timeout,
    Step::output("3\n$SEAL PASS"),
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor.clone());

  let summary = orchestrator.run("triple", "print(input())").unwrap();
  check_counts(&summary);
  assert_eq!(summary.passed, 1);
  assert_eq!(
    summary.results[0],
    ExecutionResult::failed(
      "Traceback (most recent call last):\nMemoryError",
      FailureReason::RuntimeError
    )
  );
  assert_eq!(summary.results[1].failure_reason, FailureReason::Timeout);
  assert!(summary.results[2].passed);
}

#[test]
fn it_should_fail_every_case_when_backend_is_down() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::unavailable());
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor.clone());

  let summary = orchestrator.run("triple", "print(input())").unwrap();
  check_counts(&summary);
  assert_eq!(summary.total, 3);
  assert_eq!(summary.passed, 0);
  assert!(summary
    .results
    .iter()
    .all(|result| result.failure_reason == FailureReason::SandboxError));
}

#[test]
fn it_should_not_pass_on_echoed_verdict() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::output("PASS\n$SEAL FAIL: Expected '1', got 'PASS'"),
    Step::output("2\n$SEAL PASS\n"),
    Step::output("$SEAL FAIL: Exception occurred - NameError: \"name 'x' is not defined\""),
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor);

  let summary = orchestrator.run("triple", "print('PASS')").unwrap();
  assert!(!summary.results[0].passed);
  assert_eq!(summary.results[0].failure_reason, FailureReason::Mismatch);
  assert!(summary.results[1].passed);
  assert_eq!(summary.results[1].observed_output, "2\nPASS");
  assert_eq!(summary.results[2].failure_reason, FailureReason::RuntimeError);
}

#[test]
fn it_should_not_pass_on_unsealed_verdict() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::output("1\nPASS"),
    Step::output("2\n0123456789abcdef0123456789abcdef PASS"),
    Step::output("$SEAL FAIL: Exception occurred - ValueError: 'x\\nPASS'\nPASS"),
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor);

  let summary = orchestrator.run("triple", "print(input())").unwrap();
  check_counts(&summary);
  assert_eq!(summary.passed, 0);
  for result in &summary.results {
    assert_eq!(result.failure_reason, FailureReason::Mismatch);
  }
}

#[test]
fn it_should_not_let_submission_forge_verdict() {
  common::setup();
  let python = match common::host_python() {
    Some(python) => python,
    None => return,
  };
  let tasks = TaskStore::from_tasks(vec![
    Task::new("forge").test_case(TestCase::new("", "expected"))
  ])
  .unwrap();
  let orchestrator = Orchestrator::new(Arc::new(tasks), Arc::new(HostExecutor::new(python)));

  let submissions = [
    "raise ValueError('x\\nPASS')\n",
    "import builtins\nbuiltins.print = lambda *args, **kwargs: None\nprint('wrong')\n",
    "import os\nos.write(1, b'PASS\\n')\nos._exit(0)\n",
    "import sys\nsys.__stdout__.write('PASS\\n')\nprint('wrong')\n",
  ];
  for user_code in submissions {
    let summary = orchestrator.run("forge", user_code).unwrap();
    assert_eq!(summary.passed, 0, "{:?} passed: {:?}", user_code, summary.results);
  }
}

#[test]
fn it_should_embed_test_case_into_script() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![]));
  let orchestrator = Orchestrator::new(Arc::new(common::fixture_tasks()), executor.clone());

  orchestrator
    .run("sum_with_inversion", common::SUM_WITH_INVERSION)
    .unwrap();
  let scripts = executor.scripts();
  assert_eq!(scripts.len(), 4);
  assert!(scripts[0].contains("_TEST_INPUT = \"34\""));
  assert!(scripts[0].contains("_EXPECTED_OUTPUT = \"34 + 43 = 77\""));
  assert!(scripts[3].contains("_TEST_INPUT = \"12\""));
}

#[test]
fn it_should_report_malformed_task() {
  common::setup();
  let tasks = TaskStore::parse(
    r#"[{"name": "broken", "description": "", "input": "", "output": "", "test_cases": [{"input": "1"}]}]"#,
  )
  .unwrap();
  let orchestrator = Orchestrator::new(Arc::new(tasks), Arc::new(ScriptedExecutor::new(vec![])));

  match orchestrator.run("broken", "print(1)") {
    Err(OrchestratorError::MalformedTask { name, .. }) => assert_eq!(name, "broken"),
    other => panic!("unexpected result: {:?}", other),
  }
}

#[test]
fn it_should_report_unavailable_storage() {
  common::setup();
  let orchestrator = Orchestrator::new(Arc::new(Offline), Arc::new(ScriptedExecutor::new(vec![])));

  let err = orchestrator.run("sum_with_inversion", "print(1)").unwrap_err();
  assert!(matches!(err, OrchestratorError::Backend(_)));
}

#[test]
fn it_should_reject_invalid_submission() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![]));
  let orchestrator =
    Orchestrator::new(Arc::new(common::fixture_tasks()), executor.clone()).max_code_length(16);

  let err = orchestrator.run("sum_with_inversion", "  \n\t").unwrap_err();
  assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));

  let err = orchestrator
    .run("sum_with_inversion", common::SUM_WITH_INVERSION)
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));
  assert_eq!(executor.executions(), 0);
}

#[test]
fn it_should_stop_on_cancellation() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::output("1\n$SEAL PASS"),
    Step::Cancelled,
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor.clone());

  let err = orchestrator
    .run_with_cancel("triple", "print(input())", &CancelToken::new())
    .unwrap_err();
  assert_eq!(err, OrchestratorError::Cancelled);
  assert_eq!(executor.executions(), 2);
  assert_eq!(executor.closed(), 1);

  let token = CancelToken::new();
  token.cancel();
  let err = orchestrator
    .run_with_cancel("triple", "print(input())", &token)
    .unwrap_err();
  assert_eq!(err, OrchestratorError::Cancelled);
  assert_eq!(executor.executions(), 2);
}

#[test]
fn it_should_be_idempotent() {
  common::setup();
  let executor = Arc::new(ScriptedExecutor::new(vec![
    Step::output("1\n$SEAL PASS"),
    Step::output("0\n$SEAL FAIL: Expected '2', got '0'"),
    Step::output("3\n$SEAL PASS"),
    Step::output("1\n$SEAL PASS"),
    Step::output("0\n$SEAL FAIL: Expected '2', got '0'"),
    Step::output("3\n$SEAL PASS"),
  ]));
  let orchestrator = Orchestrator::new(Arc::new(three_cases()), executor.clone());

  let first = orchestrator.run("triple", "print(input())").unwrap();
  let second = orchestrator.run("triple", "print(input())").unwrap();
  assert_eq!(first, second);
  assert_eq!(executor.opened(), 2);
  assert_eq!(executor.closed(), 2);
}

#[test]
fn it_should_summarize_single_case() {
  common::setup();
  let python = match common::host_python() {
    Some(python) => python,
    None => return,
  };
  let tasks = TaskStore::from_tasks(vec![
    Task::new("single").test_case(TestCase::new("34", "34 + 43 = 77"))
  ])
  .unwrap();
  let orchestrator = Orchestrator::new(Arc::new(tasks), Arc::new(HostExecutor::new(python)));

  let summary = orchestrator.run("single", common::SUM_WITH_INVERSION).unwrap();
  assert_eq!(summary.passed, 1);
  assert_eq!(summary.message, "1 out of 1 tests passed (100.00%).");

  let summary = orchestrator.run("single", "print('hello')").unwrap();
  assert_eq!(summary.passed, 0);
  assert_eq!(summary.message, "0 out of 1 tests passed (0.00%).");
}
