use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::{ExecuteError, OrchestratorError, RepositoryError};
use crate::repository::TaskLookup;
use crate::sandbox::{Execution, Executor};
use crate::synthesizer::{synthesize, VERDICT_EXCEPTION, VERDICT_FAIL, VERDICT_PASS};
use crate::task::{Task, TestCase};

/// Message of a run over a task without test cases
pub const NO_TEST_CASES: &str = "Warning: No test cases found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
  None,
  Mismatch,
  RuntimeError,
  Timeout,
  SandboxError,
}

/// Outcome of one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
  pub passed: bool,
  pub observed_output: String,
  pub failure_reason: FailureReason,
}

/// Aggregate outcome of one submission against one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
  pub task: String,
  pub total: usize,
  pub passed: usize,
  pub percentage: f64,
  pub message: String,
  pub results: Vec<ExecutionResult>,
}

/// Evaluates submissions against the test cases of stored tasks
pub struct Orchestrator {
  tasks: Arc<dyn TaskLookup>,
  executor: Arc<dyn Executor>,
  max_code_length: usize,
}

impl ExecutionResult {
  pub fn passed<S: Into<String>>(observed_output: S) -> Self {
    ExecutionResult {
      passed: true,
      observed_output: observed_output.into(),
      failure_reason: FailureReason::None,
    }
  }

  pub fn failed<S: Into<String>>(observed_output: S, failure_reason: FailureReason) -> Self {
    ExecutionResult {
      passed: false,
      observed_output: observed_output.into(),
      failure_reason,
    }
  }

  /// Classify the output of a test script by its final verdict line.
  ///
  /// Only a final line starting with `seal` is a verdict. The seal is dropped
  /// from the observed output.
  pub fn classify<S: Into<String>>(output: S, seal: &str) -> Self {
    let output: String = output.into();
    let marker = format!("{} ", seal);
    let verdict = output
      .lines()
      .rev()
      .map(str::trim)
      .find(|line| !line.is_empty())
      .unwrap_or_default()
      .strip_prefix(marker.as_str())
      .map(str::to_string);
    let observed = output.replace(marker.as_str(), "");

    match verdict {
      Some(verdict) if verdict == VERDICT_PASS => ExecutionResult::passed(observed),
      Some(verdict) if verdict.starts_with(VERDICT_EXCEPTION) => {
        ExecutionResult::failed(observed, FailureReason::RuntimeError)
      }
      Some(verdict) if verdict.starts_with(VERDICT_FAIL) => {
        ExecutionResult::failed(observed, FailureReason::Mismatch)
      }
      // The script never reached its verdict, e.g. the submission called os._exit
      _ => ExecutionResult::failed(observed, FailureReason::Mismatch),
    }
  }
}

impl RunSummary {
  /// Summarize a run over a task without test cases
  pub fn empty<S: Into<String>>(task: S) -> Self {
    RunSummary {
      task: task.into(),
      total: 0,
      passed: 0,
      percentage: 0.0,
      message: NO_TEST_CASES.to_string(),
      results: vec![],
    }
  }

  pub fn new<S: Into<String>>(task: S, results: Vec<ExecutionResult>) -> Self {
    let total = results.len();
    if total == 0 {
      return RunSummary::empty(task);
    }
    let passed = results.iter().filter(|result| result.passed).count();
    let percentage = passed as f64 / total as f64 * 100.0;
    RunSummary {
      task: task.into(),
      total,
      passed,
      percentage,
      message: format!(
        "{} out of {} tests passed ({:.2}%).",
        passed, total, percentage
      ),
      results,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.total == 0
  }
}

impl Display for RunSummary {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.message)
  }
}

impl Orchestrator {
  pub fn new(tasks: Arc<dyn TaskLookup>, executor: Arc<dyn Executor>) -> Self {
    Orchestrator {
      tasks,
      executor,
      max_code_length: 64 * 1024,
    }
  }

  pub fn max_code_length(mut self, value: usize) -> Self {
    self.max_code_length = value;
    self
  }

  /// Evaluate `user_code` against every test case of `task_name`
  pub fn run(&self, task_name: &str, user_code: &str) -> Result<RunSummary, OrchestratorError> {
    self.run_with_cancel(task_name, user_code, &CancelToken::new())
  }

  /// Same as [`Orchestrator::run`], in-flight executions stop once `cancel` fires
  pub fn run_with_cancel(
    &self,
    task_name: &str,
    user_code: &str,
    cancel: &CancelToken,
  ) -> Result<RunSummary, OrchestratorError> {
    self.check_submission(user_code)?;

    let task = self.resolve(task_name)?;
    info!("Loaded task '{}' successfully.", task.name);
    debug!("Test cases: {:?}", task.test_cases);

    if task.test_cases.is_empty() {
      warn!("No test cases found for task '{}'.", task.name);
      return Ok(RunSummary::empty(task.name));
    }

    let results = self.evaluate(&task, user_code, cancel)?;
    let summary = RunSummary::new(task.name, results);
    info!("Testing summary for {}: {}", summary.task, summary.message);
    Ok(summary)
  }

  fn check_submission(&self, user_code: &str) -> Result<(), OrchestratorError> {
    if user_code.trim().is_empty() {
      return Err(OrchestratorError::InvalidSubmission(
        "code is empty".to_string(),
      ));
    }
    if user_code.len() > self.max_code_length {
      return Err(OrchestratorError::InvalidSubmission(format!(
        "code is {} bytes, the limit is {} bytes",
        user_code.len(),
        self.max_code_length
      )));
    }
    Ok(())
  }

  fn resolve(&self, task_name: &str) -> Result<Task, OrchestratorError> {
    self.tasks.resolve(task_name).map_err(|err| {
      error!("Resolve task '{}' fails: {}", task_name, err);
      match err {
        RepositoryError::Malformed(message) => OrchestratorError::MalformedTask {
          name: task_name.to_string(),
          message,
        },
        err => err.into(),
      }
    })
  }

  fn evaluate(
    &self,
    task: &Task,
    user_code: &str,
    cancel: &CancelToken,
  ) -> Result<Vec<ExecutionResult>, OrchestratorError> {
    let total = task.test_cases.len();

    let mut session = match self.executor.open() {
      Ok(session) => session,
      Err(err) => {
        error!("Open execution backend fails, all {} test cases fail: {}", total, err);
        let result = ExecutionResult::failed(err.to_string(), FailureReason::SandboxError);
        return Ok(vec![result; total]);
      }
    };

    let mut results = Vec::with_capacity(total);
    for (idx, test_case) in task.test_cases.iter().enumerate() {
      let idx = idx + 1;
      if cancel.is_cancelled() {
        warn!("Run of task '{}' cancelled before test case {}", task.name, idx);
        return Err(OrchestratorError::Cancelled);
      }

      info!("Running test case {} with input: {}", idx, test_case.input);
      let script = synthesize(user_code, &test_case.input, &test_case.expected_output);
      let outcome = session.execute(script.source(), cancel);
      let result = match Self::judge(idx, test_case, script.seal(), outcome) {
        Some(result) => result,
        None => {
          warn!("Run of task '{}' cancelled during test case {}", task.name, idx);
          return Err(OrchestratorError::Cancelled);
        }
      };
      results.push(result);
    }
    Ok(results)
  }

  /// Turn one execution outcome into a test result, `None` when the run was cancelled
  fn judge(
    idx: usize,
    test_case: &TestCase,
    seal: &str,
    outcome: Result<Execution, ExecuteError>,
  ) -> Option<ExecutionResult> {
    let result = match outcome {
      Ok(execution) => {
        let output = execution.output_text().trim().to_string();
        debug!("Sandbox output for test case {}: {}", idx, output);
        let result = ExecutionResult::classify(output, seal);
        if result.passed {
          info!("Test case {} passed.", idx);
        } else {
          warn!(
            "Test case {} failed. Expected: {}, Got: {}",
            idx, test_case.expected_output, result.observed_output
          );
        }
        result
      }
      Err(ExecuteError::Runtime {
        status,
        signal,
        output,
      }) => {
        error!(
          "Test case {} failed due to a runtime error (status {:?}, signal {:?}): {}",
          idx,
          status,
          signal,
          output.trim()
        );
        ExecutionResult::failed(output.trim(), FailureReason::RuntimeError)
      }
      Err(ExecuteError::Timeout(limit)) => {
        error!(
          "Test case {} failed due to a timeout after {} ms",
          idx,
          limit.as_millis()
        );
        ExecutionResult::failed(String::new(), FailureReason::Timeout)
      }
      Err(ExecuteError::Sandbox(message)) => {
        error!("Test case {} failed due to a sandbox error: {}", idx, message);
        ExecutionResult::failed(message, FailureReason::SandboxError)
      }
      Err(ExecuteError::Cancelled) => return None,
    };
    Some(result)
  }
}
