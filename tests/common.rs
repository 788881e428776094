#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

use flexi_logger::Logger;

use codecheck::{CancelToken, ExecuteError, Execution, Executor, Session, TaskStore};

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("codecheck=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

pub const SUM_WITH_INVERSION: &str = "n = input().strip()
m = n[::-1]
print(f\"{n} + {m} = {int(n) + int(m)}\")
";

pub const SUM_WITHOUT_INVERSION: &str = "n = int(input())
print(n + 1)
";

pub fn fixture_tasks() -> TaskStore {
  TaskStore::open(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/tasks.json")).unwrap()
}

/// Host python3 used to run synthesized scripts without isolation
pub fn host_python() -> Option<PathBuf> {
  ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
    .iter()
    .map(PathBuf::from)
    .find(|path| path.exists())
}

/// Placeholder in scripted output replaced by the seal of the executed script
pub const SEAL: &str = "$SEAL";

/// Seal embedded in a synthesized script
pub fn seal_of(script: &str) -> &str {
  script
    .lines()
    .find_map(|line| line.strip_prefix("_SEAL = \""))
    .and_then(|rest| rest.strip_suffix('"'))
    .unwrap_or_default()
}

/// What the next scripted execution returns
#[derive(Debug, Clone)]
pub enum Step {
  Output(String),
  Runtime(String),
  Timeout,
  Sandbox(String),
  Cancelled,
}

impl Step {
  pub fn output<S: Into<String>>(text: S) -> Self {
    Step::Output(text.into())
  }

  fn into_outcome(self, seal: &str) -> Result<Execution, ExecuteError> {
    match self {
      Step::Output(text) => Ok(Execution::new(text.replace(SEAL, seal))),
      Step::Runtime(output) => Err(ExecuteError::Runtime {
        status: Some(1),
        signal: None,
        output,
      }),
      Step::Timeout => Err(ExecuteError::Timeout(std::time::Duration::from_millis(10000))),
      Step::Sandbox(message) => Err(ExecuteError::Sandbox(message)),
      Step::Cancelled => Err(ExecuteError::Cancelled),
    }
  }
}

/// Executor replaying a fixed list of outcomes, a sealed `PASS` once the list runs out
#[derive(Default)]
pub struct ScriptedExecutor {
  steps: Mutex<VecDeque<Step>>,
  scripts: Mutex<Vec<String>>,
  refuse_open: bool,
  pub opened: AtomicUsize,
  pub closed: AtomicUsize,
}

pub struct ScriptedSession<'a> {
  executor: &'a ScriptedExecutor,
}

impl ScriptedExecutor {
  pub fn new(steps: Vec<Step>) -> Self {
    ScriptedExecutor {
      steps: Mutex::new(steps.into()),
      ..Default::default()
    }
  }

  pub fn unavailable() -> Self {
    ScriptedExecutor {
      refuse_open: true,
      ..Default::default()
    }
  }

  pub fn executions(&self) -> usize {
    self.scripts.lock().unwrap().len()
  }

  pub fn scripts(&self) -> Vec<String> {
    self.scripts.lock().unwrap().clone()
  }

  pub fn opened(&self) -> usize {
    self.opened.load(Ordering::SeqCst)
  }

  pub fn closed(&self) -> usize {
    self.closed.load(Ordering::SeqCst)
  }
}

impl Executor for ScriptedExecutor {
  fn open(&self) -> Result<Box<dyn Session + '_>, ExecuteError> {
    if self.refuse_open {
      return Err(ExecuteError::sandbox("backend unreachable"));
    }
    self.opened.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(ScriptedSession { executor: self }))
  }
}

impl<'a> Session for ScriptedSession<'a> {
  fn execute(&mut self, script: &str, _cancel: &CancelToken) -> Result<Execution, ExecuteError> {
    self.executor.scripts.lock().unwrap().push(script.to_string());
    let step = self
      .executor
      .steps
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Step::output("$SEAL PASS"));
    step.into_outcome(seal_of(script))
  }
}

impl<'a> Drop for ScriptedSession<'a> {
  fn drop(&mut self) {
    self.executor.closed.fetch_add(1, Ordering::SeqCst);
  }
}

/// Feed `script` to the host interpreter through stdin, as the sandbox does
pub fn run_python(python: &Path, script: &str) -> std::io::Result<Output> {
  let mut child = Command::new(python)
    .args(["-B", "-S", "-"])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()?;
  if let Some(mut stdin) = child.stdin.take() {
    stdin.write_all(script.as_bytes())?;
  }
  child.wait_with_output()
}

/// Executor running scripts with the host interpreter, no isolation at all
pub struct HostExecutor {
  python: PathBuf,
}

pub struct HostSession<'a> {
  python: &'a PathBuf,
}

impl HostExecutor {
  pub fn new(python: PathBuf) -> Self {
    HostExecutor { python }
  }
}

impl Executor for HostExecutor {
  fn open(&self) -> Result<Box<dyn Session + '_>, ExecuteError> {
    Ok(Box::new(HostSession {
      python: &self.python,
    }))
  }
}

impl<'a> Session for HostSession<'a> {
  fn execute(&mut self, script: &str, _cancel: &CancelToken) -> Result<Execution, ExecuteError> {
    let output = run_python(self.python, script)?;
    let mut combined = output.stdout;
    combined.extend(output.stderr);
    if output.status.success() {
      Ok(Execution::new(combined))
    } else {
      Err(ExecuteError::Runtime {
        status: output.status.code(),
        signal: None,
        output: String::from_utf8_lossy(&combined).to_string(),
      })
    }
  }
}
