use std::{
  process::{ExitCode, Termination},
  time::Duration,
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, sys::signal::Signal, unistd::isatty};
use thiserror::Error;

/// Errors raised by the task storage boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
  #[error("Task '{0}' not found")]
  NotFound(String),

  #[error("Task storage is unavailable: {0}")]
  BackendUnavailable(String),

  #[error("Invalid task data: {0}")]
  Malformed(String),
}

/// Errors raised by one sandboxed execution
#[derive(Error, Debug)]
pub enum ExecuteError {
  /// The isolation backend itself failed to provision or manage the sandbox
  #[error("Sandbox Error: {0}")]
  Sandbox(String),

  /// The sandboxed interpreter exited abnormally
  #[error("Runtime Error: {}", describe_exit(.status, .signal))]
  Runtime {
    status: Option<i32>,
    signal: Option<Signal>,
    output: String,
  },

  #[error("Timeout Error: wall clock limit of {} ms exceeded", .0.as_millis())]
  Timeout(Duration),

  #[error("Cancelled")]
  Cancelled,
}

/// Errors returned by a whole run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
  #[error("Task '{0}' not found")]
  TaskNotFound(String),

  #[error("Task '{name}' has malformed data: {message}")]
  MalformedTask { name: String, message: String },

  #[error("Invalid submission: {0}")]
  InvalidSubmission(String),

  #[error("Task storage is unavailable: {0}")]
  Backend(String),

  #[error("Run was cancelled")]
  Cancelled,
}

/// Coarse status class for transport layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
  NotFound,
  Unprocessable,
  Internal,
}

/// Process level errors of the command line tool
#[derive(Error, Debug)]
pub enum CheckError {
  #[error("Config Error: {0}")]
  Config(String),

  #[error("CLI Error: {0}")]
  Cli(String),

  #[error("File System Error: {0}")]
  Fs(#[from] std::io::Error),

  #[error("Logger Error: {0}")]
  Logger(#[from] FlexiLoggerError),

  #[error("Task Error: {0}")]
  Repository(#[from] RepositoryError),

  #[error("Sandbox Error: {0}")]
  Sandbox(String),

  #[error("Run Error: {0}")]
  Run(#[from] OrchestratorError),
}

pub enum CheckExit {
  Ok,
  Err(CheckError),
}

fn describe_exit(status: &Option<i32>, signal: &Option<Signal>) -> String {
  match (status, signal) {
    (_, Some(signal)) => format!("killed by {}", signal),
    (Some(status), None) => format!("exit status {}", status),
    (None, None) => "unknown exit".to_string(),
  }
}

impl ExecuteError {
  pub fn sandbox<MS: Into<String>>(msg: MS) -> ExecuteError {
    ExecuteError::Sandbox(msg.into())
  }

  /// Whether the failure belongs to the infrastructure and may be retried
  pub fn is_transient(&self) -> bool {
    matches!(self, ExecuteError::Sandbox(_))
  }
}

impl From<Errno> for ExecuteError {
  fn from(errno: Errno) -> Self {
    ExecuteError::Sandbox(errno.desc().to_string())
  }
}

impl From<std::io::Error> for ExecuteError {
  fn from(err: std::io::Error) -> Self {
    ExecuteError::Sandbox(err.to_string())
  }
}

impl From<RepositoryError> for OrchestratorError {
  fn from(err: RepositoryError) -> Self {
    match err {
      RepositoryError::NotFound(name) => OrchestratorError::TaskNotFound(name),
      RepositoryError::BackendUnavailable(msg) => OrchestratorError::Backend(msg),
      RepositoryError::Malformed(msg) => OrchestratorError::MalformedTask {
        name: String::new(),
        message: msg,
      },
    }
  }
}

impl OrchestratorError {
  pub fn status_class(&self) -> StatusClass {
    match self {
      OrchestratorError::TaskNotFound(_) => StatusClass::NotFound,
      OrchestratorError::MalformedTask { .. } | OrchestratorError::InvalidSubmission(_) => {
        StatusClass::Unprocessable
      }
      OrchestratorError::Backend(_) | OrchestratorError::Cancelled => StatusClass::Internal,
    }
  }
}

impl CheckError {
  pub fn config<MS: Into<String>>(msg: MS) -> CheckError {
    CheckError::Config(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> CheckError {
    CheckError::Cli(msg.into())
  }

  fn exit_code(&self) -> u8 {
    let class = match self {
      CheckError::Run(err) => err.status_class(),
      CheckError::Repository(RepositoryError::NotFound(_)) => StatusClass::NotFound,
      CheckError::Repository(RepositoryError::Malformed(_)) => StatusClass::Unprocessable,
      CheckError::Cli(_) => StatusClass::Unprocessable,
      _ => StatusClass::Internal,
    };
    match class {
      StatusClass::Internal => 1,
      StatusClass::NotFound => 2,
      StatusClass::Unprocessable => 3,
    }
  }
}

impl From<toml::de::Error> for CheckError {
  fn from(err: toml::de::Error) -> Self {
    CheckError::Config(err.to_string())
  }
}

impl From<serde_json::Error> for CheckError {
  fn from(err: serde_json::Error) -> Self {
    CheckError::Fs(err.into())
  }
}

impl From<ExecuteError> for CheckError {
  fn from(err: ExecuteError) -> Self {
    CheckError::Sandbox(err.to_string())
  }
}

impl Termination for CheckExit {
  fn report(self) -> ExitCode {
    match self {
      CheckExit::Ok => ExitCode::SUCCESS.report(),
      CheckExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              serde_json::json!({ "ok": false, "type": prefix, "message": message }).to_string()
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::from(err.exit_code())
      }
    }
  }
}
