use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};

use crate::error::CheckError;
use crate::utils::{MemoryLimitType, TimeLimitType};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG: &str = "codecheck.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
  /// JSON file holding the task catalogue
  pub tasks: PathBuf,
  /// flexi_logger log specification
  pub log: String,
  /// Largest accepted submission (unit: bytes)
  pub max_code_length: usize,
  pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
  /// Pinned interpreter executed inside the sandbox
  pub python: String,
  pub python_args: Vec<String>,
  /// CPU time limit (unit: ms)
  pub time_limit: TimeLimitType,
  /// Wall clock limit (unit: ms)
  pub wall_time_limit: TimeLimitType,
  /// Memory limit (unit: KB)
  pub memory_limit: MemoryLimitType,
  /// CPU bandwidth quota per period (unit: µs), `None` leaves CPU share uncapped
  pub cpu_quota: Option<i64>,
  pub cpu_period: u64,
  pub process: u64,
  /// Largest output file (unit: bytes)
  pub output_limit: u64,
  pub stack_size: u64,
  /// Keep the host network namespace
  pub network: bool,
  /// ptrace presets, empty disables syscall filtering
  pub ptrace: Vec<String>,
  /// Extra attempts after a sandbox infrastructure failure
  pub launch_retries: u32,
  /// Fail executions when a cgroup controller is missing
  pub enforce_limits: bool,
  pub cgroup: String,
  pub user: String,
  pub group: String,
  /// Parent directory for per-run workspaces, system temp dir when unset
  pub workspace: Option<PathBuf>,
  /// Read-only host directories exposed inside the sandbox
  pub mounts: Vec<String>,
  pub env: Vec<String>,
}

impl Default for Settings {
  fn default() -> Self {
    Settings {
      tasks: PathBuf::from("./fixtures/tasks.json"),
      log: "codecheck=info".to_string(),
      max_code_length: 64 * 1024,
      sandbox: SandboxConfig::default(),
    }
  }
}

impl Default for SandboxConfig {
  fn default() -> Self {
    SandboxConfig {
      python: "/usr/bin/python3".to_string(),
      python_args: vec!["-B".to_string(), "-S".to_string()],
      time_limit: 5000,
      wall_time_limit: 10000,
      memory_limit: 128 * 1024,
      cpu_quota: Some(50000),
      cpu_period: 100000,
      process: 4,
      output_limit: 1024 * 1024,
      stack_size: 64 * 1024 * 1024,
      network: false,
      ptrace: vec!["net".to_string(), "process".to_string()],
      launch_retries: 1,
      enforce_limits: true,
      cgroup: "codecheck".to_string(),
      user: "nobody".to_string(),
      group: "nogroup".to_string(),
      workspace: None,
      mounts: ["/usr", "/lib", "/lib64", "/bin", "/etc"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      env: vec![
        "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
        "PYTHONIOENCODING=utf-8".to_string(),
      ],
    }
  }
}

impl Settings {
  /// Load settings from `path`, `$CODECHECK_CONFIG` or `./codecheck.toml`.
  ///
  /// Only an explicitly named file must exist, otherwise defaults are used.
  pub fn load(path: Option<&Path>) -> Result<Self, CheckError> {
    let explicit = path
      .map(|p| p.to_path_buf())
      .or_else(|| env::var("CODECHECK_CONFIG").ok().map(PathBuf::from));

    let mut settings = match explicit {
      Some(path) => Self::read(&path)?,
      None if Path::new(DEFAULT_CONFIG).exists() => Self::read(Path::new(DEFAULT_CONFIG))?,
      None => {
        debug!("Config file not found, using defaults");
        Settings::default()
      }
    };

    if let Ok(cgroup) = env::var("CODECHECK_CGROUP") {
      settings.sandbox.cgroup = cgroup;
    }
    settings.validate()?;
    Ok(settings)
  }

  fn read(path: &Path) -> Result<Self, CheckError> {
    info!("Load config from {}", path.to_string_lossy());
    let text = fs::read_to_string(path).map_err(|e| {
      CheckError::config(format!("read {} fails: {}", path.to_string_lossy(), e))
    })?;
    let mut settings = Self::parse(&text)?;

    // Relative paths in a config file are relative to that file
    if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      settings.tasks = absolutize_from(&settings.tasks, base)?;
      if let Some(workspace) = &settings.sandbox.workspace {
        settings.sandbox.workspace = Some(absolutize_from(workspace, base)?);
      }
    }
    Ok(settings)
  }

  pub fn parse(text: &str) -> Result<Self, CheckError> {
    Ok(toml::from_str(text)?)
  }

  pub fn validate(&self) -> Result<(), CheckError> {
    let sandbox = &self.sandbox;
    if sandbox.time_limit == 0 || sandbox.wall_time_limit == 0 {
      return Err(CheckError::config("time limits should be positive"));
    }
    if sandbox.memory_limit == 0 {
      return Err(CheckError::config("memory limit should be positive"));
    }
    if let Some(quota) = sandbox.cpu_quota {
      if quota <= 0 || sandbox.cpu_period == 0 {
        return Err(CheckError::config("cpu quota and period should be positive"));
      }
    }
    if sandbox.process == 0 {
      return Err(CheckError::config("process limit should be positive"));
    }
    if !Path::new(&sandbox.python).is_absolute() {
      return Err(CheckError::config(format!(
        "python interpreter {} should be an absolute path",
        sandbox.python
      )));
    }
    Ok(())
  }
}

fn absolutize_from(path: &Path, base: &Path) -> Result<PathBuf, CheckError> {
  let fail =
    |e: std::io::Error| CheckError::config(format!("resolve {} fails: {}", path.to_string_lossy(), e));
  let base = base.absolutize().map_err(fail)?;
  path
    .absolutize_from(&base)
    .map(|p| p.to_path_buf())
    .map_err(fail)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_use_defaults() {
    let settings = Settings::parse("").unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.sandbox.memory_limit, 131072);
    assert_eq!(settings.sandbox.cpu_quota, Some(50000));
    assert!(!settings.sandbox.network);
    assert!(settings.validate().is_ok());
  }

  #[test]
  fn it_should_parse_partial_config() {
    let settings = Settings::parse(
      r#"
tasks = "/srv/tasks.json"

[sandbox]
python = "/usr/local/bin/python3.12"
wall_time_limit = 3000
cpu_quota = 5000
ptrace = []
"#,
    )
    .unwrap();
    assert_eq!(settings.tasks, PathBuf::from("/srv/tasks.json"));
    assert_eq!(settings.sandbox.python, "/usr/local/bin/python3.12");
    assert_eq!(settings.sandbox.wall_time_limit, 3000);
    assert_eq!(settings.sandbox.cpu_quota, Some(5000));
    assert!(settings.sandbox.ptrace.is_empty());
    assert_eq!(settings.sandbox.time_limit, 5000);
  }

  #[test]
  fn it_should_reject_unknown_keys() {
    assert!(Settings::parse("[sandbox]\nmemroy_limit = 1\n").is_err());
  }

  #[test]
  fn it_should_reject_invalid_limits() {
    let mut settings = Settings::default();
    settings.sandbox.wall_time_limit = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.sandbox.python = "python3".to_string();
    assert!(settings.validate().is_err());
  }
}
