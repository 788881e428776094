use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Group, User};
use serde::Serialize;
use tempfile::TempDir;

pub use cgroup::SandboxUsage;
pub use option::{SandboxOption, SandboxOptionBuilder};
pub use syscall::{RestrictedSyscall, SyscallFilter};

use crate::cancel::CancelToken;
use crate::config::SandboxConfig;
use crate::error::ExecuteError;
use crate::utils::mount::MountPoint;
use crate::utils::parse_env;
use workspace::{Workspace, SANDBOX_DIR};

mod cgroup;
mod option;
mod pipe;
mod process;
mod syscall;
mod workspace;

/// Execution backend: opens one session per run
pub trait Executor: Send + Sync {
  /// Acquire the backend for one run, released when the session drops
  fn open(&self) -> Result<Box<dyn Session + '_>, ExecuteError>;
}

/// Backend handle held for the duration of one run
pub trait Session {
  /// Run one script in a fresh sandbox and return its combined output
  fn execute(&mut self, script: &str, cancel: &CancelToken) -> Result<Execution, ExecuteError>;
}

/// Successful (exit status 0) execution of one script
#[derive(Debug, Clone, Default, Serialize)]
pub struct Execution {
  /// Combined stdout and stderr
  pub output: Vec<u8>,
  pub usage: SandboxUsage,
}

/// Process sandbox built on namespaces, chroot, cgroups, rlimits and ptrace
pub struct Sandbox {
  config: SandboxConfig,
  uid: nix::unistd::Uid,
  gid: Gid,
  mounts: Vec<MountPoint>,
  env: Vec<(String, String)>,
  ptrace: Option<SyscallFilter>,
  workspace: PathBuf,
}

pub struct SandboxSession<'a> {
  sandbox: &'a Sandbox,
  dir: Option<TempDir>,
  cases: usize,
}

impl Execution {
  pub fn new<O: Into<Vec<u8>>>(output: O) -> Self {
    Execution {
      output: output.into(),
      usage: SandboxUsage::default(),
    }
  }

  /// Output decoded as UTF-8, invalid sequences replaced
  pub fn output_text(&self) -> String {
    String::from_utf8_lossy(&self.output).to_string()
  }
}

impl Sandbox {
  /// Resolve users, mounts and filters of `config` once for the process lifetime
  pub fn new(config: &SandboxConfig) -> Result<Self, ExecuteError> {
    let user = User::from_name(&config.user)?
      .ok_or_else(|| ExecuteError::sandbox(format!("User {} does not exist", config.user)))?;
    let gid = match Group::from_name(&config.group)? {
      Some(group) => group.gid,
      None => {
        warn!(
          "Group {} does not exist, use the primary group of {}",
          config.group, config.user
        );
        user.gid
      }
    };

    let mut mounts = vec![];
    for text in &config.mounts {
      let mount_point = MountPoint::parse(text).map_err(ExecuteError::Sandbox)?;
      if mount_point.dst() == Path::new(SANDBOX_DIR) {
        return Err(ExecuteError::sandbox(format!(
          "Mount point {} is reserved",
          SANDBOX_DIR
        )));
      }
      mounts.push(mount_point);
    }

    let env = config
      .env
      .iter()
      .map(parse_env)
      .collect::<Result<Vec<(String, String)>, String>>()
      .map_err(ExecuteError::Sandbox)?;

    let ptrace = SyscallFilter::parse_presets(config.ptrace.as_slice()).map_err(ExecuteError::Sandbox)?;

    let workspace = config
      .workspace
      .clone()
      .unwrap_or_else(std::env::temp_dir);

    info!(
      "Sandbox uses {} as user {} ({}:{})",
      config.python,
      config.user,
      user.uid,
      gid
    );

    Ok(Sandbox {
      config: config.clone(),
      uid: user.uid,
      gid,
      mounts,
      env,
      ptrace,
      workspace,
    })
  }

  /// Build the launch option for the script stored in `workspace`
  fn option(&self, workspace: &Workspace, label: String) -> SandboxOption {
    // 脚本从 stdin 读入
    let mut arguments = self.config.python_args.clone();
    arguments.push("-".to_string());

    SandboxOption::builder(self.config.python.clone(), arguments, workspace.root_dir())
      .label(label)
      .time_limit(self.config.time_limit)
      .wall_time_limit(self.config.wall_time_limit)
      .memory_limit(self.config.memory_limit)
      .cpu_quota(self.config.cpu_quota, self.config.cpu_period)
      .user(self.uid, self.gid)
      .cgroup(self.config.cgroup.clone())
      .process(self.config.process)
      .ptrace(self.ptrace.clone())
      .stack_size(self.config.stack_size)
      .output_limit(self.config.output_limit)
      .network(self.config.network)
      .enforce_limits(self.config.enforce_limits)
      .cwd(SANDBOX_DIR)
      .mounts(&self.mounts)
      .mount(MountPoint::read(workspace.box_dir(), SANDBOX_DIR))
      .envs(&self.env)
      .stdin(workspace.script_path())
      .stdout(workspace.output_path())
      .build()
  }

  fn launch(
    &self,
    parent: &Path,
    script: &str,
    label: String,
    cancel: &CancelToken,
  ) -> Result<Execution, ExecuteError> {
    let workspace = Workspace::create(parent, script)?;
    let option = self.option(&workspace, label);

    let result = process::run(&option, cancel)?;
    let output = workspace.read_output(self.config.output_limit)?;

    if result.status == Some(0) && result.signal.is_none() && result.violation.is_none() {
      return Ok(Execution {
        output,
        usage: result.usage,
      });
    }

    let signal = match result.violation {
      Some(_) => Some(Signal::SIGSYS),
      None => result.signal,
    };
    Err(ExecuteError::Runtime {
      status: result.status,
      signal,
      output: String::from_utf8_lossy(&output).to_string(),
    })
  }
}

impl Executor for Sandbox {
  fn open(&self) -> Result<Box<dyn Session + '_>, ExecuteError> {
    let dir = tempfile::Builder::new()
      .prefix("codecheck-")
      .tempdir_in(&self.workspace)
      .map_err(|e| {
        ExecuteError::sandbox(format!(
          "Create run directory in {} fails: {}",
          self.workspace.to_string_lossy(),
          e
        ))
      })?;
    debug!("Open sandbox session {}", dir.path().to_string_lossy());

    Ok(Box::new(SandboxSession {
      sandbox: self,
      dir: Some(dir),
      cases: 0,
    }))
  }
}

impl<'a> Session for SandboxSession<'a> {
  fn execute(&mut self, script: &str, cancel: &CancelToken) -> Result<Execution, ExecuteError> {
    let dir = match &self.dir {
      Some(dir) => dir.path().to_path_buf(),
      None => return Err(ExecuteError::sandbox("Sandbox session is closed")),
    };
    self.cases += 1;

    let attempts = self.sandbox.config.launch_retries + 1;
    let mut attempt = 1;
    loop {
      if cancel.is_cancelled() {
        return Err(ExecuteError::Cancelled);
      }
      let label = format!("case{}.{}", self.cases, attempt);
      match self.sandbox.launch(&dir, script, label, cancel) {
        Err(err) if err.is_transient() && attempt < attempts => {
          warn!(
            "Sandbox launch attempt {}/{} fails, retry: {}",
            attempt, attempts, err
          );
          attempt += 1;
        }
        result => return result,
      }
    }
  }
}

impl<'a> Drop for SandboxSession<'a> {
  fn drop(&mut self) {
    if let Some(dir) = self.dir.take() {
      let path = dir.path().to_path_buf();
      debug!(
        "Close sandbox session {} after {} executions",
        path.to_string_lossy(),
        self.cases
      );
      if let Err(err) = dir.close() {
        error!(
          "Fails removing run directory: {} ({})",
          path.to_string_lossy(),
          err
        );
      }
    }
  }
}
