use std::path::PathBuf;
use std::time::Duration;

use nix::libc;
use nix::unistd::{Gid, Uid};

use crate::sandbox::syscall::SyscallFilter;
use crate::utils::mount::MountPoint;
use crate::utils::{MemoryLimitType, TimeLimitType};

/// Everything needed to launch one sandboxed process
#[derive(Debug, Clone)]
pub struct SandboxOption {
  /// Used to identify the execution in logs
  label: String,
  program: String,
  arguments: Vec<String>,
  /// CPU time limit (unit: ms)
  time_limit: TimeLimitType,
  /// Wall clock limit (unit: ms)
  wall_time_limit: TimeLimitType,
  /// Memory limit (unit: KB)
  memory_limit: MemoryLimitType,
  cpu_quota: Option<i64>,
  cpu_period: u64,
  uid: Uid,
  gid: Gid,
  cgroup: String,
  process: u64,
  ptrace: Option<SyscallFilter>,
  stack_size: u64,
  output_limit: u64,
  network: bool,
  enforce_limits: bool,
  chroot: PathBuf,
  cwd: PathBuf,
  mounts: Vec<MountPoint>,
  env: Vec<(String, String)>,
  stdin: PathBuf,
  stdout: PathBuf,
}

/// Build a sandbox option
pub struct SandboxOptionBuilder {
  option: SandboxOption,
}

impl SandboxOption {
  /// Start building an option running `program` inside `chroot`
  pub fn builder<PS: Into<String>, AS: Into<String>, RP: Into<PathBuf>>(
    program: PS,
    arguments: Vec<AS>,
    chroot: RP,
  ) -> SandboxOptionBuilder {
    SandboxOptionBuilder {
      option: SandboxOption {
        label: "sandbox".to_string(),
        program: program.into(),
        arguments: arguments.into_iter().map(|a| a.into()).collect(),
        time_limit: 1000,
        wall_time_limit: 2000,
        memory_limit: 262144,
        cpu_quota: None,
        cpu_period: 100000,
        uid: Uid::from_raw(65534),
        gid: Gid::from_raw(65534),
        cgroup: "codecheck".to_string(),
        process: 1,
        ptrace: Some(SyscallFilter::default()),
        stack_size: u64::MAX,
        output_limit: 1024 * 1024,
        network: false,
        enforce_limits: true,
        chroot: chroot.into(),
        cwd: PathBuf::from("/"),
        mounts: vec![],
        env: vec![],
        stdin: PathBuf::from("/dev/null"),
        stdout: PathBuf::from("/dev/null"),
      },
    }
  }

  pub fn label(&self) -> &String {
    &self.label
  }

  pub fn program(&self) -> &String {
    &self.program
  }

  pub fn arguments(&self) -> &Vec<String> {
    &self.arguments
  }

  pub fn time_limit(&self) -> TimeLimitType {
    self.time_limit
  }

  pub fn wall_time_limit(&self) -> Duration {
    Duration::from_millis(self.wall_time_limit)
  }

  pub fn memory_limit(&self) -> MemoryLimitType {
    self.memory_limit
  }

  pub fn cpu_quota(&self) -> Option<i64> {
    self.cpu_quota
  }

  pub fn cpu_period(&self) -> u64 {
    self.cpu_period
  }

  pub fn uid(&self) -> Uid {
    self.uid
  }

  pub fn gid(&self) -> Gid {
    self.gid
  }

  pub fn cgroup(&self) -> &str {
    &self.cgroup
  }

  pub fn process(&self) -> u64 {
    self.process
  }

  pub fn ptrace(&self) -> &Option<SyscallFilter> {
    &self.ptrace
  }

  pub fn stack_size(&self) -> libc::rlim_t {
    if self.stack_size == u64::MAX {
      libc::RLIM_INFINITY
    } else {
      self.stack_size
    }
  }

  pub fn output_limit(&self) -> u64 {
    self.output_limit
  }

  pub fn network(&self) -> bool {
    self.network
  }

  pub fn enforce_limits(&self) -> bool {
    self.enforce_limits
  }

  pub fn chroot(&self) -> &PathBuf {
    &self.chroot
  }

  pub fn cwd(&self) -> &PathBuf {
    &self.cwd
  }

  pub fn mounts(&self) -> &Vec<MountPoint> {
    &self.mounts
  }

  pub fn env(&self) -> &Vec<(String, String)> {
    &self.env
  }

  pub fn stdin(&self) -> &PathBuf {
    &self.stdin
  }

  pub fn stdout(&self) -> &PathBuf {
    &self.stdout
  }
}

impl SandboxOptionBuilder {
  pub fn build(self) -> SandboxOption {
    self.option
  }

  pub fn label<LS: Into<String>>(mut self, label: LS) -> Self {
    self.option.label = label.into();
    self
  }

  /// Set CPU time limit (unit: ms)
  pub fn time_limit(mut self, value: TimeLimitType) -> Self {
    self.option.time_limit = value;
    self
  }

  /// Set wall clock limit (unit: ms)
  pub fn wall_time_limit(mut self, value: TimeLimitType) -> Self {
    self.option.wall_time_limit = value;
    self
  }

  /// Set memory limit (unit: KB)
  pub fn memory_limit(mut self, value: MemoryLimitType) -> Self {
    self.option.memory_limit = value;
    self
  }

  /// Set CPU bandwidth, `quota` µs of CPU time every `period` µs
  pub fn cpu_quota(mut self, quota: Option<i64>, period: u64) -> Self {
    self.option.cpu_quota = quota;
    self.option.cpu_period = period;
    self
  }

  pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
    self.option.uid = uid;
    self.option.gid = gid;
    self
  }

  pub fn cgroup<CS: Into<String>>(mut self, name: CS) -> Self {
    self.option.cgroup = name.into();
    self
  }

  /// Set the max number of processes
  pub fn process(mut self, value: u64) -> Self {
    self.option.process = value;
    self
  }

  pub fn ptrace(mut self, filter: Option<SyscallFilter>) -> Self {
    self.option.ptrace = filter;
    self
  }

  pub fn stack_size(mut self, value: u64) -> Self {
    self.option.stack_size = value;
    self
  }

  /// Set the largest file the process may write (unit: bytes)
  pub fn output_limit(mut self, value: u64) -> Self {
    self.option.output_limit = value;
    self
  }

  pub fn network(mut self, flag: bool) -> Self {
    self.option.network = flag;
    self
  }

  pub fn enforce_limits(mut self, flag: bool) -> Self {
    self.option.enforce_limits = flag;
    self
  }

  /// Set work directory in chroot
  pub fn cwd<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.cwd = path.into();
    self
  }

  pub fn mount(mut self, mount_point: MountPoint) -> Self {
    self.option.mounts.push(mount_point);
    self
  }

  pub fn mounts(mut self, mount_points: &[MountPoint]) -> Self {
    self.option.mounts.extend_from_slice(mount_points);
    self
  }

  pub fn envs(mut self, pairs: &[(String, String)]) -> Self {
    self.option.env.extend_from_slice(pairs);
    self
  }

  pub fn stdin<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.stdin = path.into();
    self
  }

  /// Redirect both stdout and stderr into `path`
  pub fn stdout<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.stdout = path.into();
    self
  }
}
