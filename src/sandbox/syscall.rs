use std::collections::HashMap;
use std::ffi::{c_long, c_ulonglong};

use nix::libc::{
  user_regs_struct, SYS_accept, SYS_accept4, SYS_bind, SYS_clone, SYS_clone3, SYS_connect,
  SYS_execve, SYS_execveat, SYS_fork, SYS_getpeername, SYS_getsockname, SYS_getsockopt,
  SYS_listen, SYS_recvfrom, SYS_sendto, SYS_setsockopt, SYS_shutdown, SYS_socket,
  SYS_socketpair, SYS_vfork,
};

pub type SyscallId = c_ulonglong;

/// 禁止系统调用
/// 允许有限次系统调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallPerm {
  Forbid,
  Allow(u32),
}

/// Groups of syscalls that can be restricted together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictedSyscall {
  Net,
  Process,
}

/// 系统调用过滤器
/// 黑名单过滤，若不在映射内，则允许；否则，禁止或者允许有限次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallFilter {
  map: HashMap<SyscallId, SyscallPerm>,
}

impl RestrictedSyscall {
  pub fn parse<S: AsRef<str>>(text: S) -> Result<Self, String> {
    match text.as_ref() {
      "net" | "network" => Ok(RestrictedSyscall::Net),
      "process" => Ok(RestrictedSyscall::Process),
      other => Err(format!("Unknown ptrace preset: {}", other)),
    }
  }
}

impl SyscallFilter {
  pub fn new() -> Self {
    SyscallFilter {
      map: HashMap::new(),
    }
  }

  /// Parse preset names, an empty list disables syscall filtering
  pub fn parse_presets<S: AsRef<str>>(presets: &[S]) -> Result<Option<Self>, String> {
    if presets.is_empty() {
      return Ok(None);
    }
    let mut filter = SyscallFilter::new();
    for preset in presets {
      filter.enable(RestrictedSyscall::parse(preset)?);
    }
    Ok(Some(filter))
  }

  pub fn enable(&mut self, preset: RestrictedSyscall) -> &mut Self {
    match preset {
      // 禁用网络
      RestrictedSyscall::Net => self
        .forbid(SYS_socket)
        .forbid(SYS_socketpair)
        .forbid(SYS_setsockopt)
        .forbid(SYS_getsockopt)
        .forbid(SYS_getsockname)
        .forbid(SYS_getpeername)
        .forbid(SYS_bind)
        .forbid(SYS_listen)
        .forbid(SYS_accept)
        .forbid(SYS_accept4)
        .forbid(SYS_connect)
        .forbid(SYS_sendto)
        .forbid(SYS_recvfrom)
        .forbid(SYS_shutdown),
      // 禁用进程相关，只允许启动解释器的那一次 execve
      RestrictedSyscall::Process => self
        .allow(SYS_execve, 1)
        .allow(SYS_execveat, 1)
        .forbid(SYS_fork)
        .forbid(SYS_vfork)
        .forbid(SYS_clone)
        .forbid(SYS_clone3),
    }
  }

  pub fn forbid(&mut self, id: c_long) -> &mut Self {
    self.map.insert(id as SyscallId, SyscallPerm::Forbid);
    self
  }

  pub fn allow(&mut self, id: c_long, count: u32) -> &mut Self {
    self.map.insert(id as SyscallId, SyscallPerm::Allow(count));
    self
  }

  /// Check one syscall stop, consuming an allowance when the syscall is rate limited
  pub fn check(&mut self, syscall_id: SyscallId) -> bool {
    match self.map.get_mut(&syscall_id) {
      Some(SyscallPerm::Forbid) => false,
      Some(SyscallPerm::Allow(count)) => {
        if *count == 0 {
          false
        } else {
          *count -= 1;
          true
        }
      }
      None => true,
    }
  }

  pub fn filter(&mut self, regs: &user_regs_struct) -> bool {
    self.check(regs.orig_rax)
  }
}

impl Default for SyscallFilter {
  fn default() -> Self {
    let mut filter = SyscallFilter::new();
    filter
      .enable(RestrictedSyscall::Net)
      .enable(RestrictedSyscall::Process);
    filter
  }
}
