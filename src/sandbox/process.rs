use std::convert::Infallible;
use std::ffi::{c_char, c_uint, CStr, CString};
use std::fs::create_dir_all;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc::{self, rlim_t, RLIM_INFINITY, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::ptrace;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
  alarm, chdir, chroot, close, dup2, fork, setgid, setgroups, sethostname, setuid, ForkResult,
  Gid, Pid, Uid,
};

use crate::cancel::CancelToken;
use crate::error::ExecuteError;
use crate::sandbox::cgroup::{SandboxCgroup, SandboxUsage};
use crate::sandbox::option::SandboxOption;
use crate::sandbox::pipe::{SandboxPipe, SandboxReadPipe, SandboxWritePipe};
use crate::sandbox::syscall::SyscallId;
use crate::utils::into_c_string;

/// Exit status of a child that failed before reaching the interpreter
const SETUP_FAILURE: i32 = 125;

const WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Raw outcome of one sandboxed process
#[derive(Debug, Clone)]
pub struct SandboxResult {
  pub status: Option<i32>,
  pub signal: Option<Signal>,
  /// Forbidden syscall that got the process killed
  pub violation: Option<SyscallId>,
  pub usage: SandboxUsage,
}

enum Watch {
  Finished,
  TimedOut,
  Cancelled,
}

struct Waited {
  status: Option<i32>,
  signal: Option<Signal>,
  violation: Option<SyscallId>,
  /// Stopped or killed by a timer / CPU limit signal
  time_signal: bool,
}

/// Everything the forked child touches, prepared before `fork`.
///
/// 子进程在 fork 之后不分配内存, 也不打日志
struct Launch {
  program: CString,
  argv: Vec<*const c_char>,
  envp: Vec<*const c_char>,
  stdin: CString,
  stdout: CString,
  root: CString,
  new_root: CString,
  cwd: CString,
  /// (source, target below the new root)
  mounts: Vec<(CString, CString)>,
  namespaces: CloneFlags,
  alarm: c_uint,
  cpu_limit: rlim_t,
  stack_size: rlim_t,
  output_limit: rlim_t,
  uid: Uid,
  gid: Gid,
  trace: bool,
  // Owners of the strings `argv` and `envp` point into
  _args: Vec<CString>,
  _env: Vec<CString>,
}

/// Setup failure inside the child, reported without allocating
#[derive(Debug, Clone, Copy)]
struct ChildFailure<'a> {
  step: &'static str,
  path: Option<&'a CStr>,
  errno: Errno,
}

impl Launch {
  fn prepare(option: &SandboxOption) -> Result<Self, ExecuteError> {
    let program = into_c_string(option.program())?;
    let mut args = vec![program.clone()];
    for argument in option.arguments() {
      args.push(into_c_string(argument)?);
    }
    let env = option
      .env()
      .iter()
      .map(|(key, value)| into_c_string(format!("{}={}", key, value)))
      .collect::<Result<Vec<CString>, ExecuteError>>()?;

    let new_root = option.chroot();
    let mut mounts = vec![];
    for mount_point in option.mounts() {
      if !mount_point.src().exists() {
        debug!(
          "Skip mounting missing directory {}",
          mount_point.src().to_string_lossy()
        );
        continue;
      }
      let target = mount_point.target(new_root);
      create_dir_all(&target)?;
      mounts.push((
        into_c_string(mount_point.src().to_string_lossy())?,
        into_c_string(target.to_string_lossy())?,
      ));
    }

    let mut namespaces =
      CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;
    if !option.network() {
      namespaces |= CloneFlags::CLONE_NEWNET;
    }

    Ok(Launch {
      argv: null_terminated(&args),
      envp: null_terminated(&env),
      program,
      stdin: into_c_string(option.stdin().to_string_lossy())?,
      stdout: into_c_string(option.stdout().to_string_lossy())?,
      root: into_c_string("/")?,
      new_root: into_c_string(new_root.to_string_lossy())?,
      cwd: into_c_string(option.cwd().to_string_lossy())?,
      mounts,
      namespaces,
      // 运行时限 + 1 秒
      alarm: option.wall_time_limit().as_secs_f64().ceil() as c_uint + 1,
      cpu_limit: (option.time_limit() as f64 / 1000.0).ceil() as rlim_t,
      stack_size: option.stack_size(),
      output_limit: option.output_limit(),
      uid: option.uid(),
      gid: option.gid(),
      trace: option.ptrace().is_some(),
      _args: args,
      _env: env,
    })
  }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
  strings
    .iter()
    .map(|s| s.as_ptr())
    .chain(std::iter::once(std::ptr::null()))
    .collect()
}

impl<'a> ChildFailure<'a> {
  fn new(step: &'static str) -> impl FnOnce(Errno) -> ChildFailure<'a> {
    move |errno| ChildFailure {
      step,
      path: None,
      errno,
    }
  }

  fn at(step: &'static str, path: &'a CStr) -> impl FnOnce(Errno) -> ChildFailure<'a> {
    move |errno| ChildFailure {
      step,
      path: Some(path),
      errno,
    }
  }

  /// Send `<step> <path> fails: <errno>` through a fixed stack buffer
  fn report(&self, pipe: &SandboxWritePipe) {
    let mut buf = [0_u8; 512];
    let mut len = 0;
    let path = self.path.map(CStr::to_bytes).unwrap_or_default();
    let parts: [&[u8]; 5] = [
      self.step.as_bytes(),
      if path.is_empty() { &b""[..] } else { &b" "[..] },
      path,
      b" fails: ",
      self.errno.desc().as_bytes(),
    ];
    for part in parts {
      // 末尾保留一个 0
      let size = part.len().min(buf.len() - 1 - len);
      buf[len..len + size].copy_from_slice(&part[..size]);
      len += size;
    }
    let _ = pipe.send(&buf[..=len]);
  }
}

/// 隔离 namespace，默认断开网络
fn isolate(launch: &Launch) -> Result<(), ChildFailure<'_>> {
  unshare(launch.namespaces).map_err(ChildFailure::new("Unshare namespaces"))?;
  let _ = sethostname("codecheck");

  // Keep every mount below private to this namespace
  mount::<CStr, CStr, CStr, CStr>(
    None,
    &launch.root,
    None,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None,
  )
  .map_err(ChildFailure::new("Make mounts private"))
}

/// 重定向输入输出，stderr 与 stdout 合并
fn redirect_io(launch: &Launch) -> Result<(), ChildFailure<'_>> {
  let input = open(launch.stdin.as_c_str(), OFlag::O_RDONLY, Mode::empty())
    .map_err(ChildFailure::at("Open stdin", &launch.stdin))?;
  if input != STDIN_FILENO {
    dup2(input, STDIN_FILENO).map_err(ChildFailure::new("Redirect stdin"))?;
    let _ = close(input);
  }

  let output = open(
    launch.stdout.as_c_str(),
    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
    Mode::from_bits_truncate(0o644),
  )
  .map_err(ChildFailure::at("Open stdout", &launch.stdout))?;
  if output != STDOUT_FILENO {
    dup2(output, STDOUT_FILENO).map_err(ChildFailure::new("Redirect stdout"))?;
    let _ = close(output);
  }
  dup2(STDOUT_FILENO, STDERR_FILENO).map_err(ChildFailure::new("Redirect stderr"))?;

  Ok(())
}

/// 调用 setrlimit
fn set_resource_limit(launch: &Launch) -> Result<(), ChildFailure<'_>> {
  let fail = ChildFailure::new("Set resource limit");

  // 运行时限
  setrlimit(Resource::RLIMIT_CPU, launch.cpu_limit, launch.cpu_limit + 1)
    .and_then(|_| {
      // 地址空间无限，内存交给 cgroup
      setrlimit(Resource::RLIMIT_AS, RLIM_INFINITY, RLIM_INFINITY)
    })
    .and_then(|_| setrlimit(Resource::RLIMIT_STACK, launch.stack_size, launch.stack_size))
    // 输出大小
    .and_then(|_| setrlimit(Resource::RLIMIT_FSIZE, launch.output_limit, launch.output_limit))
    .and_then(|_| setrlimit(Resource::RLIMIT_NOFILE, 64, 64))
    .and_then(|_| setrlimit(Resource::RLIMIT_CORE, 0, 0))
    .map_err(fail)
}

fn bind<'a>(src: &'a CStr, target: &'a CStr, read_only: bool) -> Result<(), ChildFailure<'a>> {
  mount::<CStr, CStr, CStr, CStr>(
    Some(src),
    target,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REC,
    None,
  )
  .map_err(ChildFailure::at("Bind mount", src))?;

  if read_only {
    mount::<CStr, CStr, CStr, CStr>(
      None,
      target,
      None,
      MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
      None,
    )
    .map_err(ChildFailure::at("Remount read-only", target))?;
  }
  Ok(())
}

/// chroot
fn change_root(launch: &Launch) -> Result<(), ChildFailure<'_>> {
  let new_root = launch.new_root.as_c_str();

  bind(new_root, new_root, false)?;
  for (src, target) in &launch.mounts {
    bind(src, target, true)?;
  }

  mount::<CStr, CStr, CStr, CStr>(
    None,
    new_root,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
    None,
  )
  .map_err(ChildFailure::new("Remount new root read-only"))?;

  chroot(new_root).map_err(ChildFailure::at("Chroot", new_root))?;
  chdir(launch.cwd.as_c_str()).map_err(ChildFailure::at("Chdir", &launch.cwd))?;

  Ok(())
}

/// Runs in the forked child, returns only on failure
fn child_main<'a>(
  launch: &'a Launch,
  gate: &SandboxReadPipe,
) -> Result<Infallible, ChildFailure<'a>> {
  isolate(launch)?;
  redirect_io(launch)?;
  change_root(launch)?;
  alarm::set(launch.alarm);
  set_resource_limit(launch)?;

  // 设置用户
  setgroups(&[launch.gid]).map_err(ChildFailure::new("Set groups"))?;
  setgid(launch.gid).map_err(ChildFailure::new("Set gid"))?;
  setuid(launch.uid).map_err(ChildFailure::new("Set uid"))?;

  // 等待父进程放入 cgroup
  match gate.wait() {
    Ok(true) => {}
    Ok(false) => return Err(ChildFailure::new("Wait for supervisor")(Errno::EPIPE)),
    Err(errno) => return Err(ChildFailure::new("Wait for supervisor")(errno)),
  }

  // 启动 ptrace 追踪子进程
  if launch.trace {
    ptrace::traceme().map_err(ChildFailure::new("Ptrace traceme"))?;
  }

  unsafe {
    libc::execve(
      launch.program.as_ptr(),
      launch.argv.as_ptr(),
      launch.envp.as_ptr(),
    )
  };
  Err(ChildFailure::at("Execve", &launch.program)(Errno::last()))
}

fn kill_and_reap(child: Pid) {
  if let Err(err) = signal::kill(child, Signal::SIGKILL) {
    warn!("Kill child process #{} fails: {}", child, err);
  }
  loop {
    match waitpid(child, None) {
      Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
      Ok(_) => continue,
    }
  }
}

/// Kill the child when the deadline passes or the run is cancelled
fn watchdog(child: Pid, limit: Duration, cancel: &CancelToken, done: Receiver<()>) -> Watch {
  let deadline = Instant::now() + limit;
  loop {
    match done.recv_timeout(WATCHDOG_TICK) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => return Watch::Finished,
      Err(RecvTimeoutError::Timeout) => {}
    }

    let verdict = if cancel.is_cancelled() {
      info!("Child process #{} is cancelled", child);
      Watch::Cancelled
    } else if Instant::now() >= deadline {
      info!(
        "Child process #{} exceeded wall clock limit {} ms",
        child,
        limit.as_millis()
      );
      Watch::TimedOut
    } else {
      continue;
    };

    if let Err(err) = signal::kill(child, Signal::SIGKILL) {
      error!("Kill child process #{} fails: {}", child, err);
    }
    return verdict;
  }
}

fn wait_child(option: &SandboxOption, child: Pid) -> Result<Waited, ExecuteError> {
  // 复制 SyscallFilter
  let mut filter = option.ptrace().clone();
  let mut violation = None;
  let mut time_signal = false;

  loop {
    let status = waitpid(child, None)?;

    match status {
      WaitStatus::Exited(pid, status) => {
        info!("Child process #{}. exited with status {}", pid, status);
        return Ok(Waited {
          status: Some(status),
          signal: None,
          violation,
          time_signal,
        });
      }
      WaitStatus::Signaled(pid, signal, _) => {
        info!("Child process #{}. is signaled by {}", pid, signal);
        if matches!(signal, Signal::SIGALRM | Signal::SIGVTALRM | Signal::SIGXCPU) {
          time_signal = true;
        }
        return Ok(Waited {
          status: None,
          signal: Some(signal),
          violation,
          time_signal,
        });
      }
      WaitStatus::Stopped(pid, signal) => match signal {
        // 可能是超时了
        Signal::SIGALRM | Signal::SIGVTALRM | Signal::SIGXCPU => {
          info!(
            "Child process #{}. is stopped by {} (may be time limit exceeded)",
            pid, signal
          );
          time_signal = true;
          signal::kill(pid, Signal::SIGKILL)?;
        }
        // 处理系统调用
        Signal::SIGTRAP => {
          let user_regs = ptrace::getregs(pid)?;
          let allowed = filter
            .as_mut()
            .map_or(true, |filter| filter.filter(&user_regs));
          if allowed {
            ptrace::syscall(pid, None)?;
          } else {
            info!(
              "Child process #{}. is stopped for forbidden syscall (id = {})",
              pid, user_regs.orig_rax
            );
            violation = Some(user_regs.orig_rax);
            signal::kill(pid, Signal::SIGKILL)?;
          }
        }
        // 其余信号原样转发
        _ => {
          debug!("Child process #{}. is stopped by {}", pid, signal);
          ptrace::syscall(pid, Some(signal))?;
        }
      },
      WaitStatus::PtraceSyscall(pid) | WaitStatus::PtraceEvent(pid, _, _) => {
        ptrace::syscall(pid, None)?;
      }
      WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
    }
  }
}

/// Setup failure the child reported before it exited
fn setup_failure(message: &SandboxReadPipe) -> Option<ExecuteError> {
  let text = message.read().ok().flatten()?;
  error!("Sandbox setup fails: {}", text);
  Some(ExecuteError::Sandbox(text))
}

fn supervise(
  option: &SandboxOption,
  cancel: &CancelToken,
  child: Pid,
  message: &SandboxReadPipe,
  gate: SandboxWritePipe,
) -> Result<SandboxResult, ExecuteError> {
  // 设置 cgroup
  let cgroup = match SandboxCgroup::new(option, child) {
    Ok(cgroup) => cgroup,
    Err(err) => {
      kill_and_reap(child);
      return Err(err);
    }
  };

  if let Err(err) = gate.signal() {
    // 子进程已经退出, 它留下的信息才是真正的原因
    kill_and_reap(child);
    return Err(setup_failure(message).unwrap_or(err));
  }
  drop(gate);

  let limit = option.wall_time_limit();
  let (waited, watch) = thread::scope(|scope| {
    let (done_tx, done_rx) = mpsc::channel();
    let watcher = scope.spawn(move || watchdog(child, limit, cancel, done_rx));
    let waited = wait_child(option, child);
    if waited.is_err() {
      kill_and_reap(child);
    }
    let _ = done_tx.send(());
    let watch = watcher.join().unwrap_or(Watch::Finished);
    (waited, watch)
  });
  let waited = waited?;

  let usage = cgroup.usage();
  info!("{} {:?}", option.label(), usage);

  match watch {
    Watch::Cancelled => return Err(ExecuteError::Cancelled),
    Watch::TimedOut => return Err(ExecuteError::Timeout(limit)),
    Watch::Finished => {}
  }
  if waited.time_signal {
    let cpu_limit = Duration::from_millis(option.time_limit());
    return Err(ExecuteError::Timeout(cpu_limit.min(limit)));
  }

  if waited.status == Some(SETUP_FAILURE) {
    if let Some(err) = setup_failure(message) {
      return Err(err);
    }
  }

  Ok(SandboxResult {
    status: waited.status,
    signal: waited.signal,
    violation: waited.violation,
    usage,
  })
}

/// Fork and run one sandboxed process to completion
pub fn run(option: &SandboxOption, cancel: &CancelToken) -> Result<SandboxResult, ExecuteError> {
  let launch = Launch::prepare(option)?;
  let message = SandboxPipe::message()?;
  let gate = SandboxPipe::gate()?;

  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => {
      let message = message.read()?;
      let gate = gate.write()?;
      supervise(option, cancel, child, &message, gate)
    }
    Ok(ForkResult::Child) => {
      let message = match message.write() {
        Ok(pipe) => pipe,
        Err(_) => unsafe { libc::_exit(SETUP_FAILURE) },
      };
      let gate = match gate.read() {
        Ok(pipe) => pipe,
        Err(_) => unsafe { libc::_exit(SETUP_FAILURE) },
      };

      let failure = match child_main(&launch, &gate) {
        Ok(never) => match never {},
        Err(failure) => failure,
      };
      failure.report(&message);
      unsafe { libc::_exit(SETUP_FAILURE) }
    }
    Err(err) => Err(ExecuteError::sandbox(format!("Fork fails: {}", err))),
  }
}
