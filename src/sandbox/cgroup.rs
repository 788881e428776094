use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::cpu::CpuController;
use cgroups_rs::cpuacct::CpuAcctController;
use cgroups_rs::memory::MemController;
use cgroups_rs::pid::PidController;
use cgroups_rs::{Cgroup, CgroupPid, Controller, MaxValue};
use log::{debug, error, warn};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeVal;
use nix::unistd::Pid;
use serde::Serialize;

use crate::error::ExecuteError;
use crate::sandbox::option::SandboxOption;
use crate::utils::{MemoryLimitType, TimeLimitType};

/// One cgroup per sandboxed process, deleted on drop
pub struct SandboxCgroup {
  name: String,
  cgroup: Option<Cgroup>,
  enable_cpuacct: bool,
  enable_memory: bool,
}

/// Resource usage of one sandboxed process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SandboxUsage {
  /// ms
  time: TimeLimitType,
  time_user: TimeLimitType,
  time_sys: TimeLimitType,
  /// KB
  memory: MemoryLimitType,
}

impl SandboxCgroup {
  /// Create the cgroup for `child` and move it inside.
  ///
  /// When `option.enforce_limits()` is set, a missing controller is an error
  /// instead of a warning.
  pub fn new(option: &SandboxOption, child: Pid) -> Result<Self, ExecuteError> {
    debug!("Init cgroup {}", option.cgroup());

    let hierarchy = cgroups_rs::hierarchies::auto();
    let has = |name: &str| {
      hierarchy
        .subsystems()
        .iter()
        .any(|subsystem| subsystem.controller_name() == name)
    };

    let enable_cpu = has("cpu");
    let enable_cpuacct = has("cpuacct");
    let enable_memory = has("memory");
    let enable_pids = has("pids");

    let cgroup_name = format!("{}/{}.{}", option.cgroup(), option.cgroup(), child.as_raw());

    let mut missing = vec![];
    if !enable_memory {
      missing.push("memory");
    }
    if !enable_cpu && option.cpu_quota().is_some() {
      missing.push("cpu");
    }
    if !enable_pids {
      missing.push("pids");
    }
    if !missing.is_empty() {
      let message = format!("cgroup controllers are not supported: {}", missing.join(", "));
      if option.enforce_limits() {
        error!("{}", message);
        return Err(ExecuteError::sandbox(message));
      }
      warn!("{}", message);
    }

    let builder = CgroupBuilder::new(cgroup_name.as_str());
    let builder = if enable_memory {
      let memory_limit = option.memory_limit() as i64 * 1024;
      builder
        .memory()
        .memory_soft_limit(memory_limit)
        .memory_hard_limit(memory_limit)
        .memory_swap_limit(memory_limit)
        .done()
    } else {
      builder
    };
    let builder = match option.cpu_quota() {
      Some(quota) if enable_cpu => builder
        .cpu()
        .quota(quota)
        .period(option.cpu_period())
        .done(),
      _ => builder,
    };
    let builder = if enable_pids {
      builder
        .pid()
        .maximum_number_of_processes(MaxValue::Value(option.process() as i64))
        .done()
    } else {
      builder
    };

    let mut supported_controller = vec![];
    for (enabled, name) in [
      (enable_cpu, "cpu"),
      (enable_cpuacct, "cpuacct"),
      (enable_memory, "memory"),
      (enable_pids, "pids"),
    ] {
      if enabled {
        supported_controller.push(name.to_string());
      }
    }
    let builder = builder.set_specified_controllers(supported_controller);

    let cgroup = match builder.build(hierarchy) {
      Ok(cgroup) => cgroup,
      Err(err) => {
        let message = format!("Build cgroup {} fails: {}", cgroup_name, err);
        if option.enforce_limits() {
          error!("{}", message);
          return Err(ExecuteError::sandbox(message));
        }
        warn!("{}", message);
        return Ok(SandboxCgroup {
          name: cgroup_name,
          cgroup: None,
          enable_cpuacct: false,
          enable_memory: false,
        });
      }
    };

    // Own the cgroup before attaching, so a failed attach still deletes it
    let sandbox_cgroup = SandboxCgroup {
      name: cgroup_name,
      cgroup: Some(cgroup),
      enable_cpuacct,
      enable_memory,
    };
    sandbox_cgroup.attach(child, enable_cpu, enable_pids)?;
    Ok(sandbox_cgroup)
  }

  fn attach(&self, child: Pid, enable_cpu: bool, enable_pids: bool) -> Result<(), ExecuteError> {
    let cgroup = match &self.cgroup {
      Some(cgroup) => cgroup,
      None => return Ok(()),
    };
    let task = CgroupPid::from(child.as_raw() as u64);
    let fail = |controller: &str, err: cgroups_rs::error::Error| {
      ExecuteError::sandbox(format!(
        "Attach #{} to cgroup {} ({}) fails: {}",
        child, self.name, controller, err
      ))
    };
    let missing = |controller: &str| {
      ExecuteError::sandbox(format!("cgroup {} has no {} controller", self.name, controller))
    };

    if self.enable_memory {
      let memory: &MemController = cgroup.controller_of().ok_or_else(|| missing("memory"))?;
      memory.reset_max_usage().map_err(|e| fail("memory", e))?;
      memory.add_task(&task).map_err(|e| fail("memory", e))?;
    }
    if enable_cpu {
      let cpu: &CpuController = cgroup.controller_of().ok_or_else(|| missing("cpu"))?;
      cpu.add_task(&task).map_err(|e| fail("cpu", e))?;
    }
    if self.enable_cpuacct {
      let cpuacct: &CpuAcctController = cgroup.controller_of().ok_or_else(|| missing("cpuacct"))?;
      cpuacct.reset().map_err(|e| fail("cpuacct", e))?;
      cpuacct.add_task(&task).map_err(|e| fail("cpuacct", e))?;
    }
    if enable_pids {
      let pid: &PidController = cgroup.controller_of().ok_or_else(|| missing("pids"))?;
      pid.add_task(&task).map_err(|e| fail("pids", e))?;
    }
    Ok(())
  }

  pub fn usage(&self) -> SandboxUsage {
    let rusage = getrusage(UsageWho::RUSAGE_CHILDREN).ok();

    let cpuacct = match &self.cgroup {
      Some(cgroup) if self.enable_cpuacct => cgroup.controller_of::<CpuAcctController>(),
      _ => None,
    };
    let (time, time_user, time_sys) = match (cpuacct, rusage.as_ref()) {
      (Some(cpuacct), _) => {
        let acct = cpuacct.cpuacct();
        debug!("usage: {}", acct.usage);
        debug!("usage_sys: {}", acct.usage_sys);
        debug!("usage_user: {}", acct.usage_user);
        (
          acct.usage / 1000000,
          acct.usage_user / 1000000,
          acct.usage_sys / 1000000,
        )
      }
      (None, Some(usage)) => {
        let time_user = usage.user_time();
        let time_sys = usage.system_time();
        (
          milliseconds(time_user + time_sys),
          milliseconds(time_user),
          milliseconds(time_sys),
        )
      }
      (None, None) => (0, 0, 0),
    };

    let memory_controller = match &self.cgroup {
      Some(cgroup) if self.enable_memory => cgroup.controller_of::<MemController>(),
      _ => None,
    };
    let memory = match (memory_controller, rusage.as_ref()) {
      (Some(memory), _) => {
        let memswap = memory.memswap();
        debug!("memswap.max_usage_in_bytes: {}", memswap.max_usage_in_bytes);
        memswap.max_usage_in_bytes / 1024
      }
      (None, Some(usage)) => {
        debug!("usage.max_rss: {}", usage.max_rss());
        usage.max_rss() as u64
      }
      (None, None) => 0,
    };

    SandboxUsage {
      time,
      time_user,
      time_sys,
      memory,
    }
  }
}

impl Drop for SandboxCgroup {
  fn drop(&mut self) {
    if let Some(cgroup) = &self.cgroup {
      debug!("Delete created cgroup {}", self.name);
      if let Err(err) = cgroup.delete() {
        error!("Delete cgroup {} fails: {}", self.name, err);
      }
    }
  }
}

impl SandboxUsage {
  pub fn time(&self) -> TimeLimitType {
    self.time
  }

  pub fn time_user(&self) -> TimeLimitType {
    self.time_user
  }

  pub fn time_sys(&self) -> TimeLimitType {
    self.time_sys
  }

  pub fn memory(&self) -> MemoryLimitType {
    self.memory
  }
}

fn milliseconds(val: TimeVal) -> u64 {
  (val.tv_sec() * 1000 + val.tv_usec() / 1000) as u64
}
