use std::os::unix::prelude::RawFd;

use log::error;
use nix::{
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::ExecuteError;

/// Pipe shared by the supervisor and the sandboxed child across `fork`.
///
/// Methods the child calls return plain `nix::Result`, so they never allocate.
pub struct SandboxPipe(RawFd, RawFd);

pub struct SandboxReadPipe(RawFd);

pub struct SandboxWritePipe(RawFd);

impl SandboxPipe {
  /// Non-blocking pipe for reporting setup failures, closed by a successful exec
  pub fn message() -> Result<Self, ExecuteError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok(SandboxPipe(result.0, result.1))
  }

  /// Blocking pipe used to hold the child until the parent released it
  pub fn gate() -> Result<Self, ExecuteError> {
    let result = pipe2(OFlag::O_CLOEXEC)?;
    Ok(SandboxPipe(result.0, result.1))
  }

  pub fn read(self) -> nix::Result<SandboxReadPipe> {
    close(self.1)?;
    Ok(SandboxReadPipe(self.0))
  }

  pub fn write(self) -> nix::Result<SandboxWritePipe> {
    close(self.0)?;
    Ok(SandboxWritePipe(self.1))
  }

  /// Keep both ends in one process
  #[cfg(test)]
  pub fn split(self) -> (SandboxReadPipe, SandboxWritePipe) {
    (SandboxReadPipe(self.0), SandboxWritePipe(self.1))
  }
}

impl SandboxReadPipe {
  /// Read one message, `None` when the writer closed without sending anything
  pub fn read(&self) -> Result<Option<String>, ExecuteError> {
    let mut buf = vec![0_u8; 512];
    let size = unistd::read(self.0, buf.as_mut_slice())?;
    let buf = buf
      .into_iter()
      .take(size)
      .take_while(|b| *b != 0)
      .collect::<Vec<u8>>();
    if buf.is_empty() {
      Ok(None)
    } else {
      Ok(Some(String::from_utf8_lossy(&buf).to_string()))
    }
  }

  /// Block until the other side sends a byte or closes
  pub fn wait(&self) -> nix::Result<bool> {
    let mut buf = [0_u8; 1];
    let size = unistd::read(self.0, &mut buf)?;
    Ok(size == 1)
  }
}

impl Drop for SandboxReadPipe {
  fn drop(&mut self) {
    if let Err(err) = close(self.0) {
      error!("Close read pipe fails: {}", err);
    }
  }
}

impl SandboxWritePipe {
  /// Send a nul terminated message
  pub fn send(&self, message: &[u8]) -> nix::Result<usize> {
    unistd::write(self.0, message)
  }

  /// Release the other side of a gate pipe
  pub fn signal(&self) -> Result<(), ExecuteError> {
    unistd::write(self.0, &[1_u8])?;
    Ok(())
  }
}

impl Drop for SandboxWritePipe {
  fn drop(&mut self) {
    if let Err(err) = close(self.0) {
      error!("Close write pipe fails: {}", err);
    }
  }
}
