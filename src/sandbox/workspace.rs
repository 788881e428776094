use std::fs::{self, File, Permissions};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, error};
use tempfile::Builder;

use crate::error::ExecuteError;

/// Where the working directory appears inside the sandbox
pub const SANDBOX_DIR: &str = "/sandbox";

/// Disposable directory tree backing one execution:
///
/// ```text
/// case-XXXXXX/
///   main.py       fed to the interpreter as stdin, never mounted
///   box/          empty, mounted read-only at /sandbox
///   root/         new root of the sandboxed process
///   output.log    combined stdout and stderr
/// ```
///
/// The whole tree is removed on drop.
pub struct Workspace {
  dir: PathBuf,
}

impl Workspace {
  pub fn create(parent: &Path, script: &str) -> Result<Self, ExecuteError> {
    let dir = Builder::new()
      .prefix("case-")
      .tempdir_in(parent)
      .map_err(|e| {
        ExecuteError::sandbox(format!(
          "Create workspace in {} fails: {}",
          parent.to_string_lossy(),
          e
        ))
      })?
      .keep();
    let workspace = Workspace { dir };

    // stdin 在 chroot 之前打开, 脚本只需父进程可读
    fs::write(workspace.script_path(), script)?;
    fs::set_permissions(workspace.script_path(), Permissions::from_mode(0o600))?;

    for dir in [workspace.box_dir(), workspace.root_dir()] {
      fs::create_dir(&dir)?;
      fs::set_permissions(&dir, Permissions::from_mode(0o755))?;
    }

    File::create(workspace.output_path())?;

    debug!("Create workspace {}", workspace.dir.to_string_lossy());
    Ok(workspace)
  }

  pub fn script_path(&self) -> PathBuf {
    self.dir.join("main.py")
  }

  pub fn box_dir(&self) -> PathBuf {
    self.dir.join("box")
  }

  pub fn root_dir(&self) -> PathBuf {
    self.dir.join("root")
  }

  pub fn output_path(&self) -> PathBuf {
    self.dir.join("output.log")
  }

  /// Read at most `limit` bytes of captured output
  pub fn read_output(&self, limit: u64) -> Result<Vec<u8>, ExecuteError> {
    let file = File::open(self.output_path())?;
    let mut output = vec![];
    file.take(limit).read_to_end(&mut output)?;
    Ok(output)
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    debug!("Remove workspace {}", self.dir.to_string_lossy());
    if let Err(err) = remove_dir_all::remove_dir_all(&self.dir) {
      error!(
        "Fails removing workspace: {} ({})",
        self.dir.to_string_lossy(),
        err
      );
    }
  }
}
