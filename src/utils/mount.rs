use std::path::{Path, PathBuf};

use log::error;
use path_absolutize::Absolutize;

/// Read-only bind mount exposed inside the sandbox root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
  src: PathBuf,
  dst: PathBuf,
}

impl MountPoint {
  fn absolutize<P: AsRef<Path>>(path: P) -> Result<PathBuf, String> {
    path
      .as_ref()
      .absolutize()
      .map(|p| p.to_path_buf())
      .map_err(|e| e.to_string())
  }

  /// Parse `path` or `src:dst`
  pub fn parse<S: AsRef<str>>(text: S) -> Result<Self, String> {
    let text = text.as_ref();
    let arr = text.split(':').collect::<Vec<&str>>();
    match arr.as_slice() {
      [path] if !path.is_empty() => Ok(MountPoint {
        src: Self::absolutize(path)?,
        dst: Self::absolutize(path)?,
      }),
      [src, dst] if !src.is_empty() && !dst.is_empty() => {
        if !Path::new(dst).is_absolute() {
          return Err(format!("The dst path {} in mounts should be absolute", dst));
        }
        Ok(MountPoint {
          src: Self::absolutize(src)?,
          dst: PathBuf::from(dst),
        })
      }
      _ => {
        error!("Parse mount input string ({}) fails", text);
        Err(format!("Wrong mount string format: {}", text))
      }
    }
  }

  pub fn read<SP: Into<PathBuf>, DP: Into<PathBuf>>(src: SP, dst: DP) -> Self {
    MountPoint {
      src: src.into(),
      dst: dst.into(),
    }
  }

  pub fn src(&self) -> &PathBuf {
    &self.src
  }

  pub fn dst(&self) -> &PathBuf {
    &self.dst
  }

  /// Target of this mount point below `new_root`
  pub fn target(&self, new_root: &Path) -> PathBuf {
    match self.dst.strip_prefix("/") {
      Ok(relative) => new_root.join(relative),
      Err(_) => new_root.join(&self.dst),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_parse_mount_points() {
    let mount = MountPoint::parse("/usr").unwrap();
    assert_eq!(mount.src(), &PathBuf::from("/usr"));
    assert_eq!(mount.dst(), &PathBuf::from("/usr"));

    let mount = MountPoint::parse("/opt/python:/usr/local").unwrap();
    assert_eq!(mount.src(), &PathBuf::from("/opt/python"));
    assert_eq!(mount.dst(), &PathBuf::from("/usr/local"));

    assert!(MountPoint::parse("/a:relative").is_err());
    assert!(MountPoint::parse("/a:/b:/c").is_err());
    assert!(MountPoint::parse("").is_err());
  }

  #[test]
  fn it_should_resolve_target_in_new_root() {
    let mount = MountPoint::read("/usr/lib", "/usr/lib");
    assert_eq!(
      mount.target(Path::new("/tmp/box/root")),
      PathBuf::from("/tmp/box/root/usr/lib")
    );
  }
}
