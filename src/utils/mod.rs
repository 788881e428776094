use std::env;
use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::{error, info, Record};

use crate::error::ExecuteError;

pub mod mount;

pub type TimeLimitType = u64;

pub type MemoryLimitType = u64;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from tasks.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, ExecuteError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| ExecuteError::sandbox(format!("String {:?} contains a nul byte", string)))
}

/// Parse `KEY=VALUE`, or `KEY` to inherit the value from the current environment
pub(crate) fn parse_env<S: AsRef<str>>(text: S) -> Result<(String, String), String> {
  let text = text.as_ref();
  match text.split_once('=') {
    Some((key, _)) if key.is_empty() => {
      error!("Wrong environment variable string ({}) format", text);
      Err(format!("Wrong environment variable string ({}) format", text))
    }
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None if text.is_empty() => Err("Empty environment variable string".to_string()),
    None => {
      let value = env::var(text).unwrap_or_default();
      info!("Read environment variable {} = {}", text, value);
      Ok((text.to_string(), value))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_parse_env_pairs() {
    assert_eq!(
      parse_env("PATH=/usr/bin:/bin").unwrap(),
      ("PATH".to_string(), "/usr/bin:/bin".to_string())
    );
    assert_eq!(
      parse_env("A=x=y").unwrap(),
      ("A".to_string(), "x=y".to_string())
    );
    assert!(parse_env("=oops").is_err());
  }
}
