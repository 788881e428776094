use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use crate::error::RepositoryError;
use crate::task::Task;

/// Read-only view of the task storage
pub trait TaskLookup: Send + Sync {
  /// Resolve a task by its unique name
  fn resolve(&self, name: &str) -> Result<Task, RepositoryError>;

  /// List the names of all stored tasks
  fn names(&self) -> Result<Vec<String>, RepositoryError>;
}

/// Task store backed by one JSON document, loaded once per process.
///
/// Records are kept as raw documents and validated when resolved, so one broken
/// record does not take the whole catalogue down.
#[derive(Debug, Clone)]
pub struct TaskStore {
  records: Vec<Value>,
  index: HashMap<String, usize>,
}

impl TaskStore {
  /// Load a JSON array of task records
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
    let path = path.as_ref();
    info!("Load tasks from {}", path.to_string_lossy());

    let text = fs::read_to_string(path).map_err(|err| match err.kind() {
      ErrorKind::NotFound => RepositoryError::BackendUnavailable(format!(
        "task file {} does not exist",
        path.to_string_lossy()
      )),
      _ => RepositoryError::BackendUnavailable(format!(
        "read {} fails: {}",
        path.to_string_lossy(),
        err
      )),
    })?;

    Self::parse(&text)
  }

  /// Parse a JSON array of task records
  pub fn parse(text: &str) -> Result<Self, RepositoryError> {
    let document: Value =
      serde_json::from_str(text).map_err(|err| RepositoryError::Malformed(err.to_string()))?;
    let records = match document {
      Value::Array(records) => records,
      Value::Object(mut object) => match object.remove("tasks") {
        Some(Value::Array(records)) => records,
        _ => {
          return Err(RepositoryError::Malformed(
            "expected an array of tasks".to_string(),
          ))
        }
      },
      _ => {
        return Err(RepositoryError::Malformed(
          "expected an array of tasks".to_string(),
        ))
      }
    };
    Self::from_records(records)
  }

  /// Build a store from already typed tasks
  pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, RepositoryError> {
    let records = tasks
      .into_iter()
      .map(|task| serde_json::to_value(task).map_err(|err| RepositoryError::Malformed(err.to_string())))
      .collect::<Result<Vec<Value>, RepositoryError>>()?;
    Self::from_records(records)
  }

  fn from_records(records: Vec<Value>) -> Result<Self, RepositoryError> {
    let mut index = HashMap::new();
    for (position, record) in records.iter().enumerate() {
      let name = match record.get("name").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => {
          return Err(RepositoryError::Malformed(format!(
            "task record #{} has no name",
            position + 1
          )))
        }
      };
      if index.insert(name.clone(), position).is_some() {
        return Err(RepositoryError::Malformed(format!(
          "task name '{}' is not unique",
          name
        )));
      }
    }
    debug!("Loaded {} task records", records.len());
    Ok(TaskStore { records, index })
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl TaskLookup for TaskStore {
  fn resolve(&self, name: &str) -> Result<Task, RepositoryError> {
    let position = self
      .index
      .get(name)
      .ok_or_else(|| RepositoryError::NotFound(name.to_string()))?;
    let record = self.records[*position].clone();
    serde_json::from_value::<Task>(record)
      .map_err(|err| RepositoryError::Malformed(format!("task '{}': {}", name, err)))
  }

  fn names(&self) -> Result<Vec<String>, RepositoryError> {
    Ok(
      self
        .records
        .iter()
        .filter_map(|record| record.get("name").and_then(Value::as_str))
        .map(|name| name.to_string())
        .collect(),
    )
  }
}
