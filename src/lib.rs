pub use cancel::CancelToken;
pub use config::{SandboxConfig, Settings};
pub use error::{CheckError, CheckExit, ExecuteError, OrchestratorError, RepositoryError, StatusClass};
pub use orchestrator::{ExecutionResult, FailureReason, Orchestrator, RunSummary};
pub use repository::{TaskLookup, TaskStore};
pub use sandbox::{Execution, Executor, Sandbox, Session};
pub use synthesizer::{synthesize, TestScript};
pub use task::{Example, Task, TestCase};

mod cancel;
pub mod config;
mod error;
mod orchestrator;
mod repository;
pub mod sandbox;
pub mod synthesizer;
mod task;
pub mod utils;
