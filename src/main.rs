use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use lazy_static::lazy_static;
use log::{error, info};
use nix::libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use codecheck::utils::default_format;
use codecheck::{
  CancelToken, CheckError, CheckExit, FailureReason, Orchestrator, RunSummary, Sandbox, Settings,
  TaskLookup, TaskStore,
};

lazy_static! {
  static ref INTERRUPT: CancelToken = CancelToken::new();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Check Python submissions against stored tasks", long_about = None)]
struct Cli {
  #[arg(short, long, help = "Config file (default: $CODECHECK_CONFIG or ./codecheck.toml)")]
  config: Option<PathBuf>,

  #[arg(long, help = "Log specification, e.g. codecheck=debug")]
  log: Option<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run a submission against the test cases of a task")]
  Run {
    #[arg(help = "Task name")]
    task: String,

    #[arg(help = "Python source file, - reads stdin")]
    code: PathBuf,

    #[arg(long, default_value_t = false, help = "Print the summary as JSON")]
    json: bool,
  },

  #[command(about = "List stored tasks")]
  Tasks,

  #[command(about = "Show the statement of a task")]
  Show {
    #[arg(help = "Task name")]
    task: String,
  },
}

extern "C" fn handle_interrupt(_: c_int) {
  INTERRUPT.cancel();
}

fn install_interrupt_handler() -> Result<(), CheckError> {
  // Force initialization outside of the signal handler
  lazy_static::initialize(&INTERRUPT);
  let action = SigAction::new(
    SigHandler::Handler(handle_interrupt),
    SaFlags::empty(),
    SigSet::empty(),
  );
  for signal in [Signal::SIGINT, Signal::SIGTERM] {
    unsafe { sigaction(signal, &action) }
      .map_err(|errno| CheckError::cli(format!("install {} handler fails: {}", signal, errno)))?;
  }
  Ok(())
}

fn read_code(path: &Path) -> Result<String, CheckError> {
  if path.as_os_str() == "-" {
    let mut code = String::new();
    io::stdin().read_to_string(&mut code)?;
    Ok(code)
  } else {
    fs::read_to_string(path).map_err(|e| {
      CheckError::cli(format!("read {} fails: {}", path.to_string_lossy(), e))
    })
  }
}

fn print_summary(summary: &RunSummary) {
  for (idx, result) in summary.results.iter().enumerate() {
    let verdict = match result.failure_reason {
      FailureReason::None => "passed",
      FailureReason::Mismatch => "wrong answer",
      FailureReason::RuntimeError => "runtime error",
      FailureReason::Timeout => "timeout",
      FailureReason::SandboxError => "sandbox error",
    };
    println!("Test case {}: {}", idx + 1, verdict);
  }
  println!("{}", summary.message);
}

fn start(cli: Cli) -> Result<(), CheckError> {
  let settings = Settings::load(cli.config.as_deref())?;
  let spec = cli.log.unwrap_or_else(|| settings.log.clone());

  let _logger = Logger::try_with_str(spec)?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("codecheck")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .print_message()
    .start()?;

  let tasks = Arc::new(TaskStore::open(&settings.tasks)?);

  match cli.command {
    Commands::Tasks => {
      for name in tasks.names()? {
        println!("{}", name);
      }
    }
    Commands::Show { task } => {
      let task = tasks.resolve(&task)?;
      println!("{}", serde_json::to_string_pretty(&task)?);
    }
    Commands::Run { task, code, json } => {
      let code = read_code(&code)?;
      install_interrupt_handler()?;

      info!("Start checking submission for task {}", task);
      let sandbox = Arc::new(Sandbox::new(&settings.sandbox)?);
      let orchestrator =
        Orchestrator::new(tasks, sandbox).max_code_length(settings.max_code_length);
      let summary = orchestrator.run_with_cancel(&task, &code, &INTERRUPT)?;
      info!("Checking submission finished: {}", summary);

      if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
      } else {
        print_summary(&summary);
      }
    }
  }

  Ok(())
}

fn main() -> CheckExit {
  let cli = Cli::parse();
  match start(cli) {
    Ok(_) => CheckExit::Ok,
    Err(err) => {
      error!("{}", err);
      CheckExit::Err(err)
    }
  }
}
