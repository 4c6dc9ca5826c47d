//! Isolation boundary around a whole compile invocation.
//!
//! The compiler either runs in-process, or re-invokes itself inside the
//! build appliance and relays the child's result. The choice is made once
//! per invocation by [`Isolation::choose`]; the graph and scheduler code
//! is the same in both branches since the nested child simply runs the
//! in-process branch.

pub mod nspawn;
pub mod repo_server;

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

pub use nspawn::{IS_NESTED_FLAG, NSPAWN, NspawnInvocation, Spawner, SystemdNspawn};
pub use repo_server::RepoServer;

/// Everything needed to decide on and perform re-entry.
#[derive(Debug, Clone)]
pub struct EnvironmentDescriptor {
  /// Build appliance subvolume, when the flavor configures one.
  pub build_appliance: Option<PathBuf>,
  /// Already running inside the appliance.
  pub is_nested: bool,
  /// Build kinds that never need the appliance.
  pub exempt: bool,
  pub compiler_binary: PathBuf,
  /// Arguments for the nested compiler, with host paths made absolute.
  pub argv: Vec<OsString>,
  pub repo_root: PathBuf,
  pub subvolumes_dir: PathBuf,
  pub repo_snapshot: Option<PathBuf>,
  pub debug: bool,
}

/// Structured result of a nested run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedOutcome {
  /// `None` when the child was killed by a signal.
  pub code: Option<i32>,
  pub stderr: String,
}

#[derive(Debug, Error)]
pub enum IsolationError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: &'static str,
    #[source]
    source: std::io::Error,
  },

  #[error("build inside the build appliance failed ({}): {summary}", describe_code(*code))]
  NestedFailed { code: Option<i32>, summary: String },

  #[error("build inside the build appliance failed ({}); nested stderr:\n{stderr}", describe_code(*code))]
  NestedRaw { code: Option<i32>, stderr: String },
}

fn describe_code(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "killed by signal".to_string(),
  }
}

impl IsolationError {
  /// Exit status to report for this failure: the child's own, if it had one.
  pub fn exit_code(&self) -> i32 {
    match self {
      IsolationError::Spawn { .. } => 1,
      IsolationError::NestedFailed { code, .. } | IsolationError::NestedRaw { code, .. } => match code {
        Some(code) if *code != 0 => *code,
        _ => 1,
      },
    }
  }
}

/// Where the build runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
  InProcess,
  Nested(NspawnInvocation),
}

impl Isolation {
  /// Re-enter only when an appliance is configured, we are not already in
  /// it, and the build kind is not exempt.
  pub fn choose(env: &EnvironmentDescriptor) -> Self {
    match &env.build_appliance {
      Some(appliance) if !env.is_nested && !env.exempt => {
        Isolation::Nested(NspawnInvocation::for_compiler(env, appliance.clone()))
      }
      _ => Isolation::InProcess,
    }
  }
}

/// How the build was carried out.
#[derive(Debug)]
pub enum Reentry<T> {
  /// Built here; carries the build's own result.
  InProcess(T),
  /// Built by a nested child that exited successfully.
  Nested,
}

/// Turn a nested outcome into success or a single explicit error.
///
/// By default only the child's final diagnostic line is kept, so the user
/// sees one clean message rather than two stacked error reports. In debug
/// mode the full stderr is carried along.
pub fn translate(outcome: &NestedOutcome, debug: bool) -> Result<(), IsolationError> {
  if outcome.code == Some(0) {
    return Ok(());
  }
  if debug {
    return Err(IsolationError::NestedRaw {
      code: outcome.code,
      stderr: outcome.stderr.clone(),
    });
  }
  let summary = outcome
    .stderr
    .lines()
    .rev()
    .map(str::trim)
    .find(|line| !line.is_empty())
    .unwrap_or("no diagnostic output")
    .to_string();
  Err(IsolationError::NestedFailed {
    code: outcome.code,
    summary,
  })
}

/// Run `build_fn` here, or re-invoke the compiler inside the build
/// appliance and wait for it.
///
/// The nested run blocks the calling thread until the child exits.
pub async fn maybe_reenter<T, E, F, Fut>(
  env: &EnvironmentDescriptor,
  spawner: &dyn Spawner,
  build_fn: F,
) -> Result<Reentry<T>, E>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: From<IsolationError>,
{
  match Isolation::choose(env) {
    Isolation::InProcess => {
      debug!(is_nested = env.is_nested, exempt = env.exempt, "building in-process");
      build_fn().await.map(Reentry::InProcess)
    }
    Isolation::Nested(invocation) => {
      info!(appliance = %invocation.appliance.display(), "re-entering build appliance");
      let outcome = spawner
        .spawn(&invocation, env.debug)
        .map_err(|source| IsolationError::Spawn { program: NSPAWN, source })?;
      translate(&outcome, env.debug)?;
      Ok(Reentry::Nested)
    }
  }
}
