//! Running the compiler inside the build appliance with `systemd-nspawn`.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use super::{EnvironmentDescriptor, NestedOutcome};
use crate::consts::BUILD_APPLIANCE_HOSTNAME;

pub const NSPAWN: &str = "systemd-nspawn";

/// Flag telling the re-invoked compiler it already runs in the appliance.
pub const IS_NESTED_FLAG: &str = "--is-nested";

/// Environment variables forwarded into the container.
const FORWARDED_ENV: &[&str] = &["RUST_LOG"];

/// A fully specified `systemd-nspawn` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NspawnInvocation {
  /// Subvolume booted as the container's root.
  pub appliance: PathBuf,
  pub cmd: Vec<OsString>,
  pub bind_ro: Vec<PathBuf>,
  pub bind_rw: Vec<PathBuf>,
  pub user: String,
  pub hostname: String,
  pub allow_mknod: bool,
  pub setenv: Vec<(String, String)>,
}

impl NspawnInvocation {
  /// Re-invoke the compiler with the original arguments, marked as nested.
  ///
  /// The source tree and the package snapshot are bound read-only, the
  /// subvolumes directory read-write, so the nested build writes its
  /// result where the outer process expects it.
  pub fn for_compiler(env: &EnvironmentDescriptor, appliance: PathBuf) -> Self {
    let mut cmd = vec![env.compiler_binary.clone().into_os_string(), IS_NESTED_FLAG.into()];
    cmd.extend(env.argv.iter().cloned());

    let mut bind_ro = vec![env.repo_root.clone()];
    bind_ro.extend(env.repo_snapshot.iter().cloned());

    let setenv = FORWARDED_ENV
      .iter()
      .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
      .collect();

    Self {
      appliance,
      cmd,
      bind_ro,
      bind_rw: vec![env.subvolumes_dir.clone()],
      user: "root".to_string(),
      hostname: BUILD_APPLIANCE_HOSTNAME.to_string(),
      // Receiving sendstreams inside the appliance needs mknod.
      allow_mknod: true,
      setenv,
    }
  }

  pub fn args(&self) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
      "--quiet".into(),
      "--register=no".into(),
      "--ephemeral".into(),
      prefixed("--directory=", &self.appliance),
      format!("--user={}", self.user).into(),
      format!("--hostname={}", self.hostname).into(),
    ];
    if self.allow_mknod {
      args.push("--capability=CAP_MKNOD".into());
    }
    for path in &self.bind_ro {
      args.push(prefixed("--bind-ro=", path));
    }
    for path in &self.bind_rw {
      args.push(prefixed("--bind=", path));
    }
    for (key, value) in &self.setenv {
      args.push(format!("--setenv={key}={value}").into());
    }
    args.push("--".into());
    args.extend(self.cmd.iter().cloned());
    args
  }
}

fn prefixed(flag: &str, path: &std::path::Path) -> OsString {
  let mut arg = OsString::from(flag);
  arg.push(path.as_os_str());
  arg
}

/// Starts a nested build and waits for it.
pub trait Spawner: Send + Sync {
  /// Run `invocation` to completion. In debug mode the child's stderr is
  /// also streamed live to ours.
  fn spawn(&self, invocation: &NspawnInvocation, debug: bool) -> io::Result<NestedOutcome>;
}

/// The real `systemd-nspawn`.
#[derive(Debug, Clone)]
pub struct SystemdNspawn {
  program: PathBuf,
}

impl Default for SystemdNspawn {
  fn default() -> Self {
    Self {
      program: PathBuf::from(NSPAWN),
    }
  }
}

impl SystemdNspawn {
  /// Use a specific `systemd-nspawn` binary instead of the one on `PATH`.
  pub fn with_program(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
    }
  }
}

impl Spawner for SystemdNspawn {
  fn spawn(&self, invocation: &NspawnInvocation, debug: bool) -> io::Result<NestedOutcome> {
    let args = invocation.args();
    debug!(program = %self.program.display(), args = ?args, "spawning nested build");

    let mut child = Command::new(&self.program)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::inherit())
      .stderr(Stdio::piped())
      .spawn()?;

    let mut stderr = String::new();
    if let Some(pipe) = child.stderr.take() {
      let mut live = io::stderr();
      for line in BufReader::new(pipe).lines() {
        let line = line?;
        if debug {
          writeln!(live, "{line}")?;
        }
        stderr.push_str(&line);
        stderr.push('\n');
      }
    }

    let status = child.wait()?;
    Ok(NestedOutcome {
      code: status.code(),
      stderr,
    })
  }
}
