//! Btrfs storage backend, driven through the `btrfs` CLI.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use super::SubvolError;

const BTRFS: &str = "btrfs";

fn run<I, S>(args: I) -> Result<String, SubvolError>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
  let rendered = std::iter::once(BTRFS.to_string())
    .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
    .collect::<Vec<_>>()
    .join(" ");

  debug!(cmd = %rendered, "running btrfs");

  let output = Command::new(BTRFS)
    .args(&args)
    .output()
    .map_err(|e| SubvolError::io(Path::new(BTRFS), e))?;

  if !output.status.success() {
    return Err(SubvolError::Command {
      cmd: rendered,
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn create(path: &Path) -> Result<(), SubvolError> {
  run([OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()]).map(|_| ())
}

pub fn snapshot(parent: &Path, dest: &Path) -> Result<(), SubvolError> {
  run([
    OsStr::new("subvolume"),
    OsStr::new("snapshot"),
    parent.as_os_str(),
    dest.as_os_str(),
  ])
  .map(|_| ())
}

pub fn delete(path: &Path) -> Result<(), SubvolError> {
  run([OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()]).map(|_| ())
}

pub fn set_readonly(path: &Path, readonly: bool) -> Result<(), SubvolError> {
  let value = if readonly { "true" } else { "false" };
  run([
    OsStr::new("property"),
    OsStr::new("set"),
    OsStr::new("-ts"),
    path.as_os_str(),
    OsStr::new("ro"),
    OsStr::new(value),
  ])
  .map(|_| ())
}

pub fn is_readonly(path: &Path) -> Result<bool, SubvolError> {
  let stdout = run([
    OsStr::new("property"),
    OsStr::new("get"),
    OsStr::new("-ts"),
    path.as_os_str(),
    OsStr::new("ro"),
  ])?;
  Ok(parse_ro_property(&stdout))
}

/// `btrfs send`, incremental against `parent` when given. The parent must
/// itself be read-only.
pub fn send(path: &Path, parent: Option<&Path>, out: &Path) -> Result<(), SubvolError> {
  let mut args = vec![OsStr::new("send").to_os_string()];
  if let Some(parent) = parent {
    args.push("-p".into());
    args.push(parent.as_os_str().to_os_string());
  }
  args.push("-f".into());
  args.push(out.as_os_str().to_os_string());
  args.push(path.as_os_str().to_os_string());
  run(args).map(|_| ())
}

/// Parse the output of `btrfs property get -ts <path> ro` (`ro=true`).
fn parse_ro_property(stdout: &str) -> bool {
  stdout
    .lines()
    .filter_map(|line| line.trim().strip_prefix("ro="))
    .any(|value| value == "true")
}
