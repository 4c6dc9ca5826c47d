//! Implementation of the `strata compile` command.
//!
//! Builds one layer and prints its subvolume descriptor as JSON on stdout.
//! A nested run (inside the build appliance) prints nothing on stdout; the
//! outer process describes the result once the child has exited.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use strata_lib::compile::{CompileRequest, build_image};
use strata_lib::consts::PROFILE_ENV;
use strata_lib::subvol::StorageBackend;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum Storage {
  #[default]
  Btrfs,
  Directory,
}

impl From<Storage> for StorageBackend {
  fn from(storage: Storage) -> Self {
    match storage {
      Storage::Btrfs => StorageBackend::Btrfs,
      Storage::Directory => StorageBackend::Directory,
    }
  }
}

#[derive(Args, Debug)]
pub struct CompileArgs {
  /// Directory holding all built subvolumes
  #[arg(long)]
  pub subvolumes_dir: PathBuf,

  /// Where to create the new subvolume, relative to --subvolumes-dir
  #[arg(long)]
  pub subvolume_rel_path: PathBuf,

  /// Name of the layer being built
  #[arg(long)]
  pub layer_target: String,

  /// Feature file to build from (repeatable)
  #[arg(long = "feature-json")]
  pub feature_json: Vec<PathBuf>,

  /// Flavor configuration as JSON; inherited from the parent layer if omitted
  #[arg(long)]
  pub flavor_config: Option<String>,

  /// Subvolume to snapshot as the starting point
  #[arg(long)]
  pub parent_layer: Option<PathBuf>,

  /// JSON map of build targets to their output paths
  #[arg(long)]
  pub targets_and_outputs: Option<PathBuf>,

  /// File of TAB-separated ENVRAs pinning package versions, one per line
  #[arg(long)]
  pub version_set_override: Option<PathBuf>,

  /// Layer allowed to declare host mounts (repeatable)
  #[arg(long = "allowed-host-mount-target")]
  pub allowed_host_mount_targets: Vec<String>,

  /// Mark the layer's artifacts as needing the package repository
  #[arg(long)]
  pub artifacts_may_require_repo: bool,

  /// Build items one at a time and write timings to this directory
  #[arg(long, env = PROFILE_ENV)]
  pub profile: Option<PathBuf>,

  /// Compiler to run inside the build appliance [default: this executable]
  #[arg(long)]
  pub compiler_binary: Option<PathBuf>,

  /// Build without re-entering the build appliance
  #[arg(long)]
  pub skip_build_appliance: bool,

  /// Storage engine for the new subvolume
  #[arg(long, value_enum, default_value = "btrfs")]
  pub storage: Storage,

  /// Source tree bound read-only into the build appliance [default: current directory]
  #[arg(long)]
  pub repo_root: Option<PathBuf>,
}

impl Storage {
  fn as_arg(self) -> &'static str {
    match self {
      Storage::Btrfs => "btrfs",
      Storage::Directory => "directory",
    }
  }
}

fn absolute(cwd: &Path, path: PathBuf) -> PathBuf {
  if path.is_absolute() { path } else { cwd.join(path) }
}

impl CompileArgs {
  /// Resolve every host path against `cwd`, filling in the defaults that
  /// depend on the running process.
  fn resolve(mut self, cwd: &Path, current_exe: PathBuf) -> Self {
    self.subvolumes_dir = absolute(cwd, self.subvolumes_dir);
    self.feature_json = self.feature_json.into_iter().map(|p| absolute(cwd, p)).collect();
    self.parent_layer = self.parent_layer.map(|p| absolute(cwd, p));
    self.targets_and_outputs = self.targets_and_outputs.map(|p| absolute(cwd, p));
    self.version_set_override = self.version_set_override.map(|p| absolute(cwd, p));
    self.profile = self.profile.map(|p| absolute(cwd, p));
    self.compiler_binary = Some(absolute(cwd, self.compiler_binary.unwrap_or(current_exe)));
    self.repo_root = Some(absolute(cwd, self.repo_root.unwrap_or_else(|| cwd.to_path_buf())));
    self
  }

  /// Arguments that repeat this compile inside the build appliance, whose
  /// working directory is not ours.
  fn nested_argv(&self, debug: bool) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec!["compile".into()];
    let mut push = |flag: &str, value: &OsStr| {
      argv.push(flag.into());
      argv.push(value.to_os_string());
    };

    push("--subvolumes-dir", self.subvolumes_dir.as_os_str());
    push("--subvolume-rel-path", self.subvolume_rel_path.as_os_str());
    push("--layer-target", OsStr::new(&self.layer_target));
    for path in &self.feature_json {
      push("--feature-json", path.as_os_str());
    }
    if let Some(flavor) = &self.flavor_config {
      push("--flavor-config", OsStr::new(flavor));
    }
    if let Some(path) = &self.parent_layer {
      push("--parent-layer", path.as_os_str());
    }
    if let Some(path) = &self.targets_and_outputs {
      push("--targets-and-outputs", path.as_os_str());
    }
    if let Some(path) = &self.version_set_override {
      push("--version-set-override", path.as_os_str());
    }
    for target in &self.allowed_host_mount_targets {
      push("--allowed-host-mount-target", OsStr::new(target));
    }
    if let Some(path) = &self.profile {
      push("--profile", path.as_os_str());
    }
    if let Some(path) = &self.compiler_binary {
      push("--compiler-binary", path.as_os_str());
    }
    if let Some(path) = &self.repo_root {
      push("--repo-root", path.as_os_str());
    }
    push("--storage", OsStr::new(self.storage.as_arg()));

    if self.artifacts_may_require_repo {
      argv.push("--artifacts-may-require-repo".into());
    }
    if self.skip_build_appliance {
      argv.push("--skip-build-appliance".into());
    }
    if debug {
      argv.push("--debug".into());
    }
    argv
  }
}

/// Execute the compile command.
pub fn cmd_compile(args: CompileArgs, debug: bool, is_nested: bool) -> Result<()> {
  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  let current_exe = std::env::current_exe().context("Failed to locate the strata executable")?;
  let args = args.resolve(&cwd, current_exe);
  let argv = args.nested_argv(debug);

  let request = CompileRequest {
    subvolumes_dir: args.subvolumes_dir,
    subvolume_rel_path: args.subvolume_rel_path,
    layer_target: args.layer_target,
    feature_json: args.feature_json,
    flavor_config: args.flavor_config,
    parent_layer: args.parent_layer,
    targets_and_outputs: args.targets_and_outputs,
    version_set_override: args.version_set_override,
    allowed_host_mount_targets: args.allowed_host_mount_targets,
    artifacts_may_require_repo: args.artifacts_may_require_repo,
    profile_dir: args.profile,
    compiler_binary: args.compiler_binary.unwrap_or_default(),
    skip_build_appliance: args.skip_build_appliance,
    storage: args.storage.into(),
    repo_root: args.repo_root.unwrap_or(cwd),
    is_nested,
    debug,
    argv,
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(build_image(&request))?;

  if let Some(report) = &outcome.report {
    info!(
      layer = %report.layer_target,
      items = report.item_count(),
      batches = report.batches.len(),
      elapsed = %humantime::format_duration(Duration::from_millis(report.total_ms)),
      "layer compiled"
    );
  }

  if !is_nested {
    outcome
      .descriptor
      .to_json_writer(std::io::stdout().lock())
      .context("Failed to print subvolume descriptor")?;
  }

  Ok(())
}
