//! One compile invocation, from command-line inputs to a described,
//! sealed subvolume.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::{BuildError, BuildReport, SchedulerConfig, compile_items_to_subvol};
use crate::descriptor::{DescriptorError, SubvolumeOnDisk};
use crate::isolate::{
  EnvironmentDescriptor, IsolationError, Reentry, RepoServer, Spawner, SystemdNspawn, maybe_reenter,
};
use crate::item::features::{FeatureError, ScratchSpace, load_items};
use crate::options::{
  ConfigError, FlavorConfig, LayerOptions, Preflight, PreflightError, VersionSet, load_targets_and_outputs,
};
use crate::subvol::{BuildLock, LockError, StorageBackend, Subvol};

/// Everything the CLI passes to a compile.
#[derive(Debug, Clone)]
pub struct CompileRequest {
  pub subvolumes_dir: PathBuf,
  pub subvolume_rel_path: PathBuf,
  pub layer_target: String,
  pub feature_json: Vec<PathBuf>,
  /// Raw flavor config JSON.
  pub flavor_config: Option<String>,
  pub parent_layer: Option<PathBuf>,
  pub targets_and_outputs: Option<PathBuf>,
  /// TAB-separated ENVRA file pinning package versions.
  pub version_set_override: Option<PathBuf>,
  pub allowed_host_mount_targets: Vec<String>,
  pub artifacts_may_require_repo: bool,
  pub profile_dir: Option<PathBuf>,
  pub compiler_binary: PathBuf,
  /// Never re-enter the build appliance for this build.
  pub skip_build_appliance: bool,
  pub storage: StorageBackend,
  pub repo_root: PathBuf,
  pub is_nested: bool,
  pub debug: bool,
  /// Arguments that repeat this compile inside the build appliance.
  pub argv: Vec<OsString>,
}

impl CompileRequest {
  pub fn subvolume_path(&self) -> PathBuf {
    self.subvolumes_dir.join(&self.subvolume_rel_path)
  }
}

#[derive(Debug, Error)]
pub enum CompileError {
  #[error(transparent)]
  Preflight(#[from] PreflightError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Features(#[from] FeatureError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Isolation(#[from] IsolationError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error("the subvolume content is complete, but describing it failed: {0}")]
  Descriptor(#[from] DescriptorError),

  #[error("failed to serve package repository snapshot {path}: {source}")]
  RepoServer {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write profile {path}: {source}")]
  Profile {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl CompileError {
  /// Process exit status: 1 for errors the user can fix, the nested
  /// child's own status for appliance failures, 2 for internal defects.
  pub fn exit_code(&self) -> i32 {
    match self {
      CompileError::Isolation(e) => e.exit_code(),
      CompileError::Build(e) if e.is_internal() => 2,
      _ => 1,
    }
  }
}

/// Result of a compile.
#[derive(Debug)]
pub struct CompileOutcome {
  pub descriptor: SubvolumeOnDisk,
  /// Present when the build ran in this process.
  pub report: Option<BuildReport>,
}

/// File name of the profile written for `layer_target`.
pub fn profile_file_name(layer_target: &str) -> String {
  format!("{}.timings.json", layer_target.replace('/', "_"))
}

fn write_profile(dir: &Path, report: &BuildReport) -> Result<PathBuf, CompileError> {
  let path = dir.join(profile_file_name(&report.layer_target));
  let io_err = |source| CompileError::Profile {
    path: path.clone(),
    source,
  };
  std::fs::create_dir_all(dir).map_err(io_err)?;
  let json = serde_json::to_vec_pretty(report).map_err(|e| io_err(std::io::Error::other(e)))?;
  std::fs::write(&path, json).map_err(io_err)?;
  Ok(path)
}

/// Build the subvolume in this process.
async fn compile_local(req: &CompileRequest, mut opts: LayerOptions) -> Result<BuildReport, CompileError> {
  // Held until the build is over.
  let mut _server = None;
  if let Some(snapshot) = opts.flavor.rpm_repo_snapshot.clone() {
    if req.is_nested {
      let server = RepoServer::start(&snapshot)
        .await
        .map_err(|source| CompileError::RepoServer { path: snapshot, source })?;
      opts.repo_url = Some(server.url());
      _server = Some(server);
    } else {
      opts.repo_url = Some(format!("file://{}", snapshot.display()));
    }
  }

  let scratch = ScratchSpace::new()?;
  let items = load_items(&req.feature_json, req.parent_layer.as_deref(), &opts, &scratch)?;

  let path = req.subvolume_path();
  let existed_before = path.exists();
  let subvol = Arc::new(Subvol::at(&path, req.storage));
  let config = SchedulerConfig {
    concurrent: req.profile_dir.is_none(),
  };

  // The subvolume is sealed inside the scheduler, before scratch space is
  // cleaned up.
  let result = compile_items_to_subvol(items, Arc::clone(&subvol), Arc::new(opts), &config).await;
  drop(scratch);

  let report = match result {
    Ok(report) => report,
    Err(e) => {
      if !existed_before {
        discard(&path, req.storage);
      }
      return Err(e.into());
    }
  };

  if let Some(dir) = &req.profile_dir {
    let written = write_profile(dir, &report)?;
    info!(path = %written.display(), "wrote build profile");
  }
  Ok(report)
}

/// Remove a failed build's partial subvolume.
fn discard(path: &Path, storage: StorageBackend) {
  if !path.exists() {
    return;
  }
  let removed = Subvol::open(path, storage).and_then(Subvol::delete);
  match removed {
    Ok(()) => info!(path = %path.display(), "discarded partially built subvolume"),
    Err(e) => warn!(path = %path.display(), error = %e, "failed to discard partially built subvolume"),
  }
}

/// Compile one layer: preflight, flavor resolution, locking, isolation,
/// the build itself, and the result descriptor.
pub async fn build_image(req: &CompileRequest) -> Result<CompileOutcome, CompileError> {
  build_image_with(req, &SystemdNspawn::default()).await
}

/// [`build_image`], re-entering the build appliance through `spawner`.
pub async fn build_image_with(req: &CompileRequest, spawner: &dyn Spawner) -> Result<CompileOutcome, CompileError> {
  let preflight = Preflight::check()?;

  let target_to_path = match &req.targets_and_outputs {
    Some(path) => load_targets_and_outputs(path)?,
    None => Default::default(),
  };
  let flavor = FlavorConfig::resolve(req.flavor_config.as_deref(), req.parent_layer.as_deref())?;
  let version_set = match &req.version_set_override {
    Some(path) => VersionSet::load(path)?,
    None => VersionSet::default(),
  };

  let build_appliance = match &flavor.build_appliance {
    Some(target) => Some(
      target_to_path
        .get(target)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownTarget(target.clone()))?,
    ),
    None => None,
  };

  let env = EnvironmentDescriptor {
    build_appliance: build_appliance.clone(),
    is_nested: req.is_nested,
    exempt: req.skip_build_appliance,
    compiler_binary: req.compiler_binary.clone(),
    argv: req.argv.clone(),
    repo_root: req.repo_root.clone(),
    subvolumes_dir: req.subvolumes_dir.clone(),
    repo_snapshot: flavor.rpm_repo_snapshot.clone(),
    debug: req.debug,
  };

  let path = req.subvolume_path();
  let _lock = if req.is_nested {
    None
  } else {
    Some(BuildLock::acquire(&path, &format!("compile {}", req.layer_target))?)
  };

  let opts = LayerOptions {
    layer_target: req.layer_target.clone(),
    flavor,
    build_appliance: build_appliance.clone(),
    repo_url: None,
    version_set,
    artifacts_may_require_repo: req.artifacts_may_require_repo,
    target_to_path,
    subvolumes_dir: req.subvolumes_dir.clone(),
    allowed_host_mount_targets: req.allowed_host_mount_targets.iter().cloned().collect::<BTreeSet<_>>(),
    storage: req.storage,
    preflight,
    debug: req.debug,
  };

  info!(layer = %req.layer_target, subvolume = %path.display(), "compiling layer");
  let report = match maybe_reenter(&env, spawner, || compile_local(req, opts)).await? {
    Reentry::InProcess(report) => Some(report),
    Reentry::Nested => None,
  };

  let subvol = Subvol::open(&path, req.storage).map_err(DescriptorError::from)?;
  let descriptor = SubvolumeOnDisk::from_subvolume_path(
    &subvol,
    &req.subvolumes_dir,
    req.parent_layer.as_deref(),
    build_appliance.as_deref(),
  )?;

  Ok(CompileOutcome { descriptor, report })
}
