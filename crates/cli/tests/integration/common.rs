//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Flavor without a build appliance, so builds stay in-process.
pub const TEST_FLAVOR: &str = r#"{"name": "test"}"#;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding feature files and a
/// subvolumes directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a feature file relative to the temp directory and return its path.
  pub fn write_features(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Directory holding built subvolumes.
  pub fn subvolumes_dir(&self) -> PathBuf {
    let p = self.temp.path().join("subvols");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a `compile` command for `layer`, built in-process on the
  /// directory backend.
  pub fn compile_cmd(&self, layer: &str, rel_path: &str) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("strata");
    cmd.env_remove("STRATA_PROFILE");
    cmd.arg("compile");
    cmd.arg("--subvolumes-dir").arg(self.subvolumes_dir());
    cmd.args(["--subvolume-rel-path", rel_path, "--layer-target", layer]);
    cmd.args(["--storage", "directory", "--skip-build-appliance"]);
    cmd.arg("--repo-root").arg(self.temp.path());
    cmd
  }

  /// Get a `plan` command for `layer`.
  pub fn plan_cmd(&self, layer: &str) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("strata");
    cmd.args(["plan", "--layer-target", layer]);
    cmd
  }

  /// Make a built subvolume writable again so the temp dir can be removed.
  pub fn unseal(&self, rel_path: &str) {
    let root = self.subvolumes_dir().join(rel_path);
    if let Ok(metadata) = std::fs::metadata(&root) {
      use std::os::unix::fs::PermissionsExt;
      let mode = metadata.permissions().mode() | 0o700;
      std::fs::set_permissions(&root, std::fs::Permissions::from_mode(mode)).unwrap();
    }
  }
}
