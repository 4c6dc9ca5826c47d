//! Compile command integration tests.

use predicates::prelude::*;
use serde_json::Value;

use super::common::{TEST_FLAVOR, TestEnv};

const BASE_FEATURES: &str = r#"[
  {"kind": "make_dir", "path": "/etc"},
  {"kind": "make_dir", "path": "/usr"},
  {"kind": "install_file", "dest": "/etc/hostname", "contents": "box\n", "mode": 420},
  {"kind": "symlink", "target": "/etc/hostname", "link": "/usr/hostname"}
]"#;

fn descriptor(stdout: &[u8]) -> Value {
  serde_json::from_slice(stdout).unwrap()
}

#[test]
fn compile_builds_layer_and_prints_descriptor() {
  let env = TestEnv::new();
  let features = env.write_features("base.json", BASE_FEATURES);

  let output = env
    .compile_cmd("//img:base", "base:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .output()
    .unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let descriptor = descriptor(&output.stdout);
  assert_eq!(descriptor["version"], 1);
  assert_eq!(descriptor["subvolume_rel_path"], "base:1");
  assert_eq!(descriptor["readonly"], true);
  assert!(descriptor.get("parent_layer_path").is_none());

  let root = env.subvolumes_dir().join("base:1");
  assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "box\n");
  assert_eq!(
    std::fs::read_link(root.join("usr/hostname")).unwrap(),
    std::path::PathBuf::from("/etc/hostname")
  );
  assert!(root.join(".meta/flavor.json").exists());
  env.unseal("base:1");
}

#[test]
fn compile_child_layer_inherits_parent() {
  let env = TestEnv::new();
  let base = env.write_features("base.json", BASE_FEATURES);
  env
    .compile_cmd("//img:base", "base:1")
    .arg("--feature-json")
    .arg(&base)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .success();

  let child = env.write_features(
    "child.json",
    r#"[{"kind": "install_file", "dest": "/etc/motd", "contents": "hi\n"}]"#,
  );
  let parent = env.subvolumes_dir().join("base:1");
  let output = env
    .compile_cmd("//img:child", "child:1")
    .arg("--feature-json")
    .arg(&child)
    .arg("--parent-layer")
    .arg(&parent)
    .output()
    .unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let descriptor = descriptor(&output.stdout);
  assert_eq!(descriptor["parent_layer_path"], parent.display().to_string());

  let root = env.subvolumes_dir().join("child:1");
  assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "box\n");
  assert_eq!(std::fs::read_to_string(root.join("etc/motd")).unwrap(), "hi\n");
  assert!(!parent.join("etc/motd").exists());
  env.unseal("base:1");
  env.unseal("child:1");
}

#[test]
fn duplicate_provision_is_a_user_error() {
  let env = TestEnv::new();
  let features = env.write_features(
    "dup.json",
    r#"[
      {"kind": "make_dir", "path": "/opt"},
      {"kind": "install_file", "dest": "/opt", "contents": "x"}
    ]"#,
  );

  env
    .compile_cmd("//img:dup", "dup:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .failure()
    .code(1)
    .stdout(predicate::str::is_empty())
    .stderr(predicate::str::contains("provide /opt"));

  assert!(!env.subvolumes_dir().join("dup:1").exists());
}

#[test]
fn cycle_is_reported_with_its_members() {
  let env = TestEnv::new();
  let features = env.write_features(
    "cycle.json",
    r#"[
      {"kind": "make_dir", "path": "/a"},
      {"kind": "make_dir", "path": "/b"},
      {"kind": "symlink", "target": "/b/two", "link": "/a/one"},
      {"kind": "symlink", "target": "/a/one", "link": "/b/two"}
    ]"#,
  );

  env
    .compile_cmd("//img:cycle", "cycle:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("dependency cycle"))
    .stderr(predicate::str::contains("symlink:/a/one"))
    .stderr(predicate::str::contains("symlink:/b/two"));

  assert!(!env.subvolumes_dir().join("cycle:1").exists());
}

#[test]
fn unsatisfied_requirement_names_the_path() {
  let env = TestEnv::new();
  let features = env.write_features(
    "orphan.json",
    r#"[{"kind": "install_file", "dest": "/missing/file", "contents": "x"}]"#,
  );

  env
    .compile_cmd("//img:orphan", "orphan:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("requires /missing, which nothing provides"));
}

#[test]
fn failing_item_discards_the_subvolume() {
  let env = TestEnv::new();
  let features = env.write_features(
    "bad.json",
    r#"[
      {"kind": "make_dir", "path": "/etc"},
      {"kind": "install_file", "dest": "/etc/pinned", "contents": "abc", "sha256": "0000"}
    ]"#,
  );

  env
    .compile_cmd("//img:bad", "bad:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("install_file:/etc/pinned"))
    .stderr(predicate::str::contains("sha256 mismatch"));

  assert!(!env.subvolumes_dir().join("bad:1").exists());
}

#[test]
fn host_mounts_need_permission() {
  let env = TestEnv::new();
  let features = env.write_features(
    "mount.json",
    r#"[{"kind": "host_mount", "source": "/tmp", "mountpoint": "/mnt"}]"#,
  );

  env
    .compile_cmd("//img:mount", "mount:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("not allowed to declare host mounts"));

  env
    .compile_cmd("//img:mount", "mount:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .args(["--allowed-host-mount-target", "//img:mount"])
    .assert()
    .success();

  let root = env.subvolumes_dir().join("mount:1");
  assert!(root.join("mnt").is_dir());
  assert!(root.join(".meta/mounts/mnt.json").exists());
  env.unseal("mount:1");
}

#[test]
fn missing_flavor_fails() {
  let env = TestEnv::new();
  let features = env.write_features("base.json", BASE_FEATURES);

  env
    .compile_cmd("//img:base", "base:1")
    .arg("--feature-json")
    .arg(&features)
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("no flavor config"));
}

#[test]
fn profile_writes_timings() {
  let env = TestEnv::new();
  let features = env.write_features("base.json", BASE_FEATURES);
  let profile_dir = env.temp.path().join("profile");

  env
    .compile_cmd("//img:base", "base:1")
    .env("STRATA_PROFILE", &profile_dir)
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .assert()
    .success();

  let timings = std::fs::read(profile_dir.join("__img:base.timings.json")).unwrap();
  let timings: Value = serde_json::from_slice(&timings).unwrap();
  assert_eq!(timings["layer_target"], "//img:base");
  let batches = timings["batches"].as_array().unwrap();
  assert_eq!(batches.len(), 3);
  assert_eq!(batches[0]["items"].as_array().unwrap().len(), 2);
  env.unseal("base:1");
}

#[test]
fn malformed_version_set_names_the_line() {
  let env = TestEnv::new();
  let features = env.write_features("base.json", BASE_FEATURES);
  env.write_features("pins.tsv", "0\tbash\t5.1.8\t6.el9\tx86_64\nbash-5.1.8\n");

  env
    .compile_cmd("//img:base", "base:1")
    .arg("--feature-json")
    .arg(&features)
    .args(["--flavor-config", TEST_FLAVOR])
    .arg("--version-set-override")
    .arg(env.temp.path().join("pins.tsv"))
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("pins.tsv:2"));

  assert!(!env.subvolumes_dir().join("base:1").exists());
}

#[test]
fn relative_paths_resolve_against_working_directory() {
  let env = TestEnv::new();
  env.write_features("features/base.json", BASE_FEATURES);

  let output = env
    .compile_cmd("//img:base", "base:1")
    .current_dir(env.temp.path())
    .args(["--feature-json", "features/base.json"])
    .args(["--flavor-config", TEST_FLAVOR])
    .output()
    .unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let root = env.subvolumes_dir().join("base:1");
  assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "box\n");
  env.unseal("base:1");
}
