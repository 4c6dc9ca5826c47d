//! Plan command integration tests.

use predicates::prelude::*;
use serde_json::Value;

use super::common::TestEnv;

#[test]
fn plan_json_lists_phases_and_batches() {
  let env = TestEnv::new();
  let features = env.write_features(
    "features.json",
    r#"[
      {"kind": "make_dir", "path": "/a"},
      {"kind": "make_dir", "path": "/b"},
      {"kind": "make_dir", "path": "/a/c"}
    ]"#,
  );

  let output = env
    .plan_cmd("//img:plan")
    .arg("--feature-json")
    .arg(&features)
    .args(["--output", "json"])
    .output()
    .unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(plan["layer_target"], "//img:plan");
  assert_eq!(plan["phases"][0]["phase"], "make_subvol");
  assert_eq!(plan["phases"][0]["items"][0], "from_scratch");
  assert_eq!(
    plan["batches"],
    serde_json::json!([["make_dir:/a", "make_dir:/b"], ["make_dir:/a/c"]])
  );
}

#[test]
fn plan_never_creates_subvolumes() {
  let env = TestEnv::new();
  let features = env.write_features("features.json", r#"[{"kind": "make_dir", "path": "/a"}]"#);

  env
    .plan_cmd("//img:plan")
    .arg("--feature-json")
    .arg(&features)
    .assert()
    .success();

  let entries = std::fs::read_dir(env.subvolumes_dir()).unwrap().count();
  assert_eq!(entries, 0);
}

#[test]
fn plan_reports_graph_errors() {
  let env = TestEnv::new();
  let features = env.write_features(
    "features.json",
    r#"[{"kind": "symlink", "target": "/nowhere", "link": "/link"}]"#,
  );

  env
    .plan_cmd("//img:plan")
    .arg("--feature-json")
    .arg(&features)
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("symlink:/link requires /nowhere"));
}

#[test]
fn plan_warns_about_package_phase() {
  let env = TestEnv::new();
  let features = env.write_features(
    "features.json",
    r#"[{"kind": "install_packages", "names": ["bash"]}]"#,
  );

  env
    .plan_cmd("//img:plan")
    .arg("--feature-json")
    .arg(&features)
    .assert()
    .success()
    .stdout(predicate::str::contains("phase install_packages: install_packages:bash"))
    .stderr(predicate::str::contains("unknown until build time"));
}
