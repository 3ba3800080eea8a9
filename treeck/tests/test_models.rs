// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use walkdir::WalkDir;

fn models_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../models")
}

fn get_models(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| {
            entry.file_type().is_file() && entry.path().extension() == Some(OsStr::new("json"))
        })
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

fn treeck(args: &[&str], models: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_treeck"))
        .args(args)
        .args(models)
        .output()
        .expect("could not run treeck")
}

fn status_line(out: &Output) -> String {
    let stdout = String::from_utf8(out.stdout.clone()).expect("non-utf8 output");
    stdout.lines().next().unwrap_or_default().to_string()
}

#[test]
fn bounds_far_away() {
    let models = get_models(&models_dir());
    assert!(!models.is_empty());
    for path in models {
        println!("Running {}", path.display());
        let out = treeck(&["verify", "--workers", "2", "--gt", "1e9"], &[&path]);
        assert!(out.status.success(), "verify failed for {}", path.display());
        assert_eq!(status_line(&out), "status: UNSAT", "{}", path.display());

        let out = treeck(&["verify", "--workers", "2", "--lt", "1e9"], &[&path]);
        assert!(out.status.success(), "verify failed for {}", path.display());
        assert_eq!(status_line(&out), "status: SAT", "{}", path.display());
    }
}

#[test]
fn print_and_info() {
    for path in get_models(&models_dir()) {
        for command in ["print", "info"] {
            let out = treeck(&[command], &[&path]);
            assert!(
                out.status.success(),
                "{command} failed for {}",
                path.display()
            );
        }
    }
}

#[test]
fn invalid_models_are_rejected() {
    let models = get_models(&models_dir().join("invalid"));
    assert!(!models.is_empty());
    for path in models {
        let out = treeck(&["verify", "--gt", "0"], &[&path]);
        assert!(!out.status.success(), "{} was accepted", path.display());
        assert!(!out.stderr.is_empty());
    }
}

#[test]
fn tight_bounds() {
    let stumps = models_dir().join("stumps.json");
    let out = treeck(&["verify", "--gt", "3.5"], &[&stumps]);
    assert_eq!(status_line(&out), "status: SAT");
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("outputs 3.75"), "{stdout}");

    let out = treeck(&["verify", "--gt", "3.75"], &[&stumps]);
    assert_eq!(status_line(&out), "status: UNSAT");
}

#[test]
fn joint_models() {
    let stumps = models_dir().join("stumps.json");
    let chain = models_dir().join("chain.json");
    let out = treeck(
        &["verify", "--initial-tasks", "2", "--gt", "0:3.5", "--lt", "1:0"],
        &[&stumps, &chain],
    );
    assert!(out.status.success());
    assert_eq!(status_line(&out), "status: UNSAT");

    let out = treeck(
        &["verify", "--gt", "0:3.5", "--lt", "1:2", "--records"],
        &[&stumps, &chain],
    );
    assert!(out.status.success());
    assert_eq!(status_line(&out), "status: SAT");
}

#[test]
fn json_report() {
    let stumps = models_dir().join("stumps.json");
    let out = treeck(
        &["verify", "--json", "--no-check-paths", "--lt", "-0.5"],
        &[&stumps],
    );
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["num_initial_tasks"], 1);
    assert!(report["check_paths_time"].is_null());
    assert_eq!(report["results"].as_object().map(|r| r.len()), Some(1));
}

#[test]
fn info_snapshot() {
    let stumps = models_dir().join("stumps.json");
    let out = treeck(&["info"], &[&stumps]);
    insta::assert_snapshot!(String::from_utf8(out.stdout).unwrap(), @r###"
    trees: 3
    nodes: 9
    features: 2
    base score: 0.25
    domain: everything
    output bounds: [-0.75, 3.75]
    unreachable nodes: 0
    "###);

    let out = treeck(&["info", "--domain", "x0=2:"], &[&stumps]);
    insta::assert_snapshot!(String::from_utf8(out.stdout).unwrap(), @r###"
    trees: 3
    nodes: 9
    features: 2
    base score: 0.25
    domain: x0 in [2, inf)
    output bounds: [0.25, 1.75]
    unreachable nodes: 2
    "###);
}

#[test]
fn missing_property() {
    let stumps = models_dir().join("stumps.json");
    let out = treeck(&["verify"], &[&stumps]);
    assert!(!out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("no property"), "{stderr}");
}
