#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    config: std::path::PathBuf,
    image: std::path::PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "log_filter = \"extmap=error\"\n").expect("write config");
        let image = dir.path().join("volume.img");
        Self {
            _dir: dir,
            config,
            image,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("extmap");
        cmd.env_remove("RUST_LOG").arg("--config").arg(&self.config);
        cmd
    }

    fn image(&self) -> &Path {
        &self.image
    }
}

fn formatted() -> Workspace {
    let ws = Workspace::new();
    ws.cmd()
        .args(["format", "--block-size", "1024", "--blocks", "2048", "--inodes", "8"])
        .arg(ws.image())
        .assert()
        .success();
    ws
}

fn create_file(ws: &Workspace) -> u64 {
    run_json(ws, "create", &[]).as_u64().expect("inode number")
}

fn run(ws: &Workspace, sub: &str, rest: &[&str]) {
    ws.cmd().arg(sub).arg(ws.image()).args(rest).assert().success();
}

fn run_json(ws: &Workspace, sub: &str, rest: &[&str]) -> Value {
    let output = ws
        .cmd()
        .args(["--format", "json", sub])
        .arg(ws.image())
        .args(rest)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn format_reports_geometry() {
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .args(["--format", "json", "format", "--block-size", "1024", "--blocks", "2048"])
        .arg(ws.image())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let info: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(info["superblock"]["block_size"], 1024);
    assert_eq!(info["superblock"]["block_count"], 2048);
    assert!(info["files"].as_array().unwrap().is_empty());
}

#[test]
fn fallocate_then_list_extents() {
    let ws = formatted();
    let ino = create_file(&ws).to_string();

    let allocated = run_json(&ws, "fallocate", &[&ino, "0", "64"]);
    assert_eq!(allocated, 64);

    let extents = run_json(&ws, "extents", &[&ino]);
    let extents = extents.as_array().unwrap();
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0]["logical"], 0);
    assert_eq!(extents[0]["len"], 64);
    assert_eq!(extents[0]["unwritten"], true);

    run(&ws, "convert", &[&ino, "16", "8"]);
    let extents = run_json(&ws, "extents", &[&ino]);
    let states: Vec<bool> = extents
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["unwritten"].as_bool().unwrap())
        .collect();
    assert_eq!(states, vec![true, false, true]);
}

#[test]
fn map_then_lookup_agree() {
    let ws = formatted();
    let ino = create_file(&ws).to_string();

    let created = run_json(&ws, "map", &[&ino, "100", "10", "--mode", "create"]);
    assert_eq!(created["flags"]["new"], true);
    let looked = run_json(&ws, "map", &[&ino, "100", "10"]);
    assert_eq!(looked["physical"], created["physical"]);
    assert_eq!(looked["flags"]["mapped"], true);

    let hole = run_json(&ws, "map", &[&ino, "0", "50"]);
    assert_eq!(hole["flags"]["mapped"], false);
    assert_eq!(hole["len"], 50);
}

#[test]
fn verify_and_dump_a_grown_tree() {
    let ws = formatted();
    let ino = create_file(&ws).to_string();
    for i in 0..12u32 {
        let start = (i * 4).to_string();
        run(&ws, "map", &[&ino, &start, "2", "--mode", "create"]);
    }

    let outcomes = run_json(&ws, "verify", &[]);
    let outcome = &outcomes.as_array().unwrap()[0];
    assert!(outcome["error"].is_null());
    assert_eq!(outcome["report"]["extents"], 12);
    assert_eq!(outcome["report"]["depth"], 1);

    let dump = run_json(&ws, "dump-node", &["--root", &ino]);
    assert_eq!(dump["node"]["depth"], 1);
    assert!(!dump["hex"].as_array().unwrap().is_empty());

    let fiemap = run_json(&ws, "fiemap", &[&ino]);
    let items = fiemap.as_array().unwrap();
    assert_eq!(items.len(), 12);
    assert_eq!(items[11]["flags"]["last"], true);
}

#[test]
fn punch_and_truncate_shrink_the_map() {
    let ws = formatted();
    let ino = create_file(&ws).to_string();
    run(&ws, "map", &[&ino, "0", "40", "--mode", "create"]);
    run(&ws, "punch", &[&ino, "10", "10"]);
    run(&ws, "truncate", &[&ino, "30"]);

    let extents = run_json(&ws, "extents", &[&ino]);
    let spans: Vec<(u64, u64)> = extents
        .as_array()
        .unwrap()
        .iter()
        .map(|e| (e["logical"].as_u64().unwrap(), e["len"].as_u64().unwrap()))
        .collect();
    assert_eq!(spans, vec![(0, 10), (20, 10)]);

    let stats = run_json(&ws, "stats", &[]);
    assert_eq!(stats["files"][0]["tree"]["mapped_blocks"], 20);
}

#[test]
fn missing_image_fails_cleanly() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("info")
        .arg(ws.image())
        .assert()
        .failure()
        .code(1);
}
