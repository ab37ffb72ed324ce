#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_dump(dir: &TempDir) -> PathBuf {
    let dump = json!({
        "kind": "extent",
        "devices": [{
            "first_bucket": 1,
            "nbuckets": 64,
            "buckets": [{ "bucket": 3, "gen": 5 }]
        }],
        "runs": [
            [
                { "inode": 0, "offset": 64, "size": 64, "ptrs": [{ "dev": 0, "offset": 2048, "gen": 0 }] },
                { "inode": 0, "offset": 128, "size": 64, "ptrs": [{ "dev": 0, "offset": 2112, "gen": 0 }] }
            ],
            [
                { "inode": 0, "offset": 300, "size": 20, "ptrs": [{ "dev": 0, "offset": 3072, "gen": 0 }] }
            ]
        ]
    });
    let path = dir.path().join("node.json");
    fs::write(&path, serde_json::to_vec_pretty(&dump).unwrap()).unwrap();
    path
}

fn run_json(args: &[&str], dump: &PathBuf) -> Value {
    let output = cargo_bin_cmd!("cachekeys-inspect")
        .args(["--format", "json"])
        .args(args)
        .arg(dump)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn merge_reports_the_merged_stream() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let json = run_json(&["merge"], &dump);
    assert_eq!(json["kind"], "extent");
    assert_eq!(json["runs"], 2);
    // header, end offset and one pointer word per key
    assert_eq!(json["encoded_words"], 9);
    assert_eq!(json["keys"].as_array().map(Vec::len), Some(3));
}

#[test]
fn pointer_offsets_beyond_the_encoding_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let dump = dir.path().join("wide.json");
    let body = json!({
        "kind": "extent",
        "devices": [{ "first_bucket": 1, "nbuckets": 64 }],
        "runs": [[
            { "inode": 0, "offset": 64, "size": 64, "ptrs": [{ "dev": 0, "offset": u64::MAX - 8, "gen": 0 }] },
            { "inode": 0, "offset": 128, "size": 64, "ptrs": [{ "dev": 0, "offset": u64::MAX, "gen": 0 }] }
        ]]
    });
    fs::write(&dump, serde_json::to_vec(&body).unwrap()).unwrap();
    let output = cargo_bin_cmd!("cachekeys-inspect")
        .arg("resort")
        .arg(&dump)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("run 0 key 0"), "stderr: {stderr}");
    assert!(stderr.contains("pointer offset exceeds 43 bits"), "stderr: {stderr}");
}

#[test]
fn overlapping_keys_in_one_dumped_run_merge_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    let dump = dir.path().join("overlap.json");
    let body = json!({
        "kind": "extent",
        "devices": [{ "first_bucket": 1, "nbuckets": 64 }],
        "runs": [
            [{ "inode": 0, "offset": 100, "size": 100, "ptrs": [{ "dev": 0, "offset": 2048, "gen": 0 }] }],
            [
                { "inode": 0, "offset": 20, "size": 10, "ptrs": [{ "dev": 0, "offset": 4096, "gen": 0 }] },
                { "inode": 0, "offset": 30, "size": 20, "ptrs": [{ "dev": 0, "offset": 5120, "gen": 0 }] }
            ]
        ]
    });
    fs::write(&dump, serde_json::to_vec(&body).unwrap()).unwrap();
    let json = run_json(&["merge"], &dump);
    let spans: Vec<(u64, u64)> = json["keys"]
        .as_array()
        .expect("keys array")
        .iter()
        .map(|k| (k["offset"].as_u64().unwrap(), k["size"].as_u64().unwrap()))
        .collect();
    assert_eq!(spans, vec![(10, 10), (30, 20), (100, 70)]);
}

#[test]
fn resort_drops_stale_dirty_data_and_coalesces() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let json = run_json(&["resort"], &dump);
    assert_eq!(json["summary"]["keys_in"], 3);
    assert_eq!(json["summary"]["filtered"], 1);
    assert_eq!(json["summary"]["coalesced"], 1);
    assert_eq!(json["summary"]["keys_out"], 1);
    assert_eq!(json["keys"][0]["offset"], 128);
    assert_eq!(json["keys"][0]["size"], 128);
    assert_eq!(json["stats"]["bad_keys"], 1);
}

#[test]
fn resort_honours_the_options_file() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let config = dir.path().join("cachekeys.toml");
    fs::write(&config, "key_merging_disabled = true\n").unwrap();

    let config_arg = config.to_str().unwrap();
    let json = run_json(&["--config", config_arg, "resort", "--filter", "keep-all"], &dump);
    assert_eq!(json["summary"]["filtered"], 0);
    assert_eq!(json["summary"]["coalesced"], 0);
    assert_eq!(json["summary"]["keys_out"], 3);
}

#[test]
fn check_classifies_every_key() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let json = run_json(&["check"], &dump);
    let keys = json["keys"].as_array().expect("keys array");
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[0]["bad"], false);
    assert_eq!(keys[2]["run"], 1);
    assert_eq!(keys[2]["status"], "stale");
    assert_eq!(keys[2]["invalid"], false);
    assert_eq!(keys[2]["bad"], true);
}

#[test]
fn text_output_lists_sections() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let output = cargo_bin_cmd!("cachekeys-inspect")
        .arg("check")
        .arg(&dump)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Check"));
    assert!(text.contains("(stale)"));
    assert!(text.contains("Bad Keys"));
}

#[test]
fn malformed_dump_fails() {
    let dir = TempDir::new().expect("tempdir");
    let dump = dir.path().join("broken.json");
    fs::write(&dump, "{\"kind\": \"extent\"").unwrap();
    let output = cargo_bin_cmd!("cachekeys-inspect")
        .arg("merge")
        .arg(&dump)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("failed to parse dump"), "stderr: {stderr}");
}

#[test]
fn unknown_option_in_config_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let dump = write_dump(&dir);
    let config = dir.path().join("cachekeys.toml");
    fs::write(&config, "bucket_sise = 512\n").unwrap();
    cargo_bin_cmd!("cachekeys-inspect")
        .arg("--config")
        .arg(&config)
        .arg("merge")
        .arg(&dump)
        .assert()
        .failure();
}
