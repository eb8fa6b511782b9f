//! CLI Integration Tests
//!
//! These tests run the `meshsync` binary end-to-end against a temporary data
//! directory. Each invocation reopens the database, so they also cover
//! persistence between runs.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("meshsync").expect("Failed to find meshsync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract a record ID from CLI output (format: "  ID: <id>")
fn extract_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("  ID: "))
        .map(|id| id.trim().to_string())
}

fn extract_did(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("DID: "))
        .map(|did| did.trim().to_string())
}

fn add_listing(data_dir: &TempDir, title: &str) -> String {
    let output = cli_cmd(data_dir)
        .args(["listing", "add", title, "--category", "tools"])
        .output()
        .expect("Failed to run listing add");
    assert!(output.status.success());
    extract_id(&String::from_utf8_lossy(&output.stdout)).expect("listing id in output")
}

// ============================================================================
// Info / Config
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("meshsync v"))
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("DID: did:mesh:"))
        .stdout(predicate::str::contains("Listings: 0"));
}

#[test]
fn test_identity_persists_between_runs() {
    let data_dir = TempDir::new().unwrap();

    let first = cli_cmd(&data_dir).arg("info").output().unwrap();
    let second = cli_cmd(&data_dir).arg("info").output().unwrap();

    let first = extract_did(&String::from_utf8_lossy(&first.stdout)).unwrap();
    let second = extract_did(&String::from_utf8_lossy(&second.stdout)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_info_shows_data_directory() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            data_dir.path().to_string_lossy().to_string(),
        ));
}

#[test]
fn test_config_file_is_read_from_data_dir() {
    let data_dir = TempDir::new().unwrap();
    std::fs::write(
        data_dir.path().join("meshsync.toml"),
        "[node]\ndisplay_name = \"river-camp\"\n\n[bundles]\nmax_hops = 3\n",
    )
    .unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("display_name = \"river-camp\""))
        .stdout(predicate::str::contains("max_hops = 3"));
}

#[test]
fn test_invalid_config_fails() {
    let data_dir = TempDir::new().unwrap();
    std::fs::write(
        data_dir.path().join("meshsync.toml"),
        "[bundles]\nmax_hops = 0\n",
    )
    .unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_hops"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--config", "/nonexistent/meshsync.toml", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

// ============================================================================
// Listings
// ============================================================================

#[test]
fn test_listing_add_and_list() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args([
            "listing",
            "add",
            "Grain mill",
            "--category",
            "tools",
            "--location",
            "blue barn",
            "--tag",
            "kitchen",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added listing: Grain mill"))
        .stdout(predicate::str::contains("ID: "));

    cli_cmd(&data_dir)
        .args(["listing", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Listings (1):"))
        .stdout(predicate::str::contains("Grain mill [tools]"))
        .stdout(predicate::str::contains("Location: blue barn"))
        .stdout(predicate::str::contains("Tags: kitchen"));
}

#[test]
fn test_listing_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["listing", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No listings found."));
}

#[test]
fn test_set_available_hides_listing() {
    let data_dir = TempDir::new().unwrap();
    let id = add_listing(&data_dir, "Ladder");

    cli_cmd(&data_dir)
        .args(["listing", "set-available", &id, "false"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ladder is now unavailable"));

    cli_cmd(&data_dir)
        .args(["listing", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No listings found."));

    cli_cmd(&data_dir)
        .args(["listing", "list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ladder"));
}

#[test]
fn test_listing_comment_and_remove() {
    let data_dir = TempDir::new().unwrap();
    let id = add_listing(&data_dir, "Canoe");

    cli_cmd(&data_dir)
        .args(["listing", "comment", &id, "Can I borrow it Saturday?"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["listing", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Comments: 1"));

    cli_cmd(&data_dir)
        .args(["listing", "remove", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed listing: Canoe"));

    cli_cmd(&data_dir)
        .args(["listing", "list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No listings found."));
}

#[test]
fn test_unknown_listing_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["listing", "set-available", "1.0@nobody", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// ============================================================================
// Profile
// ============================================================================

#[test]
fn test_profile_set_and_show() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["profile", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No profile set"));

    cli_cmd(&data_dir)
        .args(["profile", "set", "--name", "Ada", "--contact", "ham 147.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Profile updated: Ada"));

    cli_cmd(&data_dir)
        .args(["profile", "set", "--bio", "Fixes bikes"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["profile", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: Ada"))
        .stdout(predicate::str::contains("Bio: Fixes bikes"))
        .stdout(predicate::str::contains("Contact: ham 147.5"));
}

#[test]
fn test_profile_requires_name() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["profile", "set", "--bio", "no name yet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--name"));
}

// ============================================================================
// Peers / Bundles
// ============================================================================

#[test]
fn test_peers_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No peers met yet."));
}

#[test]
fn test_verify_unknown_peer_fails() {
    let data_dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();

    let output = cli_cmd(&other).arg("info").output().unwrap();
    let did = extract_did(&String::from_utf8_lossy(&output.stdout)).unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "verify", &did])
        .assert()
        .failure();
}

#[test]
fn test_forget_with_invalid_did_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "forget", "not-a-did"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid peer id"));
}

#[test]
fn test_bundle_store_starts_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["bundles", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No bundles stored."));

    cli_cmd(&data_dir)
        .args(["bundles", "expire"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Expired 0 bundle(s)."));
}

// ============================================================================
// Help
// ============================================================================

#[test]
fn test_help() {
    Command::cargo_bin("meshsync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("listing"))
        .stdout(predicate::str::contains("serve"));
}
