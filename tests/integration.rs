//! Integration tests for the blocksync binary.
//!
//! Commands that touch the firewall require root and are marked #[ignore].
//! Run with: `sudo cargo test --release -- --ignored`

use std::path::{Path, PathBuf};
use std::process::Command;

/// Helper to get the path to the compiled binary
fn get_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_blocksync"))
}

/// Check if running as root
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run blocksync with a config file and return output
fn run_blocksync(config: &Path, args: &[&str]) -> std::process::Output {
    Command::new(get_binary_path())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("Failed to execute blocksync")
}

/// Write a config whose store lives in `dir` and whose feeds are all off
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.yaml");
    let yaml = format!(
        "authority:\n  database_path: {}\n  feeds: []\nagent:\n  authority_url: http://127.0.0.1:1\n  request_timeout: 1s\n  lock_file: {}\n",
        dir.join("lists.db").display(),
        dir.join("blocksync.lock").display()
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_version_command() {
    let output = Command::new(get_binary_path()).arg("version").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).starts_with("blocksync "));
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(get_binary_path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["serve", "agent", "sync", "import", "export"] {
        assert!(text.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_import_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = run_blocksync(&config, &["import", "blacklist", "10.0.0.0/30", "bogus", "--source", "cli-test"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Added 2 IPs to blacklist"));

    let output = run_blocksync(&config, &["import", "whitelist", "10.0.0.1"]);
    assert!(output.status.success());

    let output = run_blocksync(&config, &["export", "blacklist", "--format", "csv"]);
    assert!(output.status.success());
    let csv = stdout(&output);
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows[0], "ip,source,added_at,reason,comment");
    assert_eq!(rows.len(), 2);
    assert!(rows[1].starts_with("10.0.0.2,cli-test,"));

    let output = run_blocksync(&config, &["export", "rules", "--dialect", "nftables"]);
    assert!(output.status.success());
    assert_eq!(
        stdout(&output).trim(),
        "nft add element inet blocksync blocklist { 10.0.0.2/32 } # cli-test"
    );
}

#[test]
fn test_import_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let list = dir.path().join("ips.txt");
    std::fs::write(&list, "# comment\n192.0.2.1\n192.0.2.2, ssh\n").unwrap();

    let output = run_blocksync(&config, &["import", "blacklist", "--file", list.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Added 2 IPs"));
}

#[test]
fn test_import_all_invalid_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = run_blocksync(&config, &["import", "blacklist", "nope", "also-nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No valid IPs"));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.yaml");
    std::fs::write(&config, "agent:\n  sync_interval: soon\n").unwrap();
    let output = run_blocksync(&config, &["export", "whitelist"]);
    assert!(!output.status.success());
}

#[test]
fn test_dry_run_with_unreachable_authority_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = run_blocksync(&config, &["sync", "--dry-run"]);
    assert!(!output.status.success());
}

#[test]
fn test_init_writes_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("etc").join("config.yaml");

    let output = run_blocksync(&config, &["init"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let loaded = blocksync::config::Config::load(&config).unwrap();
    assert_eq!(loaded, blocksync::config::Config::default());

    // A second init must not clobber the file
    let output = run_blocksync(&config, &["init"]);
    assert!(!output.status.success());
    let output = run_blocksync(&config, &["init", "--force"]);
    assert!(output.status.success());
}

#[test]
fn test_invalid_command() {
    let output = Command::new(get_binary_path()).arg("frobnicate").output().unwrap();
    assert!(!output.status.success());
}

/// Two agents must not reconcile the same host at once
#[test]
#[ignore] // Requires root
fn test_concurrent_agent_lock() {
    if !is_root() {
        eprintln!("Skipping test_concurrent_agent_lock: requires root");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let _held = blocksync::lock::LockGuard::acquire(dir.path().join("blocksync.lock")).unwrap();

    let output = run_blocksync(&config, &["sync"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already running"));
}
