//! CLI integration tests for mssql-bulk-load.
//!
//! These tests verify argument parsing, help output, offline validation,
//! and exit codes for error conditions that need no server.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the mssql-bulk-load binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-bulk-load").unwrap()
}

fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const CODES_SCHEMA: &str = r#"
table: dbo.codes
columns:
  - ordinal: 1
    name: id
    type: int
    is_nullable: false
  - ordinal: 2
    name: code
    type: varchar
    max_length: 2
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("load"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_load_subcommand_help() {
    cmd()
        .args(["load", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--csv"))
        .stdout(predicate::str::contains("--table"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--option"))
        .stdout(predicate::str::contains("--no-header"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-bulk-load"));
}

#[test]
fn test_missing_subcommand_fails() {
    cmd().assert().failure();
}

#[test]
fn test_load_requires_table() {
    cmd()
        .args(["load", "--csv", "data.csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--table"));
}

// =============================================================================
// Offline Validation Tests
// =============================================================================

#[test]
fn test_validate_accepts_matching_file() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "id,code\n1,ok\n2,no\n3,\n");

    cmd()
        .args(["validate", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Validated 3 rows for dbo.codes"));
}

#[test]
fn test_validate_json_output() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "id,code\n1,ok\n");

    cmd()
        .arg("--output-json")
        .args(["validate", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rows\": 1"))
        .stdout(predicate::str::contains("\"table\": \"dbo.codes\""));
}

#[test]
fn test_validate_reports_oversized_value() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "id,code\n1,ok\n2,aaa\n");

    cmd()
        .args(["validate", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("value too large for destination varchar(2)"))
        .stderr(predicate::str::contains("[code]"));
}

#[test]
fn test_validate_reports_null_in_not_null_column() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "id,code\n,ok\n");

    cmd()
        .args(["validate", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("null value not allowed"));
}

#[test]
fn test_validate_positional_with_custom_delimiter() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "1;ab\n2;cd\n");

    cmd()
        .args(["validate", "--no-header", "--delimiter", ";", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Validated 2 rows"));
}

#[test]
fn test_validate_unknown_header_column() {
    let schema = temp_file(".yaml", CODES_SCHEMA);
    let csv = temp_file(".csv", "id,colour\n1,red\n");

    cmd()
        .args(["validate", "--schema"])
        .arg(schema.path())
        .arg("--csv")
        .arg(csv.path())
        .assert()
        .code(5)
        .stderr(predicate::str::contains("colour"));
}

#[test]
fn test_validate_missing_csv_is_io_error() {
    let schema = temp_file(".yaml", CODES_SCHEMA);

    cmd()
        .args(["validate", "--schema"])
        .arg(schema.path())
        .args(["--csv", "/nonexistent/data.csv"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("IO error"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_check_missing_config() {
    cmd()
        .args(["--config", "/nonexistent/config.yaml", "check"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_check_invalid_yaml() {
    let config = temp_file(".yaml", "connection: [not, a, map\n");

    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("YAML error"));
}

#[test]
fn test_check_rejects_port_zero() {
    let config = temp_file(".yaml", "connection:\n  host: db.example.com\n  port: 0\n");

    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("connection.port"));
}

#[test]
fn test_check_incompatible_failover_options() {
    let config = temp_file(
        ".yaml",
        "connection:\n  host: db.example.com\n  failover_partner: mirror.example.com\n  multi_subnet_failover: true\n",
    );

    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("check")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("multiSubnetFailover"));
}

#[test]
fn test_load_unknown_option_name() {
    let config = temp_file(".yaml", "connection:\n  host: db.example.com\n");
    let csv = temp_file(".csv", "id\n1\n");

    cmd()
        .arg("--config")
        .arg(config.path())
        .args(["load", "--table", "dbo.codes", "--option", "turbo", "--csv"])
        .arg(csv.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown bulk copy option 'turbo'"))
        .stderr(predicate::str::contains("tableLock"));
}

#[test]
fn test_unknown_verbosity_is_config_error() {
    cmd()
        .args(["--verbosity", "chatty", "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown verbosity"));
}
