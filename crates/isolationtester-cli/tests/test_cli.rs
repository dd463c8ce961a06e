mod common;

use assert_cmd::cargo;
use common::start_integration_test_postgres;

const SINGLE_SESSION_SPEC: &str = r#"
    session "s1"
    step "r1" { SELECT v FROM t WHERE k = 1; }
    step "r2" { UPDATE t SET v = v + 1 WHERE k = 1; }
"#;

/// `-n` never opens a connection, so this needs no database at all.
#[test]
fn dry_run_lists_every_permutation_without_connecting() {
    let mut cmd = cargo::cargo_bin_cmd!("isolationtester");
    let assert = cmd
        .arg("-n")
        .arg("-")
        .write_stdin(SINGLE_SESSION_SPEC)
        .assert()
        .success();
    let output = assert.get_output();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), r#"permutation "r1" "r2""#);
}

/// A real run against a live database: the spec is piped in on stdin, the
/// conninfo is passed as the positional argument, and the transcript lands
/// on stdout exactly as the driver produces it.
#[tokio::test]
async fn runs_a_spec_against_a_live_database() {
    let (_container, dsn) = start_integration_test_postgres().await;

    let mut cmd = cargo::cargo_bin_cmd!("isolationtester");
    let assert = cmd
        .arg("-")
        .arg(&dsn)
        .write_stdin(SINGLE_SESSION_SPEC)
        .assert()
        .success();
    let output = assert.get_output();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("Parsed test spec with 1 sessions"));
    assert!(stdout.contains("starting permutation: r1 r2"));
    assert!(stdout.contains("step r1: SELECT v FROM t WHERE k = 1;"));
    assert!(stdout.contains("step r2: UPDATE t SET v = v + 1 WHERE k = 1;"));
}
