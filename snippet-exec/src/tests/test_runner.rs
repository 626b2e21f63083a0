use serde_json::json;

use super::fixtures::test_samples::*;
use super::utils::defaults::{compile_timeout, test_service};
use super::utils::skip_if_not_available;
use crate::Result;

fn run_tests(code: &str) -> serde_json::Value {
    json!({
        "action": "execute",
        "code": code,
        "timeout": compile_timeout().as_secs(),
    })
}

#[tokio::test]
async fn test_pass_signal_counts_as_pass() -> Result<()> {
    if skip_if_not_available(&["rustc"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?.tests(run_tests(PASS_SIGNAL)).await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["total"], 1);
    assert_eq!(response.data["outcomes"][0]["outcome"], "pass");
    assert_eq!(response.data["outcomes"][0]["name"], "snippet::Snippet::signals_pass");
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_runs_setup_and_teardown() -> Result<()> {
    if skip_if_not_available(&["rustc"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?.tests(run_tests(LIFECYCLE)).await;

    assert!(!response.success);
    assert_eq!(response.message, "2 of 3 tests passed, 1 failed");
    assert_eq!(response.data["total"], 3);
    assert_eq!(response.data["passed"], 2);
    assert_eq!(response.data["failed"], 1);

    let outcomes = response.data["outcomes"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let adds = &outcomes[0];
    assert_eq!(adds["outcome"], "pass");
    let output = adds["output"].as_str().unwrap_or_default();
    assert!(output.contains("setup"));
    assert!(output.contains("teardown"));

    let fails = &outcomes[1];
    assert_eq!(fails["outcome"], "fail");
    assert!(fails["message"]
        .as_str()
        .unwrap_or_default()
        .contains("arithmetic is broken"));

    let skipped = &outcomes[2];
    assert_eq!(skipped["outcome"], "ignored");
    assert_eq!(skipped["message"], "Ignored");
    Ok(())
}

#[tokio::test]
async fn test_plain_assertion_fragment() -> Result<()> {
    if skip_if_not_available(&["rustc"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .tests(run_tests(PLAIN_ASSERTION))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["passed"], 1);
    Ok(())
}

#[tokio::test]
async fn test_fixture_without_tests_is_rejected() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .tests(run_tests("    pub fn helper() -> i32 {\n        1\n    }\n"))
        .await;

    assert!(!response.success);
    assert!(response.message.starts_with("No test methods found"));
    Ok(())
}

#[tokio::test]
async fn test_private_test_methods_name_the_pub_requirement() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .tests(run_tests("    #[test]\n    fn adds() {\n        assert_eq!(1 + 1, 2);\n    }\n"))
        .await;

    assert!(!response.success);
    assert!(
        response.message.contains("`pub fn`"),
        "{}",
        response.message
    );
    assert_eq!(response.data["total"], 0);
    Ok(())
}
