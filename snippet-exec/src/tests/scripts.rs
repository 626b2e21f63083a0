use serde_json::json;
use tokio::sync::mpsc;

use super::fixtures::script_samples::*;
use super::utils::defaults::test_service;
use super::utils::skip_if_not_available;
use crate::service::ScriptParams;
use crate::{OutputLine, Result};

#[tokio::test]
async fn test_hello_script() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({ "action": "execute", "code": HELLO }))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Script executed successfully");
    assert_eq!(response.data["output"], "Hello from Python!\n");
    assert_eq!(response.data["exit_code"], 0);
    Ok(())
}

#[tokio::test]
async fn test_marker_lookalike_output_is_preserved() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({ "action": "execute", "code": MARKER_LOOKALIKE }))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["output"], "[SNIPPET_B64:aGk=] ünïcode\n");
    Ok(())
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({
            "action": "execute",
            "code": SLEEPS_AFTER_OUTPUT,
            "timeout": 1,
        }))
        .await;

    assert!(!response.success);
    assert_eq!(response.message, "Script timed out after 1 seconds");
    assert_eq!(response.data["exit_code"], -1);
    assert_eq!(response.data["timed_out"], true);
    assert!(response.data["output"].as_str().unwrap_or_default().contains("hi"));
    Ok(())
}

#[tokio::test]
async fn test_exit_code_is_reported() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({ "action": "execute", "code": EXITS_WITH_ERROR }))
        .await;

    assert!(!response.success);
    assert_eq!(response.message, "Script failed with exit code 4");
    assert!(response.data["output"].as_str().unwrap_or_default().contains("partial"));
    Ok(())
}

#[tokio::test]
async fn test_env_is_passed_through() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({
            "action": "execute",
            "code": USES_ENV,
            "env": { "SNIPPET_GREETING": "bonjour" },
        }))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["output"], "bonjour\n");
    Ok(())
}

#[tokio::test]
async fn test_output_lines_stream_to_sink() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let service = test_service(scratch.path())?;
    let runner = crate::ScriptRunner::new(service.state().clone());
    let params: ScriptParams = serde_json::from_value(json!({
        "code": "print('one')\nprint('two')\n",
    }))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let response = runner.execute(&params, Some(tx)).await;
    assert!(response.success, "{}", response.message);

    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line.text);
    }
    assert!(lines.iter().any(|l| l.contains("one")));
    assert!(lines.iter().any(|l| l.contains("two")));
    Ok(())
}

#[tokio::test]
async fn test_validate_detects_syntax_errors() -> Result<()> {
    if skip_if_not_available(&["python3"]) {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    let service = test_service(scratch.path())?;

    let broken = service
        .python(json!({ "action": "validate", "code": SYNTAX_ERROR }))
        .await;
    assert!(!broken.success);
    assert_eq!(broken.message, "Syntax errors found");

    let valid = service
        .python(json!({ "action": "validate", "code": HELLO }))
        .await;
    assert!(valid.success, "{}", valid.message);
    Ok(())
}

#[tokio::test]
async fn test_create_writes_script() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let target = scratch.path().join("nested").join("hello.py");
    let response = test_service(scratch.path())?
        .python(json!({
            "action": "create",
            "code": HELLO,
            "script_path": target,
        }))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(std::fs::read_to_string(&target)?, HELLO);
    Ok(())
}

#[tokio::test]
async fn test_install_requires_packages() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let response = test_service(scratch.path())?
        .python(json!({ "action": "install_package" }))
        .await;

    assert!(!response.success);
    assert_eq!(
        response.message,
        "Either packages or requirements_file is required"
    );
    Ok(())
}
