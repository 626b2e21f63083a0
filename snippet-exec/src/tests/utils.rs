use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use which::which;

/// True (after printing why) when any of `tools` is missing from `PATH`.
pub fn skip_if_not_available(tools: &[&str]) -> bool {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| which(tool).is_err())
        .collect();
    if missing.is_empty() {
        return false;
    }
    eprintln!("Skipping test: {} not available", missing.join(", "));
    true
}

/// Writes an executable stand-in for rustc that records its pid next to
/// itself and then sleeps. Returns the program and the pid file.
pub fn hanging_compiler(dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    let program = dir.join("hanging-rustc");
    let pid_file = dir.join("hanging-rustc.pid");
    let script = format!(
        "#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n",
        pid_file.display()
    );
    std::fs::write(&program, script)?;
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;
    Ok((program, pid_file))
}

/// Whether the process recorded in `pid_file` is still alive.
pub fn recorded_process_alive(pid_file: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(pid_file) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<i32>() else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

pub mod defaults {
    use crate::{Result, SnippetService};
    use crate::config::RunnerConfig;
    use std::path::Path;
    use tokio::time::Duration;

    pub fn test_config(scratch: &Path) -> RunnerConfig {
        RunnerConfig::default()
            .with_scratch_dir(scratch)
            .with_max_concurrent(1)
    }

    pub fn test_service(scratch: &Path) -> Result<SnippetService> {
        SnippetService::new(test_config(scratch))
    }

    pub fn compile_timeout() -> Duration {
        Duration::from_secs(120)
    }

    /// Polls until `path` is gone or `limit` elapses.
    pub async fn wait_until_removed(path: &Path, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        !path.exists()
    }
}
