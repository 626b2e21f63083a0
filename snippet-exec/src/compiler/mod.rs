//! Drives rustc over a prepared build directory.

pub mod diagnostics;
pub mod references;

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::module_file_name;
use crate::config::CompilerConfig;
use crate::error::Error;
use crate::poll::{drive, ChildExit, Driven, FileReady};
use crate::types::{BuildArtifact, CompileDiagnostic};

pub use references::References;

const CRATE_TYPE: &str = "cdylib";
const CRATE_NAME: &str = "snippet";

#[derive(Debug)]
pub enum CompileOutcome {
    Succeeded(BuildArtifact),
    Failed {
        diagnostics: Vec<CompileDiagnostic>,
        details: String,
    },
    TimedOut {
        elapsed: Duration,
        diagnostics: Vec<CompileDiagnostic>,
    },
}

#[derive(Debug, Clone)]
pub struct Compiler {
    config: CompilerConfig,
    references: References,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        let references = References::collect(&config);
        debug!(
            "Compiler references: {} library dirs, {} extern crates",
            references.library_dirs.len(),
            references.extern_crates.len()
        );
        Self { config, references }
    }

    pub fn with_references(config: CompilerConfig, references: References) -> Self {
        Self { config, references }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Settings that change the produced module, folded into cache keys.
    pub fn settings_fingerprint(&self) -> String {
        format!(
            "crate-type={};edition={};opt-level={};{}",
            CRATE_TYPE,
            self.config.edition,
            self.config.opt_level,
            self.references.fingerprint()
        )
    }

    /// Compiles `artifact.source_path` into `artifact.module_path`.
    ///
    /// The module is written under a unique temporary name and renamed into
    /// place, so concurrent builds of the same key never interleave writes.
    pub async fn compile(
        &self,
        artifact: &BuildArtifact,
        timeout: Duration,
    ) -> Result<CompileOutcome, Error> {
        let start = Instant::now();
        let tmp_output = artifact.build_dir.join(format!(
            ".{}.{}.tmp",
            module_file_name(),
            Uuid::new_v4().simple()
        ));

        let mut command = Command::new(&self.config.rustc);
        command
            .arg("--crate-type")
            .arg(CRATE_TYPE)
            .arg("--crate-name")
            .arg(CRATE_NAME)
            .arg("--edition")
            .arg(&self.config.edition)
            .arg("--error-format")
            .arg("json")
            .arg("-C")
            .arg(format!("opt-level={}", self.config.opt_level))
            .args(self.references.args())
            .arg("-o")
            .arg(&tmp_output)
            .arg(&artifact.source_path)
            .current_dir(&artifact.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {:?}", command.as_std());
        let mut child = command.spawn().map_err(|e| {
            Error::Compilation(format!(
                "Failed to start {}: {}",
                self.config.rustc.display(),
                e
            ))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Compilation("Compiler stderr was not captured".to_string()))?;
        let reader = diagnostics::spawn_reader(stderr, tx);
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = stdout.read_to_end(&mut sink).await;
            });
        }

        let driven = drive(
            &mut ChildExit::new(&mut child),
            self.config.poll_interval,
            timeout,
        )
        .await?;

        let status = match driven {
            Driven::Done(status) => status,
            Driven::Expired(elapsed) => {
                warn!("Compilation timed out after {:?}, killing rustc", elapsed);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill rustc: {}", e);
                }
                reader.abort();
                let mut collected = Vec::new();
                while let Ok(diagnostic) = rx.try_recv() {
                    collected.push(diagnostic);
                }
                remove_quietly(&tmp_output).await;
                return Ok(CompileOutcome::TimedOut {
                    elapsed,
                    diagnostics: collected,
                });
            }
        };

        let raw_stderr = match tokio::time::timeout(self.config.message_grace, reader).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Diagnostic reader failed: {}", e);
                String::new()
            }
            Err(_) => {
                warn!(
                    "Diagnostic stream still open {:?} after rustc exited",
                    self.config.message_grace
                );
                String::new()
            }
        };
        let mut collected = Vec::new();
        while let Ok(diagnostic) = rx.try_recv() {
            collected.push(diagnostic);
        }

        let has_errors = collected.iter().any(CompileDiagnostic::is_error);
        if !status.success() || has_errors {
            remove_quietly(&tmp_output).await;
            let details = if collected.is_empty() {
                diagnostics::fallback_details(&artifact.build_dir, &raw_stderr).await
            } else {
                raw_stderr.trim().to_string()
            };
            error!(
                "Compilation failed ({}) with {} diagnostics",
                status,
                collected.len()
            );
            return Ok(CompileOutcome::Failed {
                diagnostics: collected,
                details,
            });
        }

        let ready = drive(
            &mut FileReady::new(&tmp_output),
            self.config.poll_interval,
            self.config.artifact_wait,
        )
        .await?;
        if let Driven::Expired(_) = ready {
            remove_quietly(&tmp_output).await;
            let details = format!(
                "Compiled module missing or empty after successful exit\n{}",
                diagnostics::fallback_details(&artifact.build_dir, &raw_stderr).await
            );
            return Ok(CompileOutcome::Failed {
                diagnostics: collected,
                details,
            });
        }

        tokio::fs::rename(&tmp_output, &artifact.module_path).await?;
        info!(
            "Compiled {} in {:?} ({} warnings)",
            artifact.build_dir.display(),
            start.elapsed(),
            collected.len()
        );

        let mut built = artifact.clone();
        built.diagnostics = collected;
        Ok(CompileOutcome::Succeeded(built))
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
