//! Shared runner state and the build-and-load pipeline.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{BuildLease, CacheKey, CompilationCache};
use crate::cleanup::CleanupReport;
use crate::cleanup::CleanupManager;
use crate::compiler::{CompileOutcome, Compiler};
use crate::config::RunnerConfig;
use crate::error::Error;
use crate::module::{CompiledModule, DylibModule};
use crate::script::ScriptExecutor;
use crate::template::{numbered, CompilationUnit, TemplateGenerator};
use crate::types::{BuildArtifact, CompileDiagnostic, FailureStage};

/// A request currently being served.
#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub id: Uuid,
    pub kind: String,
    pub started_at_ms: u64,
}

/// Registry of operations in flight.
#[derive(Debug, Default)]
pub struct ActiveOperations {
    inner: Mutex<HashMap<Uuid, OperationInfo>>,
}

impl ActiveOperations {
    pub fn begin(self: &Arc<Self>, kind: impl Into<String>) -> OperationGuard {
        let info = OperationInfo {
            id: Uuid::new_v4(),
            kind: kind.into(),
            started_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };
        let id = info.id;
        if let Ok(mut ops) = self.inner.lock() {
            ops.insert(id, info);
        }
        OperationGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> Vec<OperationInfo> {
        self.inner
            .lock()
            .map(|ops| ops.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its operation from the registry when dropped.
pub struct OperationGuard {
    id: Uuid,
    registry: Arc<ActiveOperations>,
}

impl OperationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut ops) = self.registry.inner.lock() {
            ops.remove(&self.id);
        }
    }
}

/// A loaded module and where it came from.
pub struct Built {
    pub module: Arc<dyn CompiledModule>,
    pub artifact: BuildArtifact,
    pub key: CacheKey,
    pub cached: bool,
    /// Keeps the build directory alive until [`RunnerState::finish`].
    pub lease: BuildLease,
}

/// A compiled but unloaded unit.
pub struct Checked {
    pub artifact: BuildArtifact,
    pub lease: BuildLease,
}

/// Why a unit could not be turned into a loaded module.
#[derive(Debug, Clone, Serialize)]
pub struct BuildFailure {
    pub stage: FailureStage,
    pub message: String,
    pub diagnostics: Vec<CompileDiagnostic>,
}

impl BuildFailure {
    fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }
}

pub struct RunnerState {
    pub config: RunnerConfig,
    pub cache: CompilationCache,
    pub cleanup: CleanupManager,
    pub compiler: Compiler,
    pub generator: TemplateGenerator,
    pub scripts: ScriptExecutor,
    pub operations: Arc<ActiveOperations>,
    pub permits: Arc<Semaphore>,
}

impl RunnerState {
    pub fn new(config: RunnerConfig) -> Result<Self, Error> {
        config.validate()?;
        let compiler = Compiler::new(config.compiler.clone());
        Ok(Self::with_compiler(config, compiler))
    }

    pub fn with_compiler(config: RunnerConfig, compiler: Compiler) -> Self {
        Self {
            cache: CompilationCache::new(config.builds_dir()),
            cleanup: CleanupManager::new(&config.cleanup),
            generator: TemplateGenerator::new(config.default_imports.clone()),
            scripts: ScriptExecutor::new(config.python.clone(), config.scripts_dir()),
            operations: Arc::new(ActiveOperations::default()),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            compiler,
            config,
        }
    }

    pub fn cache_key(&self, unit: &CompilationUnit) -> CacheKey {
        CacheKey::derive(&unit.text(), &self.compiler.settings_fingerprint())
    }

    /// Compiles `unit` only; diagnostics on success, failure otherwise.
    pub async fn check(
        &self,
        unit: &CompilationUnit,
        timeout: Duration,
    ) -> Result<Checked, BuildFailure> {
        let key = self.cache_key(unit);
        let lease = self.cache.lease(&key).await;
        let artifact = match self.cache.lookup(&key).await {
            Some(artifact) => artifact,
            None => self.compile(unit, &key, timeout).await?,
        };
        Ok(Checked { artifact, lease })
    }

    /// Returns a loaded module for `unit`, reusing a cached build when one
    /// loads cleanly. A cached module that fails to load is discarded and
    /// rebuilt.
    pub async fn build(&self, unit: &CompilationUnit, timeout: Duration) -> Result<Built, BuildFailure> {
        let key = self.cache_key(unit);
        let lease = self.cache.lease(&key).await;

        if let Some(artifact) = self.cache.lookup(&key).await {
            match load(&artifact).await {
                Ok(module) => {
                    info!("Reusing cached module {}", key);
                    return Ok(Built {
                        module,
                        artifact,
                        key,
                        cached: true,
                        lease,
                    });
                }
                Err(e) => {
                    warn!("Cached module {} is unusable: {}", key, e);
                    self.cache.invalidate(&artifact).await;
                }
            }
        }

        let artifact = self.compile(unit, &key, timeout).await?;
        let module = load(&artifact).await.map_err(|e| {
            error!("Failed to load fresh module {}: {}", key, e);
            BuildFailure {
                stage: FailureStage::Load,
                message: e.to_string(),
                diagnostics: artifact.diagnostics.clone(),
            }
        })?;
        Ok(Built {
            module,
            artifact,
            key,
            cached: false,
            lease,
        })
    }

    async fn compile(
        &self,
        unit: &CompilationUnit,
        key: &CacheKey,
        timeout: Duration,
    ) -> Result<BuildArtifact, BuildFailure> {
        let started = Instant::now();
        let prepared = self
            .cache
            .prepare(key, &unit.text())
            .await
            .map_err(|e| BuildFailure::new(FailureStage::Compilation, e.to_string()))?;

        let outcome = self
            .compiler
            .compile(&prepared, timeout)
            .await
            .map_err(|e| BuildFailure::new(FailureStage::Compilation, e.to_string()))?;

        match outcome {
            CompileOutcome::Succeeded(artifact) => {
                if let Err(e) = self.cache.store(&artifact).await {
                    warn!("Failed to record diagnostics for {}: {}", key, e);
                }
                debug!("Built {} in {:?}", key, started.elapsed());
                Ok(artifact)
            }
            CompileOutcome::Failed {
                diagnostics,
                details,
            } => Err(BuildFailure {
                stage: FailureStage::Compilation,
                message: compile_failure_message(unit, &diagnostics, &details),
                diagnostics,
            }),
            CompileOutcome::TimedOut {
                elapsed,
                diagnostics,
            } => Err(BuildFailure {
                stage: FailureStage::CompileTimeout,
                message: format!(
                    "Compilation timed out after {} seconds",
                    elapsed.as_secs()
                ),
                diagnostics,
            }),
        }
    }

    /// Releases `lease` and deletes the build directory unless artifacts
    /// were asked for or another request still holds the same key.
    pub fn finish(
        &self,
        artifact: &BuildArtifact,
        lease: BuildLease,
        keep_artifacts: bool,
    ) -> Option<tokio::task::JoinHandle<CleanupReport>> {
        let key = lease.key().clone();
        drop(lease);
        if keep_artifacts {
            debug!("Keeping artifacts in {}", artifact.build_dir.display());
            return None;
        }
        match self.cache.try_exclusive(&key) {
            Some(exclusive) => Some(self.cleanup.schedule(artifact.build_dir.clone(), exclusive)),
            None => {
                debug!("Build {} still in use, leaving it", key);
                None
            }
        }
    }
}

async fn load(artifact: &BuildArtifact) -> Result<Arc<dyn CompiledModule>, Error> {
    let path = artifact.module_path.clone();
    let module = tokio::task::spawn_blocking(move || DylibModule::load(&path))
        .await
        .map_err(|e| Error::Load(format!("Loader thread failed: {}", e)))??;
    Ok(Arc::new(module))
}

fn compile_failure_message(
    unit: &CompilationUnit,
    diagnostics: &[CompileDiagnostic],
    details: &str,
) -> String {
    let mut message = String::from("Compilation failed:\n");
    let errors: Vec<&CompileDiagnostic> = diagnostics.iter().filter(|d| d.is_error()).collect();
    for diagnostic in &errors {
        message.push_str(&diagnostic.to_string());
        message.push('\n');
    }
    if errors.is_empty() && !details.trim().is_empty() {
        message.push_str(details.trim_end());
        message.push('\n');
    }
    message.push_str("\nGenerated code:\n");
    message.push_str(&numbered(&unit.source));
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_leave_the_registry_on_drop() {
        let registry = Arc::new(ActiveOperations::default());
        let first = registry.begin("code");
        {
            let _second = registry.begin("python");
            assert_eq!(registry.len(), 2);
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].id, first.id());
        drop(first);
        assert!(registry.is_empty());
    }

    #[test]
    fn failure_message_lists_errors_and_code() -> Result<(), Error> {
        let unit = TemplateGenerator::default().generate(
            &crate::types::ExecutionRequest::new("return 1 +;"),
            crate::template::Mode::Run,
        )?;
        let diagnostics = vec![CompileDiagnostic {
            severity: crate::types::Severity::Error,
            message: "expected expression, found `;`".into(),
            line: 12,
            column: 11,
            code: None,
        }];
        let message = compile_failure_message(&unit, &diagnostics, "");
        assert!(message.starts_with("Compilation failed:\nLine 12, Column 11: expected expression"));
        assert!(message.contains("Generated code:\n"));
        assert!(message.contains("return 1 +;"));
        Ok(())
    }

    #[tokio::test]
    async fn shared_build_survives_until_last_request_finishes() -> Result<(), Error> {
        let scratch = tempfile::tempdir()?;
        let state = RunnerState::new(RunnerConfig::default().with_scratch_dir(scratch.path()))?;
        let key = CacheKey::derive("return 7;", "");
        let artifact = state.cache.prepare(&key, "return 7;").await?;
        std::fs::write(&artifact.module_path, b"module")?;

        let first = state.cache.lease(&key).await;
        let second = state.cache.lease(&key).await;

        assert!(state.finish(&artifact, first, false).is_none());
        assert!(artifact.build_dir.exists());

        let cleanup = state
            .finish(&artifact, second, false)
            .expect("last holder schedules cleanup");
        assert!(matches!(
            cleanup.await.unwrap(),
            CleanupReport::Removed { .. }
        ));
        assert!(!artifact.build_dir.exists());
        assert_eq!(state.cache.leased_keys(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn kept_artifacts_are_not_scheduled() -> Result<(), Error> {
        let scratch = tempfile::tempdir()?;
        let state = RunnerState::new(RunnerConfig::default().with_scratch_dir(scratch.path()))?;
        let key = CacheKey::derive("return 8;", "");
        let artifact = state.cache.prepare(&key, "return 8;").await?;
        std::fs::write(&artifact.module_path, b"module")?;

        let lease = state.cache.lease(&key).await;
        assert!(state.finish(&artifact, lease, true).is_none());
        assert!(artifact.module_path.exists());
        Ok(())
    }
}
