//! Python scripts run in a separate interpreter process.

pub mod encoding;
pub mod interpreter;
pub mod packages;
pub mod process;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::write_atomic;
use crate::config::PythonConfig;
use crate::error::Error;
use crate::types::{EnvVars, ScriptResult};

pub use packages::Packages;
pub use process::{OutputLine, OutputSink, Stream};

const SCRIPT_STEM: &str = "snippet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    Path(PathBuf),
}

/// Per-run choices layered over [`PythonConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub interpreter: Option<String>,
    pub virtual_env: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: EnvVars,
}

#[derive(Debug)]
pub struct ScriptRun {
    pub result: ScriptResult,
    pub interpreter: PathBuf,
    /// Temporary file holding inline source, for later cleanup
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    config: PythonConfig,
    scripts_dir: PathBuf,
}

impl ScriptExecutor {
    pub fn new(config: PythonConfig, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn config(&self) -> &PythonConfig {
        &self.config
    }

    pub fn interpreter(&self, options: &RunOptions) -> Result<PathBuf, Error> {
        interpreter::resolve(
            options.interpreter.as_deref(),
            options.virtual_env.as_deref(),
            &self.config,
        )
    }

    /// Writes inline source, with the encoding preamble, to a fresh file.
    pub async fn write_inline(&self, code: &str) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.scripts_dir).await?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let random = Uuid::new_v4().simple().to_string();
        let path = self
            .scripts_dir
            .join(format!("{}_{}_{}.py", SCRIPT_STEM, millis, &random[..8]));
        write_atomic(&path, encoding::with_preamble(code).as_bytes()).await?;
        debug!("Wrote inline script to {}", path.display());
        Ok(path)
    }

    pub async fn run(
        &self,
        source: ScriptSource,
        options: RunOptions,
        sink: Option<OutputSink>,
    ) -> Result<ScriptRun, Error> {
        let interpreter = self.interpreter(&options)?;
        let (script, temporary) = match source {
            ScriptSource::Inline(code) => {
                if code.trim().is_empty() {
                    return Err(Error::Process("Script is empty".to_string()));
                }
                let path = self.write_inline(&code).await?;
                (path.clone(), Some(path))
            }
            ScriptSource::Path(path) => {
                if !path.is_file() {
                    return Err(Error::Process(format!(
                        "Script not found: {}",
                        path.display()
                    )));
                }
                (path, None)
            }
        };

        let mut env = self.config.env.clone();
        env.extend(options.env);
        let spec = process::ProcessSpec::new(
            &interpreter,
            options.timeout.unwrap_or(self.config.default_timeout),
        )
        .arg("-u")
        .arg(&script)
        .working_dir(options.working_dir.or_else(|| script.parent().map(Path::to_path_buf)))
        .envs(&env)
        .polling(self.config.poll_interval, self.config.drain_grace);

        let result = match process::run(spec, sink).await {
            Ok(result) => result,
            Err(e) => {
                discard(temporary.as_deref()).await;
                return Err(e);
            }
        };
        Ok(ScriptRun {
            result,
            interpreter,
            script_path: temporary,
        })
    }

    pub async fn validate(&self, source: ScriptSource, options: &RunOptions) -> Result<ScriptRun, Error> {
        let interpreter = self.interpreter(options)?;
        let (script, temporary) = match source {
            ScriptSource::Inline(code) => {
                let path = self.write_inline(&code).await?;
                (path.clone(), Some(path))
            }
            ScriptSource::Path(path) => (path, None),
        };
        let result = match packages::validate(&interpreter, &script, &self.config).await {
            Ok(result) => result,
            Err(e) => {
                discard(temporary.as_deref()).await;
                return Err(e);
            }
        };
        Ok(ScriptRun {
            result,
            interpreter,
            script_path: temporary,
        })
    }

    pub async fn install(
        &self,
        packages: &Packages,
        options: &RunOptions,
    ) -> Result<ScriptResult, Error> {
        let interpreter = self.interpreter(options)?;
        packages::install(&interpreter, packages, options.timeout, &self.config).await
    }
}

/// Removes an inline script whose run never produced a result.
async fn discard(temporary: Option<&Path>) {
    let Some(path) = temporary else {
        return;
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed unused script {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
