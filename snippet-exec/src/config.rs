//! Runner configuration, loaded from TOML with environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::Error;
use crate::types::{duration_ms, duration_serde};

pub const ENV_SCRATCH: &str = "SNIPPET_EXEC_SCRATCH";
pub const ENV_RUSTC: &str = "SNIPPET_EXEC_RUSTC";
pub const ENV_PYTHON: &str = "SNIPPET_EXEC_PYTHON";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root of `builds/` and `scripts/`
    pub scratch_dir: PathBuf,
    /// Requests allowed in flight per runner
    pub max_concurrent: usize,
    /// `use` paths emitted into every wrapped fragment
    pub default_imports: Vec<String>,
    pub compiler: CompilerConfig,
    pub python: PythonConfig,
    pub cleanup: CleanupConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("snippet-exec"),
            max_concurrent: 1,
            default_imports: vec![
                "std::collections::{HashMap, HashSet, BTreeMap}".to_string(),
                "std::fmt".to_string(),
            ],
            compiler: CompilerConfig::default(),
            python: PythonConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternCrate {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub rustc: PathBuf,
    pub edition: String,
    pub opt_level: String,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Bound on waiting for the diagnostic stream to close after exit
    #[serde(with = "duration_ms")]
    pub message_grace: Duration,
    /// Bound on waiting for the module file after a successful exit
    #[serde(with = "duration_ms")]
    pub artifact_wait: Duration,
    pub library_dirs: Vec<PathBuf>,
    pub extern_crates: Vec<ExternCrate>,
    /// Add directories of shared objects mapped into this process
    pub include_loaded_modules: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            rustc: PathBuf::from("rustc"),
            edition: "2021".to_string(),
            opt_level: "0".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            message_grace: Duration::from_secs(2),
            artifact_wait: Duration::from_secs(2),
            library_dirs: Vec::new(),
            extern_crates: Vec::new(),
            include_loaded_modules: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter used when a request names none; `python` means auto-detect
    pub interpreter: String,
    pub known_locations: Vec<PathBuf>,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub drain_grace: Duration,
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub validate_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub install_timeout: Duration,
    pub env: HashMap<String, String>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            known_locations: vec![
                PathBuf::from("/usr/local/bin/python3"),
                PathBuf::from("/usr/bin/python3"),
                PathBuf::from("/opt/homebrew/bin/python3"),
                PathBuf::from("/opt/local/bin/python3"),
            ],
            poll_interval: Duration::from_millis(50),
            drain_grace: Duration::from_millis(200),
            default_timeout: Duration::from_secs(300),
            validate_timeout: Duration::from_secs(10),
            install_timeout: Duration::from_secs(60),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_attempts: u32,
    /// Multiplied by the attempt number between retries
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RunnerConfig {
    /// Read a TOML file; missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults or file contents, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.apply_env())
    }

    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(scratch) = lookup(ENV_SCRATCH).filter(|v| !v.is_empty()) {
            debug!("Scratch directory overridden by {}", ENV_SCRATCH);
            self.scratch_dir = PathBuf::from(scratch);
        }
        if let Some(rustc) = lookup(ENV_RUSTC).filter(|v| !v.is_empty()) {
            self.compiler.rustc = PathBuf::from(rustc);
        }
        if let Some(python) = lookup(ENV_PYTHON).filter(|v| !v.is_empty()) {
            self.python.interpreter = python;
        }
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".to_string()));
        }
        if self.cleanup.max_attempts == 0 {
            return Err(Error::Config(
                "cleanup.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.compiler.poll_interval.is_zero() || self.python.poll_interval.is_zero() {
            return Err(Error::Config("poll intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_rustc(mut self, rustc: impl Into<PathBuf>) -> Self {
        self.compiler.rustc = rustc.into();
        self
    }

    pub fn with_python(mut self, interpreter: impl Into<String>) -> Self {
        self.python.interpreter = interpreter.into();
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compiler.timeout = timeout;
        self
    }

    pub fn with_extern_crate(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.compiler.extern_crates.push(ExternCrate {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.scratch_dir.join("builds")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scratch_dir.join("scripts")
    }
}
