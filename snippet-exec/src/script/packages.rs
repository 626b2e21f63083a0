//! Syntax checks, package installs and script creation.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::process::{self, ProcessSpec};
use crate::config::PythonConfig;
use crate::error::Error;
use crate::types::ScriptResult;

pub const DEFAULT_SCRIPT_NAME: &str = "script.py";
const CREATE_DIR: &str = "Python";

/// What to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packages {
    Named(Vec<String>),
    Requirements(PathBuf),
}

impl Packages {
    /// Reads a package list given as a JSON array or a comma-separated string.
    pub fn from_value(value: &Value) -> Vec<String> {
        let names: Vec<String> = match value {
            Value::String(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.trim().to_string()))
                .collect(),
            _ => Vec::new(),
        };
        names.into_iter().filter(|n| !n.is_empty()).collect()
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        match self {
            Packages::Named(names) => args.extend(names.iter().cloned()),
            Packages::Requirements(path) => {
                args.push("-r".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }
        args
    }
}

/// Compiles a script with `py_compile` without running it.
pub async fn validate(
    interpreter: &Path,
    script: &Path,
    config: &PythonConfig,
) -> Result<ScriptResult, Error> {
    let spec = ProcessSpec::new(interpreter, config.validate_timeout)
        .args(["-m", "py_compile"])
        .arg(script)
        .envs(&config.env)
        .polling(config.poll_interval, config.drain_grace);
    process::run(spec, None).await
}

pub async fn install(
    interpreter: &Path,
    packages: &Packages,
    timeout: Option<Duration>,
    config: &PythonConfig,
) -> Result<ScriptResult, Error> {
    if let Packages::Named(names) = packages {
        if names.is_empty() {
            return Err(Error::Process("No packages to install".to_string()));
        }
    }
    if let Packages::Requirements(path) = packages {
        if !path.is_file() {
            return Err(Error::Process(format!(
                "Requirements file not found: {}",
                path.display()
            )));
        }
    }

    info!("Installing {:?}", packages);
    let spec = ProcessSpec::new(interpreter, timeout.unwrap_or(config.install_timeout))
        .args(packages.args())
        .envs(&config.env)
        .polling(config.poll_interval, config.drain_grace);
    process::run(spec, None).await
}

/// Where `create` writes when no path is given.
pub fn default_script_path(name: Option<&str>) -> Result<PathBuf, Error> {
    let name = name.map(str::trim).filter(|n| !n.is_empty()).unwrap_or(DEFAULT_SCRIPT_NAME);
    if name.contains('/') || name.contains('\\') || name == ".." {
        return Err(Error::Process(format!("Invalid script name: {}", name)));
    }
    let name = if name.ends_with(".py") {
        name.to_string()
    } else {
        format!("{}.py", name)
    };
    Ok(std::env::current_dir()?.join(CREATE_DIR).join(name))
}

/// Writes `content` to `path`, creating parent directories.
pub async fn create(path: &Path, content: &str) -> Result<PathBuf, Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    info!("Created script {}", path.display());
    Ok(path.to_path_buf())
}
