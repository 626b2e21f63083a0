use std::path::{Path, PathBuf};
use tracing::debug;
use which::which;

use crate::config::PythonConfig;
use crate::error::Error;

/// The name that means "find one for me".
pub const BARE_DEFAULT: &str = "python";

/// Finds the interpreter to run.
///
/// An explicit choice other than the bare default wins, then a virtual
/// environment, the configured interpreter, known install locations and
/// finally `python3` / `python` on `PATH`.
pub fn resolve(
    explicit: Option<&str>,
    virtual_env: Option<&Path>,
    config: &PythonConfig,
) -> Result<PathBuf, Error> {
    if let Some(explicit) = explicit.map(str::trim).filter(|e| !e.is_empty() && *e != BARE_DEFAULT) {
        return lookup(explicit)
            .ok_or_else(|| Error::InterpreterNotFound(explicit.to_string()));
    }

    if let Some(venv) = virtual_env {
        match venv_interpreter(venv) {
            Some(path) => return Ok(path),
            None => debug!("No interpreter inside virtual env {}", venv.display()),
        }
    }

    if config.interpreter != BARE_DEFAULT {
        if let Some(path) = lookup(&config.interpreter) {
            return Ok(path);
        }
        debug!("Configured interpreter {} not found", config.interpreter);
    }

    let home_locations = dirs::home_dir()
        .map(|home| {
            vec![
                home.join(".pyenv").join("shims").join("python3"),
                home.join(".local").join("bin").join("python3"),
            ]
        })
        .unwrap_or_default();
    if let Some(path) = config
        .known_locations
        .iter()
        .chain(home_locations.iter())
        .find(|p| p.is_file())
    {
        return Ok(path.clone());
    }

    which("python3")
        .or_else(|_| which(BARE_DEFAULT))
        .map_err(|_| Error::InterpreterNotFound("no python3 or python found".to_string()))
}

fn lookup(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    which(name).ok()
}

fn venv_interpreter(venv: &Path) -> Option<PathBuf> {
    [
        venv.join("bin").join("python"),
        venv.join("bin").join("python3"),
        venv.join("Scripts").join("python.exe"),
    ]
    .into_iter()
    .find(|p| p.is_file())
}
