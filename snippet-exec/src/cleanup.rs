//! Best-effort removal of build directories and scripts.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::cache::module_file_name;
use crate::config::CleanupConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupReport {
    /// Nothing was compiled into the directory, so it was left alone
    Skipped,
    Missing,
    Removed { attempts: u32 },
    /// Some files could not be removed
    Partial { remaining: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct CleanupManager {
    max_attempts: u32,
    backoff: Duration,
}

impl CleanupManager {
    pub fn new(config: &CleanupConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
        }
    }

    /// Removes `build_dir` if it holds a compiled module. Never fails.
    pub async fn cleanup(&self, build_dir: &Path) -> CleanupReport {
        if fs::metadata(build_dir).await.is_err() {
            return CleanupReport::Missing;
        }
        if !build_dir.join(module_file_name()).exists() {
            debug!("No module in {}, leaving it", build_dir.display());
            return CleanupReport::Skipped;
        }

        for attempt in 1..=self.max_attempts {
            match fs::remove_dir_all(build_dir).await {
                Ok(()) => {
                    debug!("Removed {} (attempt {})", build_dir.display(), attempt);
                    return CleanupReport::Removed { attempts: attempt };
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return CleanupReport::Removed { attempts: attempt };
                }
                Err(e) => {
                    warn!(
                        "Failed to remove {} (attempt {}/{}): {}",
                        build_dir.display(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        let remaining = remove_files(build_dir).await;
        if remaining.is_empty() {
            CleanupReport::Removed {
                attempts: self.max_attempts,
            }
        } else {
            warn!(
                "{} files left behind in {}",
                remaining.len(),
                build_dir.display()
            );
            CleanupReport::Partial { remaining }
        }
    }

    /// Runs [`cleanup`](Self::cleanup) in the background once the caller
    /// has yielded. `hold` is dropped only after the directory is gone.
    pub fn schedule<H>(&self, build_dir: PathBuf, hold: H) -> tokio::task::JoinHandle<CleanupReport>
    where
        H: Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let report = manager.cleanup(&build_dir).await;
            info!("Cleanup of {}: {:?}", build_dir.display(), report);
            drop(hold);
            report
        })
    }

    /// Deletes a single file, tolerating its absence.
    pub async fn cleanup_file(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                false
            }
        }
    }
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new(&CleanupConfig::default())
    }
}

/// File-by-file fallback; returns what could not be removed.
async fn remove_files(dir: &Path) -> Vec<PathBuf> {
    let mut remaining = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    let mut dirs = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        dirs.push(current);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => pending.push(path),
                _ => {
                    if let Err(e) = fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            remaining.push(path);
                        }
                    }
                }
            }
        }
    }

    for dir in dirs.into_iter().rev() {
        let _ = fs::remove_dir(&dir).await;
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    fn manager() -> CleanupManager {
        CleanupManager::new(&CleanupConfig {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn removes_directories_with_modules() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        let build = root.child("abc123");
        build.child("source.rs").write_str("fn main() {}")?;
        build.child(module_file_name()).write_binary(b"\x7fELF")?;

        assert_eq!(manager().cleanup(build.path()).await, CleanupReport::Removed { attempts: 1 });
        build.assert(predicate::path::missing());
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        let build = root.child("def456");
        build.child(module_file_name()).write_binary(b"\x7fELF")?;

        let manager = manager();
        assert!(matches!(manager.cleanup(build.path()).await, CleanupReport::Removed { .. }));
        assert_eq!(manager.cleanup(build.path()).await, CleanupReport::Missing);
        assert_eq!(manager.cleanup(build.path()).await, CleanupReport::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn uncompiled_directories_are_kept() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        let build = root.child("failed");
        build.child("source.rs").write_str("fn broken(")?;

        assert_eq!(manager().cleanup(build.path()).await, CleanupReport::Skipped);
        build.child("source.rs").assert(predicate::path::exists());
        Ok(())
    }

    #[tokio::test]
    async fn scheduled_cleanup_runs_off_the_request_path() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        let build = root.child("scheduled");
        build.child(module_file_name()).write_binary(b"data")?;

        let report = manager().schedule(build.path().to_path_buf(), ()).await?;
        assert!(matches!(report, CleanupReport::Removed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn file_cleanup_tolerates_missing_files() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        let script = root.child("snippet_1_abc.py");
        script.write_str("print(1)")?;

        let manager = manager();
        assert!(manager.cleanup_file(script.path()).await);
        assert!(manager.cleanup_file(script.path()).await);
        script.assert(predicate::path::missing());
        Ok(())
    }

    #[tokio::test]
    async fn file_fallback_removes_nested_content() -> Result<(), Box<dyn std::error::Error>> {
        let root = assert_fs::TempDir::new()?;
        root.child("a/b/c.txt").write_str("c")?;
        root.child("a/d.txt").write_str("d")?;

        let remaining = remove_files(&root.path().join("a")).await;
        assert!(remaining.is_empty());
        root.child("a").assert(predicate::path::missing());
        Ok(())
    }
}
