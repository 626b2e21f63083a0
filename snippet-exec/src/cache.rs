//! Content-addressed build directories.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{BuildArtifact, CompileDiagnostic};

pub const SOURCE_FILE: &str = "source.rs";
pub const SIDECAR_FILE: &str = "artifact.json";
const MODULE_STEM: &str = "snippet";

/// Lowercase hex SHA-256 of the compiled text and compiler settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(text: &str, settings_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(settings_fingerprint.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform file name of a compiled module, e.g. `libsnippet.so`.
pub fn module_file_name() -> String {
    libloading::library_filename(MODULE_STEM)
        .to_string_lossy()
        .into_owned()
}

type LockTable = Mutex<HashMap<CacheKey, Arc<RwLock<()>>>>;

fn table(locks: &LockTable) -> MutexGuard<'_, HashMap<CacheKey, Arc<RwLock<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum LeaseGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Hold on a build directory. Any number of requests may share a key;
/// removing the directory needs the exclusive lease.
pub struct BuildLease {
    key: CacheKey,
    guard: Option<LeaseGuard>,
    locks: Arc<LockTable>,
}

impl BuildLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Some(LeaseGuard::Exclusive(_)))
    }
}

impl fmt::Debug for BuildLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLease")
            .field("key", &self.key)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = table(&self.locks);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompilationCache {
    root: PathBuf,
    locks: Arc<LockTable>,
}

impl CompilationCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<RwLock<()>> {
        Arc::clone(table(&self.locks).entry(key.clone()).or_default())
    }

    /// Shared hold on `key`'s build directory for the length of a request.
    /// Waits while the directory is being removed.
    pub async fn lease(&self, key: &CacheKey) -> BuildLease {
        let guard = self.lock_for(key).read_owned().await;
        BuildLease {
            key: key.clone(),
            guard: Some(LeaseGuard::Shared(guard)),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Exclusive hold for removing `key`'s directory, or `None` while any
    /// request still uses it.
    pub fn try_exclusive(&self, key: &CacheKey) -> Option<BuildLease> {
        let guard = self.lock_for(key).try_write_owned().ok();
        let lease = BuildLease {
            key: key.clone(),
            guard: guard.map(LeaseGuard::Exclusive),
            locks: Arc::clone(&self.locks),
        };
        lease.is_exclusive().then_some(lease)
    }

    /// Number of keys with a live lease.
    pub fn leased_keys(&self) -> usize {
        table(&self.locks).len()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn artifact_for(&self, key: &CacheKey) -> BuildArtifact {
        let build_dir = self.build_dir(key);
        BuildArtifact {
            source_path: build_dir.join(SOURCE_FILE),
            module_path: build_dir.join(module_file_name()),
            build_dir,
            diagnostics: Vec::new(),
        }
    }

    /// A previously built module for `key`, if one exists and is non-empty.
    ///
    /// A zero-length module is deleted so the next build starts clean.
    pub async fn lookup(&self, key: &CacheKey) -> Option<BuildArtifact> {
        let mut artifact = self.artifact_for(key);
        let meta = fs::metadata(&artifact.module_path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        if meta.len() == 0 {
            warn!("Discarding empty cached module {}", artifact.module_path.display());
            if let Err(e) = fs::remove_file(&artifact.module_path).await {
                warn!("Failed to remove empty module: {}", e);
            }
            return None;
        }

        if let Ok(sidecar) = fs::read(artifact.build_dir.join(SIDECAR_FILE)).await {
            match serde_json::from_slice::<Vec<CompileDiagnostic>>(&sidecar) {
                Ok(diagnostics) => artifact.diagnostics = diagnostics,
                Err(e) => debug!("Ignoring unreadable sidecar for {}: {}", key, e),
            }
        }
        debug!("Cache hit for {}", key);
        Some(artifact)
    }

    /// Creates the build directory and writes the source atomically.
    pub async fn prepare(&self, key: &CacheKey, text: &str) -> Result<BuildArtifact, Error> {
        let artifact = self.artifact_for(key);
        fs::create_dir_all(&artifact.build_dir).await.map_err(|e| {
            Error::System(format!(
                "Failed to create build directory {}: {}",
                artifact.build_dir.display(),
                e
            ))
        })?;
        write_atomic(&artifact.source_path, text.as_bytes()).await?;
        Ok(artifact)
    }

    /// Records the diagnostics of a successful build next to its module.
    pub async fn store(&self, artifact: &BuildArtifact) -> Result<(), Error> {
        let sidecar = serde_json::to_vec_pretty(&artifact.diagnostics)?;
        write_atomic(&artifact.build_dir.join(SIDECAR_FILE), &sidecar).await
    }

    /// Drops a cached module that could not be loaded.
    pub async fn invalidate(&self, artifact: &BuildArtifact) {
        warn!("Invalidating cached module {}", artifact.module_path.display());
        for path in [&artifact.module_path, &artifact.build_dir.join(SIDECAR_FILE)] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Writes through a uniquely named temporary file and renames it into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
