//! Standard output capture for in-process invocations.
//!
//! Loaded modules write straight to file descriptor 1, so capture works at
//! the descriptor level: fd 1 is pointed at an anonymous temporary file for
//! the duration of one call. Descriptors are process-global, hence the lock.

use nix::unistd::{dup, dup2};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::Error;

const STDOUT_FD: i32 = 1;

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// Redirects fd 1 until finished or dropped.
pub struct StdoutCapture {
    file: File,
    saved: Option<OwnedFd>,
    _lock: MutexGuard<'static, ()>,
}

impl StdoutCapture {
    pub fn begin() -> Result<Self, Error> {
        let lock = CAPTURE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = std::io::stdout().flush();

        let file = tempfile::tempfile()?;
        let saved = dup(STDOUT_FD)
            .map_err(|e| Error::System(format!("Failed to duplicate stdout: {}", e)))?;
        // SAFETY: `dup` returned a fresh descriptor that nothing else owns.
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };
        dup2(file.as_raw_fd(), STDOUT_FD)
            .map_err(|e| Error::System(format!("Failed to redirect stdout: {}", e)))?;

        Ok(Self {
            file,
            saved: Some(saved),
            _lock: lock,
        })
    }

    /// Restores fd 1 and returns everything written in between.
    pub fn finish(mut self) -> Result<String, Error> {
        self.restore();
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            let _ = std::io::stdout().flush();
            if let Err(e) = dup2(saved.as_raw_fd(), STDOUT_FD) {
                warn!("Failed to restore stdout: {}", e);
            }
        }
    }
}

impl Drop for StdoutCapture {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Runs `f` with stdout captured, returning its result and the output.
pub fn captured<T>(f: impl FnOnce() -> T) -> Result<(T, String), Error> {
    let capture = StdoutCapture::begin()?;
    let value = f();
    let output = capture.finish()?;
    Ok((value, output))
}
