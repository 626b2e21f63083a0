//! Cooperative status polling on a fixed tick.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Child;

use crate::error::Error;

pub enum Tick<T> {
    Pending,
    Done(T),
}

/// Something whose progress can be checked without blocking.
pub trait PollTask {
    type Output;

    fn poll(&mut self) -> Result<Tick<Self::Output>, Error>;
}

#[derive(Debug)]
pub enum Driven<T> {
    Done(T),
    Expired(Duration),
}

/// Checks `task` every `interval` until it finishes or `deadline` elapses.
pub async fn drive<P: PollTask>(
    task: &mut P,
    interval: Duration,
    deadline: Duration,
) -> Result<Driven<P::Output>, Error> {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Tick::Done(output) = task.poll()? {
            return Ok(Driven::Done(output));
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Ok(Driven::Expired(elapsed));
        }
    }
}

/// Child process exit.
pub struct ChildExit<'a> {
    child: &'a mut Child,
}

impl<'a> ChildExit<'a> {
    pub fn new(child: &'a mut Child) -> Self {
        Self { child }
    }
}

impl PollTask for ChildExit<'_> {
    type Output = std::process::ExitStatus;

    fn poll(&mut self) -> Result<Tick<Self::Output>, Error> {
        match self.child.try_wait()? {
            Some(status) => Ok(Tick::Done(status)),
            None => Ok(Tick::Pending),
        }
    }
}

/// A file that exists and is non-empty.
pub struct FileReady {
    path: PathBuf,
}

impl FileReady {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PollTask for FileReady {
    type Output = u64;

    fn poll(&mut self) -> Result<Tick<u64>, Error> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Tick::Done(meta.len())),
            _ => Ok(Tick::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    impl PollTask for Countdown {
        type Output = &'static str;

        fn poll(&mut self) -> Result<Tick<&'static str>, Error> {
            if self.0 == 0 {
                return Ok(Tick::Done("finished"));
            }
            self.0 -= 1;
            Ok(Tick::Pending)
        }
    }

    #[tokio::test]
    async fn drive_returns_output_when_task_finishes() -> Result<(), Error> {
        let mut task = Countdown(3);
        let driven = drive(&mut task, Duration::from_millis(5), Duration::from_secs(5)).await?;
        assert!(matches!(driven, Driven::Done("finished")));
        Ok(())
    }

    #[tokio::test]
    async fn drive_expires_at_deadline() -> Result<(), Error> {
        let mut task = Countdown(u32::MAX);
        let driven = drive(&mut task, Duration::from_millis(5), Duration::from_millis(40)).await?;
        match driven {
            Driven::Expired(elapsed) => assert!(elapsed >= Duration::from_millis(40)),
            Driven::Done(_) => panic!("countdown should not finish"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn file_ready_waits_for_content() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("module.so");
        std::fs::write(&path, b"")?;

        let mut ready = FileReady::new(&path);
        assert!(matches!(ready.poll()?, Tick::Pending));

        std::fs::write(&path, b"\x7fELF")?;
        assert!(matches!(ready.poll()?, Tick::Done(4)));
        Ok(())
    }
}
