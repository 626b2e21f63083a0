//! Interpreter subprocesses with live output and forced termination.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::encoding::decode_line;
use crate::error::Error;
use crate::poll::{drive, ChildExit, Driven};
use crate::types::{EnvVars, ScriptResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One decoded line, as delivered to a live sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

pub type OutputSink = UnboundedSender<OutputLine>;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: EnvVars,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub drain_grace: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: EnvVars::new(),
            timeout,
            poll_interval: Duration::from_millis(50),
            drain_grace: Duration::from_millis(200),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn envs(mut self, env: &EnvVars) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn polling(mut self, interval: Duration, drain_grace: Duration) -> Self {
        self.poll_interval = interval;
        self.drain_grace = drain_grace;
        self
    }
}

/// Environment that makes the interpreter speak UTF-8 without buffering.
fn utf8_environment() -> [(&'static str, &'static str); 5] {
    [
        ("PYTHONIOENCODING", "utf-8"),
        ("PYTHONUTF8", "1"),
        ("PYTHONUNBUFFERED", "1"),
        ("LANG", "en_US.UTF-8"),
        ("LC_ALL", "en_US.UTF-8"),
    ]
}

type SharedBuffer = Arc<Mutex<String>>;

fn spawn_reader<R>(
    stream: R,
    kind: Stream,
    buffer: SharedBuffer,
    sink: Option<OutputSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = decode_line(&raw);
                    match kind {
                        Stream::Stdout => debug!(target: "snippet_exec::script", "{}", text),
                        Stream::Stderr => warn!(target: "snippet_exec::script", "{}", text),
                    }
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.push_str(&text);
                        buffer.push('\n');
                    }
                    if let Some(sink) = &sink {
                        let _ = sink.send(OutputLine {
                            stream: kind,
                            text,
                        });
                    }
                }
                Err(e) => {
                    error!("Failed to read {:?}: {}", kind, e);
                    break;
                }
            }
        }
    })
}

fn take(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|mut b| std::mem::take(&mut *b))
        .unwrap_or_default()
}

/// Runs a process to completion or until its deadline.
///
/// On timeout the whole process group is killed and whatever was printed
/// so far is kept, with `exit_code = -1`.
pub async fn run(spec: ProcessSpec, sink: Option<OutputSink>) -> Result<ScriptResult, Error> {
    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(utf8_environment())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    debug!("Spawning {} {:?}", spec.program.display(), spec.args);
    let mut child = command.spawn().map_err(|e| {
        Error::Process(format!("Failed to start {}: {}", spec.program.display(), e))
    })?;
    let pid = child.id();

    let stdout_buffer = SharedBuffer::default();
    let stderr_buffer = SharedBuffer::default();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, stdout_buffer.clone(), sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, stderr_buffer.clone(), sink));
    }

    let driven = drive(&mut ChildExit::new(&mut child), spec.poll_interval, spec.timeout).await?;

    let (exit_code, timed_out) = match driven {
        Driven::Done(status) => (status.code().unwrap_or(-1), false),
        Driven::Expired(elapsed) => {
            warn!("Process {:?} timed out after {:?}", pid, elapsed);
            kill_group(pid, &mut child).await;
            (-1, true)
        }
    };

    let drained = tokio::time::timeout(spec.drain_grace, async {
        for reader in &mut readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("Output readers still open after {:?}", spec.drain_grace);
        for reader in &readers {
            reader.abort();
        }
    }

    let output = take(&stdout_buffer);
    let mut error_text = take(&stderr_buffer);
    if timed_out {
        error_text.push_str(&format!(
            "Process timed out after {} seconds\n",
            spec.timeout.as_secs_f64()
        ));
    }

    let result = ScriptResult {
        success: exit_code == 0 && !timed_out,
        output,
        error: error_text,
        exit_code,
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
    };
    info!(
        "Process {} finished with exit code {} in {}ms",
        spec.program.display(),
        result.exit_code,
        result.duration_ms
    );
    Ok(result)
}

async fn kill_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Child already gone: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::skip_if_not_available;

    fn shell(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec::new("sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn collects_both_streams() -> Result<(), Error> {
        if skip_if_not_available(&["sh"]) {
            return Ok(());
        }
        let result = run(shell("echo out; echo err >&2; exit 3", Duration::from_secs(10)), None).await?;
        assert_eq!(result.output, "out\n");
        assert_eq!(result.error, "err\n");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success);
        assert!(!result.timed_out);
        Ok(())
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output() -> Result<(), Error> {
        if skip_if_not_available(&["sh", "sleep"]) {
            return Ok(());
        }
        let spec = shell("echo before; sleep 30; echo after", Duration::from_millis(500));
        let started = Instant::now();
        let result = run(spec, None).await?;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.output.contains("before"));
        assert!(!result.output.contains("after"));
        Ok(())
    }

    #[tokio::test]
    async fn sink_receives_lines_live() -> Result<(), Error> {
        if skip_if_not_available(&["sh"]) {
            return Ok(());
        }
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut env = EnvVars::new();
        env.insert("GREETING".into(), "hello".into());
        let spec = shell("echo $GREETING; echo $PYTHONUTF8", Duration::from_secs(10)).envs(&env);
        run(spec, Some(tx)).await?;

        let first = rx.recv().await.expect("first line");
        assert_eq!(first, OutputLine { stream: Stream::Stdout, text: "hello".into() });
        assert_eq!(rx.recv().await.expect("second line").text, "1");
        Ok(())
    }
}
