//! Swappable system dependencies: process spawning, filesystem access, and the
//! wall clock. The git synchronizer, executor, and supervisor only talk to the
//! outside world through these traits so they can run against fakes in tests.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use super::output::{BoundedOutput, OutputChunk, Stream};
use super::redact::{LineRedactor, Redactor};
use crate::errors::PreviewError;

/// Exit code of a finished process; `None` when it was killed by a signal.
pub type ExitCode = Option<i32>;

/// Description of a process to launch. Never interpreted by a shell unless the
/// program itself is a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `sh -c <command>`. Only for commands that passed the safety validator.
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Program and arguments joined by spaces, for logs and fake matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Owner-side handle to a spawned process. Terminating is fire-and-forget, and
/// dropping the handle terminates the process as well.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Signal the process to terminate without waiting for it to exit.
    /// Returns false if it was already signalled.
    pub fn terminate(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// A running process: its handle, a channel of output chunks that closes when
/// both pipes reach EOF, and a receiver for the exit code.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    pub exit: oneshot::Receiver<ExitCode>,
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<SpawnedProcess>;
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn modified(&self, path: &Path) -> io::Result<SystemTime>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Bundle of system dependencies shared by the engine components.
#[derive(Clone)]
pub struct System {
    pub runner: Arc<dyn ProcessRunner>,
    pub fs: Arc<dyn Filesystem>,
    pub clock: Arc<dyn Clock>,
}

impl System {
    pub fn real() -> Self {
        Self {
            runner: Arc::new(TokioProcessRunner),
            fs: Arc::new(TokioFilesystem),
            clock: Arc::new(SystemClock),
        }
    }
}

// ── Real implementations ──────────────────────────────────────────────

pub struct TokioProcessRunner;

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputChunk>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            // Keep draining even if nobody listens so the child never blocks on a full pipe.
            Ok(n) => {
                let _ = tx.send(OutputChunk {
                    stream,
                    bytes: buf[..n].to_vec(),
                });
            }
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: killpg has no memory-safety preconditions; the group was
        // created for this child by process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: Option<u32>) {}

impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<SpawnedProcess> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Stream::Stdout, out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Stream::Stderr, out_tx.clone()));
        }
        drop(out_tx);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    signal_process_group(pid);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = exit_tx.send(status.ok().and_then(|s| s.code()));
        });

        Ok(SpawnedProcess {
            handle: ProcessHandle::new(pid, kill_tx),
            output: out_rx,
            exit: exit_rx,
        })
    }
}

pub struct TokioFilesystem;

#[async_trait]
impl Filesystem for TokioFilesystem {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        tokio::fs::metadata(path).await?.modified()
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ── Run-to-completion helper ──────────────────────────────────────────

/// Exit code plus bounded, redacted output of a finished process.
#[derive(Debug)]
pub struct CapturedOutput {
    pub exit_code: ExitCode,
    pub output: BoundedOutput,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawn a process and wait for it, keeping at most `cap` bytes of output.
/// Output is redacted line by line before it reaches the buffer, so truncation
/// never leaves part of a secret behind.
pub async fn run_to_completion(
    runner: &dyn ProcessRunner,
    spec: &CommandSpec,
    cap: usize,
    redactor: &Redactor,
) -> Result<CapturedOutput, PreviewError> {
    let mut spawned = runner
        .spawn(spec)
        .map_err(|source| PreviewError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;
    let mut output = BoundedOutput::new(cap);
    let mut stdout = LineRedactor::new(redactor);
    let mut stderr = LineRedactor::new(redactor);
    while let Some(chunk) = spawned.output.recv().await {
        let lines = match chunk.stream {
            Stream::Stdout => &mut stdout,
            Stream::Stderr => &mut stderr,
        };
        output.push(lines.feed(&chunk.bytes).as_bytes());
    }
    output.push(stdout.finish().as_bytes());
    output.push(stderr.finish().as_bytes());
    let exit_code = (&mut spawned.exit).await.unwrap_or(None);
    Ok(CapturedOutput { exit_code, output })
}

// ── Test doubles ──────────────────────────────────────────────────────
