//! The one place a `git` subprocess is spawned.
//!
//! Every invocation gets the same treatment:
//!
//! - its own process group, so cancellation kills `pack-objects` and any
//!   other helpers along with the parent;
//! - a cleared environment carrying only `PATH`, a null global/system
//!   config and `GIT_DIR` pinned to the repository;
//! - stdin fed from an independent task, so a client that stops sending
//!   never stalls the stdout copy;
//! - stdout copied chunk by chunk with a flush after every chunk.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on captured stderr kept for error messages.
const STDERR_CAPTURE_LIMIT: u64 = 64 * 1024;

const COPY_BUF_SIZE: usize = 32 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {operation}: spawn failed: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("git {operation} failed ({status}): {}", .stderr.trim())]
    Exit {
        operation: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("git {operation}: stream copy failed: {source}")]
    Stream {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("git {operation}: cancelled")]
    Cancelled { operation: String },
}

impl GitError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Exit { status, .. } => status.code(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream wiring
// ---------------------------------------------------------------------------

/// Where the child's stderr goes.
#[derive(Default)]
pub enum Stderr<'a> {
    /// Interleaved into the output stream as it arrives.
    #[default]
    Shared,
    Separate(BoxedWriter<'a>),
    /// Kept (bounded) and attached to the error on failure.
    Capture,
}

pub struct Streams<'a> {
    pub stdin: Option<BoxedReader>,
    pub stdout: BoxedWriter<'a>,
    pub stderr: Stderr<'a>,
}

impl<'a> Streams<'a> {
    pub fn new(stdout: BoxedWriter<'a>) -> Self {
        Self {
            stdin: None,
            stdout,
            stderr: Stderr::default(),
        }
    }

    pub fn stdin(mut self, input: BoxedReader) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn stderr(mut self, stderr: Stderr<'a>) -> Self {
        self.stderr = stderr;
        self
    }
}

/// Captured result of a short git command.
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl Output {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// A git invocation: `git [-c k=v]... <subcommand> [args]...`.
#[derive(Debug, Clone)]
pub struct GitCommand {
    subcommand: String,
    args: Vec<OsString>,
    config: Vec<(String, String)>,
    envs: Vec<(String, String)>,
    repo: Option<PathBuf>,
}

impl GitCommand {
    /// A command that runs inside the bare repository at `repo`.
    pub fn new(repo: impl AsRef<Path>, subcommand: &str) -> Self {
        Self {
            repo: Some(repo.as_ref().to_path_buf()),
            ..Self::detached(subcommand)
        }
    }

    /// A command that does not operate on an existing repository
    /// (`init`, `--version`).
    pub fn detached(subcommand: &str) -> Self {
        Self {
            subcommand: subcommand.to_string(),
            args: Vec::new(),
            config: Vec::new(),
            envs: Vec::new(),
            repo: None,
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

    /// Per-invocation `-c key=value`.
    pub fn config(mut self, key: &str, value: &str) -> Self {
        self.config.push((key.to_string(), value.to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn git_protocol(self, protocol: Option<&str>) -> Self {
        match protocol {
            Some(p) => self.env("GIT_PROTOCOL", p),
            None => self,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        for (key, value) in &self.config {
            cmd.arg("-c").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.subcommand).args(&self.args);

        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_SYSTEM", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(repo) = &self.repo {
            cmd.current_dir(repo).env("GIT_DIR", repo);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run to completion, streaming through `streams`.  A non-zero exit is
    /// an error.
    pub async fn run(
        self,
        streams: Streams<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        let (status, stderr) = self.execute(streams, cancel).await?;
        if status.success() {
            Ok(())
        } else {
            Err(self.exit_error(status, stderr))
        }
    }

    /// Run with captured stdout/stderr.  Non-zero exits are returned in the
    /// [`Output`], not as errors; callers that care about specific codes
    /// (`rev-parse`, `config --get`) inspect them.
    pub async fn output(self, cancel: &CancellationToken) -> Result<Output, GitError> {
        let mut stdout = Vec::new();
        let streams = Streams::new(&mut stdout).stderr(Stderr::Capture);
        let (status, stderr) = self.execute(streams, cancel).await?;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    /// Like [`output`](Self::output) but a non-zero exit is an error.
    /// Returns trimmed stdout.
    pub async fn checked(self, cancel: &CancellationToken) -> Result<String, GitError> {
        let operation = self.subcommand.clone();
        let out = self.output(cancel).await?;
        if out.status.success() {
            Ok(out.stdout_trimmed())
        } else {
            Err(GitError::Exit {
                operation,
                status: out.status,
                stderr: out.stderr,
            })
        }
    }

    fn exit_error(&self, status: ExitStatus, stderr: String) -> GitError {
        GitError::Exit {
            operation: self.subcommand.clone(),
            status,
            stderr,
        }
    }

    async fn execute(
        &self,
        streams: Streams<'_>,
        cancel: &CancellationToken,
    ) -> Result<(ExitStatus, String), GitError> {
        let operation = || self.subcommand.clone();
        let stream_err = |source: io::Error| GitError::Stream {
            operation: self.subcommand.clone(),
            source,
        };

        let Streams {
            stdin,
            stdout: out,
            stderr: stderr_mode,
        } = streams;

        let mut cmd = self.command();
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            operation: operation(),
            source,
        })?;
        let mut group = ProcessGroup::new(child.id());
        debug!(operation = %self.subcommand, pid = ?child.id(), "spawned git");

        let feeder = match (stdin, child.stdin.take()) {
            (Some(mut input), Some(mut pipe)) => Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut input, &mut pipe).await;
                // Dropping the pipe is the child's EOF.
                drop(pipe);
                copied
            })),
            _ => None,
        };

        let child_out = child
            .stdout
            .take()
            .ok_or_else(|| stream_err(io::Error::other("stdout not captured")))?;
        let child_err = child
            .stderr
            .take()
            .ok_or_else(|| stream_err(io::Error::other("stderr not captured")))?;

        let copied = {
            let work = async {
                let mut captured = Vec::new();
                let result = match stderr_mode {
                    Stderr::Shared => copy_merged(child_out, child_err, out).await,
                    Stderr::Separate(err) => {
                        tokio::try_join!(pump(child_out, out), pump(child_err, err)).map(|_| ())
                    }
                    Stderr::Capture => {
                        let (a, b) =
                            tokio::join!(pump(child_out, out), capture(child_err, &mut captured));
                        a.and(b)
                    }
                };
                (result, captured)
            };
            tokio::select! {
                r = work => Some(r),
                _ = cancel.cancelled() => None,
            }
        };

        let abort_feeder = |feeder: Option<tokio::task::JoinHandle<io::Result<u64>>>| {
            if let Some(f) = feeder {
                f.abort();
            }
        };

        let captured = match copied {
            None => {
                debug!(operation = %self.subcommand, "cancelled; killing process group");
                group.kill();
                let _ = child.wait().await;
                abort_feeder(feeder);
                return Err(GitError::Cancelled {
                    operation: operation(),
                });
            }
            Some((Err(source), _)) => {
                group.kill();
                let _ = child.wait().await;
                abort_feeder(feeder);
                return Err(stream_err(source));
            }
            Some((Ok(()), captured)) => captured,
        };

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(stream_err)?,
            None => {
                group.kill();
                let _ = child.wait().await;
                abort_feeder(feeder);
                return Err(GitError::Cancelled {
                    operation: operation(),
                });
            }
        };
        group.disarm();

        if let Some(feeder) = feeder {
            if feeder.is_finished() {
                match feeder.await {
                    Ok(Err(e)) if status.success() && e.kind() != io::ErrorKind::BrokenPipe => {
                        return Err(stream_err(e));
                    }
                    Ok(Err(e)) => debug!(error = %e, "stdin copy ended early"),
                    _ => {}
                }
            } else {
                // Child is done; whatever the client still sends is moot.
                feeder.abort();
            }
        }

        debug!(operation = %self.subcommand, %status, "git exited");
        Ok((status, String::from_utf8_lossy(&captured).into_owned()))
    }
}

// ---------------------------------------------------------------------------
// Copy helpers
// ---------------------------------------------------------------------------

/// Copy until EOF, flushing after every chunk so partial output is visible.
async fn pump<R, W>(mut reader: R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

/// Interleave two pipes into one writer in arrival order.
async fn copy_merged<A, B, W>(mut stdout: A, mut stderr: B, writer: &mut W) -> io::Result<()>
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out_buf = vec![0u8; COPY_BUF_SIZE];
    let mut err_buf = vec![0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            r = stdout.read(&mut out_buf), if out_open => {
                let n = r?;
                if n == 0 {
                    out_open = false;
                } else {
                    writer.write_all(&out_buf[..n]).await?;
                    writer.flush().await?;
                }
            }
            r = stderr.read(&mut err_buf), if err_open => {
                let n = r?;
                if n == 0 {
                    err_open = false;
                } else {
                    writer.write_all(&err_buf[..n]).await?;
                    writer.flush().await?;
                }
            }
        }
    }
    writer.flush().await
}

/// Keep the first [`STDERR_CAPTURE_LIMIT`] bytes, drain the rest so the
/// child never blocks on a full pipe.
async fn capture<R>(reader: R, captured: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(STDERR_CAPTURE_LIMIT);
    limited.read_to_end(captured).await?;
    let mut rest = limited.into_inner();
    tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Process group guard
// ---------------------------------------------------------------------------

/// SIGKILLs the child's process group unless disarmed after a clean reap.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid = %pgid, error = %e, "failed to kill git process group"),
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
