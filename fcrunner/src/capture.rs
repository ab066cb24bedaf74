use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fcrunner_protocol::LogTag;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the output pumps may keep draining once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// An external command as an explicit argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from a full argv. The first element is the program.
    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut iter = argv.into_iter();
        let program = match iter.next() {
            Some(p) if !p.is_empty() => p,
            _ => bail!("command must not be empty"),
        };
        Ok(Self {
            program,
            args: iter.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a capture decides it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Until the process exits on its own. A non-zero exit is an error.
    Wait,
    /// Until the token is canceled (the process is then killed and reaped)
    /// or the process exits on its own.
    Detached,
}

/// A started capture: the process id plus the task that finishes once the
/// process is gone and both output pumps have drained into the log.
#[derive(Debug)]
pub struct Capture {
    pid: u32,
    done: JoinHandle<Result<()>>,
}

impl Capture {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn into_done(self) -> JoinHandle<Result<()>> {
        self.done
    }

    /// Wait for the capture to finish.
    pub async fn wait(self) -> Result<()> {
        self.done.await.context("capture task panicked")?
    }
}

/// Start `cmd`, tagging its stdout and stderr lines into `log_path`.
///
/// Returns as soon as the process has started; the pid is available before
/// any output is pumped. Cancellation of `cancel` kills the process in either
/// mode and is not reported as an error.
pub async fn run(
    cancel: CancellationToken,
    cmd: &CommandLine,
    log_path: &Path,
    mode: CaptureMode,
) -> Result<Capture> {
    if cmd.program().is_empty() {
        bail!("command must not be empty");
    }

    let file = File::create(log_path)
        .await
        .with_context(|| format!("failed to create log file {}", log_path.display()))?;

    let mut child = Command::new(cmd.program())
        .args(cmd.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", cmd.program()))?;

    let pid = child
        .id()
        .with_context(|| format!("{} exited before its pid was read", cmd.program()))?;
    let stdout = child.stdout.take().context("stdout not piped")?;
    let stderr = child.stderr.take().context("stderr not piped")?;

    debug!(pid, cmd = %cmd, log = %log_path.display(), ?mode, "process started");

    let log = Arc::new(Mutex::new(file));
    let out_pump = tokio::spawn(pump(stdout, LogTag::Stdout, log.clone()));
    let err_pump = tokio::spawn(pump(stderr, LogTag::Stderr, log.clone()));
    let program = cmd.program().to_string();

    let done = tokio::spawn(async move {
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pid, "capture canceled, killing process");
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "failed to kill process");
                }
                None
            }
            status = child.wait() => {
                Some(status.with_context(|| format!("failed waiting for {}", program))?)
            }
        };

        // Grandchildren (killed parent or a backgrounded helper) may hold
        // the pipes open; the pumps only get a grace period to drain.
        let aborts = [out_pump.abort_handle(), err_pump.abort_handle()];
        let drain = async {
            for (tag, handle) in [(LogTag::Stdout, out_pump), (LogTag::Stderr, err_pump)] {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(pid, %tag, error = %e, "output pump failed"),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(pid, %tag, error = %e, "output pump panicked"),
                }
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!(pid, "output still open after process exit, abandoning pumps");
            aborts.iter().for_each(|a| a.abort());
        }
        log.lock().await.flush().await.context("failed to flush log file")?;

        match status {
            Some(status) if mode == CaptureMode::Wait && !status.success() => {
                bail!("{} exited with {}", program, status)
            }
            Some(status) => {
                debug!(pid, %status, "process exited");
                Ok(())
            }
            None => Ok::<(), anyhow::Error>(()),
        }
    });

    Ok(Capture { pid, done })
}

/// Copy `reader` line by line into the shared log, prefixing each line with `tag`.
async fn pump<R>(reader: R, tag: LogTag, log: Arc<Mutex<File>>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let line = tag.format_line(&String::from_utf8_lossy(&buf));
        log.lock().await.write_all(line.as_bytes()).await?;
    }
}
