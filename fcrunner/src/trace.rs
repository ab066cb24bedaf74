use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::{self, CaptureMode, CommandLine};
use crate::config::TracerConfig;
use crate::jobs::JobTracker;

/// Syscall tracer.
///
/// Tracer processes run under a trace token that is independent of the
/// traced process's own lifecycle. Stopping cancels the token and installs a
/// fresh one, so tracing can be started again later.
pub struct Tracer {
    helper: PathBuf,
    use_sudo: bool,
    token: Mutex<CancellationToken>,
}

impl Tracer {
    /// Build a tracer, resolving a relative helper path against the current
    /// working directory.
    pub fn new(config: &TracerConfig) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to read working directory")?;
        Ok(Self::with_base(config, &cwd))
    }

    pub fn with_base(config: &TracerConfig, base: &Path) -> Self {
        let helper = if config.script.is_absolute() {
            config.script.clone()
        } else {
            base.join(&config.script)
        };
        Self {
            helper,
            use_sudo: config.use_sudo,
            token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    /// The helper invocation for `pid`.
    pub fn command(&self, pid: u32) -> CommandLine {
        let helper = self.helper.to_string_lossy().into_owned();
        if self.use_sudo {
            CommandLine::new("sudo", [helper, pid.to_string()])
        } else {
            CommandLine::new(helper, [pid.to_string()])
        }
    }

    /// The current trace token.
    pub async fn token(&self) -> CancellationToken {
        self.token.lock().await.clone()
    }

    /// Stop every tracer started under the current token.
    pub async fn stop(&self) {
        let mut token = self.token.lock().await;
        token.cancel();
        *token = CancellationToken::new();
        info!("syscall tracing stopped");
    }

    /// Start tracing `pid` into `log_path`. The tracer runs detached until the
    /// trace token is canceled or the helper exits.
    pub async fn track(&self, pid: u32, log_path: &Path, jobs: &JobTracker) -> Result<()> {
        let token = self.token().await.child_token();
        let cmd = self.command(pid);
        let capture = capture::run(token.clone(), &cmd, log_path, CaptureMode::Detached)
            .await
            .with_context(|| format!("failed to start syscall tracer for pid {}", pid))?;
        let tracer_pid = capture.pid();

        let job = async move {
            if let Err(e) = capture.wait().await {
                warn!(pid, error = %e, "syscall tracer failed");
            }
        };
        if let Err(e) = jobs.spawn(format!("trace-{}", pid), token.clone(), job).await {
            token.cancel();
            return Err(e);
        }

        info!(pid, tracer_pid, log = %log_path.display(), "tracing syscalls");
        Ok(())
    }
}
