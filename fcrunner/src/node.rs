use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::capture::{self, CaptureMode, CommandLine};
use crate::config::Config;
use crate::jobs::JobTracker;
use crate::trace::Tracer;
use crate::util::HostCommand;

/// Host-side benchmark processes (servers and clients run on the node
/// itself rather than in a guest), each traced for syscalls.
pub struct Node {
    logs_dir: PathBuf,
    ops: CancellationToken,
    tracer: Tracer,
    jobs: JobTracker,
    host: HostCommand,
    stray_processes: Vec<String>,
    stop_timeout: Duration,
}

impl Node {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_tracer(config, Tracer::new(&config.tracer)?))
    }

    pub fn with_tracer(config: &Config, tracer: Tracer) -> Self {
        Self {
            logs_dir: config.logs.node_dir.clone(),
            ops: CancellationToken::new(),
            tracer,
            jobs: JobTracker::new(config.node.max_jobs),
            host: HostCommand::new(config.network.command_prefix.clone()),
            stray_processes: config.node.stray_processes.clone(),
            stop_timeout: config.vm.stop_timeout(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Start a long-running host command and trace it. It runs until the
    /// node is cleaned up or shut down. Returns its pid.
    #[instrument(skip(self, cmd), fields(cmd = %cmd))]
    pub async fn send_server_command(&self, cmd: &CommandLine) -> Result<u32> {
        self.ensure_logs_dir().await?;
        let log_path = self.logs_dir.join("node-server.log");
        let token = self.ops.child_token();

        let capture = capture::run(token.clone(), cmd, &log_path, CaptureMode::Detached)
            .await
            .context("failed to send command to node")?;
        let pid = capture.pid();
        let job = async move {
            match capture.wait().await {
                Ok(()) => info!(pid, log = %log_path.display(), "command on node stopped"),
                Err(e) => warn!(pid, error = %e, "command on node failed"),
            }
        };
        if let Err(e) = self.jobs.spawn(format!("node-server-{}", pid), token.clone(), job).await {
            token.cancel();
            return Err(e);
        }

        if let Err(e) = self.trace(pid).await {
            warn!(pid, error = %e, "failed to track syscalls of node command");
        }
        info!(pid, "server command started on node");
        Ok(pid)
    }

    /// Run a host command to completion, tracing it, and wait until every
    /// blocking node command has finished.
    #[instrument(skip(self, cmd), fields(cmd = %cmd))]
    pub async fn send_client_command(&self, cmd: &CommandLine) -> Result<()> {
        self.ensure_logs_dir().await?;
        let log_path = self.logs_dir.join("node-client.log");

        let capture = capture::run(self.ops.child_token(), cmd, &log_path, CaptureMode::Wait)
            .await
            .context("failed to send command to node")?;
        let pid = capture.pid();
        self.jobs
            .track_waited(async move {
                match capture.wait().await {
                    Ok(()) => info!(pid, log = %log_path.display(), "command completed on node"),
                    Err(e) => warn!(pid, error = %e, "command on node failed"),
                }
            })
            .await;

        if let Err(e) = self.trace(pid).await {
            warn!(pid, error = %e, "failed to track syscalls of node command");
        }

        self.jobs.join_waited().await;
        Ok(())
    }

    async fn trace(&self, pid: u32) -> Result<()> {
        let log_path = self.logs_dir.join("node-syscalls.log");
        self.tracer
            .track(pid, &log_path, &self.jobs)
            .await
            .context("failed to track syscalls of node")
    }

    /// Stop syscall tracers; traced commands keep running.
    pub async fn stop_syscalls(&self) {
        self.tracer.stop().await;
    }

    /// Kill stray benchmark processes on the host. Failures are logged.
    pub async fn kill_strays(&self) {
        for name in &self.stray_processes {
            match self.host.pkill(name).await {
                Ok(true) => info!(process = %name, "killed stray processes"),
                Ok(false) => {}
                Err(e) => warn!(process = %name, error = %e, "failed to kill stray processes"),
            }
        }
    }

    /// Stop tracers first, then every command this node started.
    pub async fn shutdown(&self) {
        self.tracer.stop().await;
        self.ops.cancel();
        self.jobs.shutdown(self.stop_timeout).await;
    }

    async fn ensure_logs_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .with_context(|| format!("failed to create {}", self.logs_dir.display()))
    }
}
