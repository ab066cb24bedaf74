use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type OpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Op = Box<dyn FnOnce(CancellationToken) -> OpFuture + Send>;
type DeadlineHook = Box<dyn FnOnce(Duration) + Send>;

/// How one cleanup operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
    /// Still running when the deadline fired.
    Abandoned,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<(String, Outcome)>,
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }
}

/// Runs named cleanup operations concurrently under one deadline.
///
/// When the deadline fires first, every operation's token is canceled and the
/// deadline hook runs. The default hook terminates the process.
pub struct ShutdownCoordinator {
    timeout: Duration,
    ops: Vec<(String, Op)>,
    on_deadline: DeadlineHook,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ops: Vec::new(),
            on_deadline: Box::new(force_exit),
        }
    }

    pub fn operation<F, Fut>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let op: Op = Box::new(move |ctx| Box::pin(op(ctx)) as OpFuture);
        self.ops.push((name.into(), op));
        self
    }

    /// Replace the forced exit with `hook`.
    pub fn on_deadline<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.on_deadline = Box::new(hook);
        self
    }

    /// Run every operation now and wait for them or the deadline.
    pub async fn run(self) -> ShutdownReport {
        let ctx = CancellationToken::new();
        let outcomes: Arc<Mutex<Vec<(String, Outcome)>>> = Arc::default();
        let names: Vec<String> = self.ops.iter().map(|(n, _)| n.clone()).collect();

        let mut set = JoinSet::new();
        for (name, op) in self.ops {
            let fut = op(ctx.child_token());
            let outcomes = Arc::clone(&outcomes);
            set.spawn(async move {
                info!(op = %name, "cleaning up");
                let outcome = match fut.await {
                    Ok(()) => {
                        info!(op = %name, "shut down gracefully");
                        Outcome::Succeeded
                    }
                    Err(e) => {
                        error!(op = %name, error = %e, "clean up failed");
                        Outcome::Failed(format!("{e:#}"))
                    }
                };
                if let Ok(mut recorded) = outcomes.lock() {
                    recorded.push((name, outcome));
                }
            });
        }

        let finished = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "cleanup task panicked");
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            ctx.cancel();
            warn!(timeout_ms = self.timeout.as_millis() as u64, "shutdown timeout elapsed");
            (self.on_deadline)(self.timeout);
            set.abort_all();
        }

        let mut report = ShutdownReport {
            outcomes: outcomes.lock().map(|o| o.clone()).unwrap_or_default(),
            timed_out: !finished,
        };
        for name in names {
            if report.outcome(&name).is_none() {
                report.outcomes.push((name, Outcome::Abandoned));
            }
        }
        report
    }

    /// Wait for `signal` in the background, then run.
    pub fn spawn<S>(self, signal: S) -> ShutdownHandle
    where
        S: Future<Output = ()> + Send + 'static,
    {
        ShutdownHandle {
            done: tokio::spawn(async move {
                signal.await;
                self.run().await
            }),
        }
    }
}

pub struct ShutdownHandle {
    done: JoinHandle<ShutdownReport>,
}

impl ShutdownHandle {
    /// Resolves once every operation has returned.
    pub async fn wait(self) -> ShutdownReport {
        match self.done.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "shutdown task failed");
                ShutdownReport::default()
            }
        }
    }
}

fn force_exit(timeout: Duration) {
    error!(timeout_ms = timeout.as_millis() as u64, "cleanup did not finish in time, force exit");
    std::process::exit(0);
}

/// Resolves on SIGINT or SIGTERM.
pub async fn termination_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received SIGINT, initiating shutdown");
                }
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, initiating shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
    }
}
