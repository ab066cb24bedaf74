mod api;
mod capture;
mod cli;
mod config;
mod filesystem;
mod jobs;
mod network;
mod node;
mod shutdown;
mod trace;
mod util;
mod vm;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::Config;
use crate::shutdown::{Outcome, ShutdownCoordinator};

#[derive(Parser)]
#[command(name = "fcrunner", about = "Node agent for Firecracker microVM benchmarks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node agent API server.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides server.port).
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Verify host prerequisites before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = cli::load_config(config)?;
            cli::run_check(&config)?;
        }
        Commands::Serve { config, port } => {
            let mut config = cli::load_config(config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    // Held until return; a second agent would fight over the same bridge
    // and taps.
    let _lock = acquire_instance_lock(&config.server.lock_file)?;

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!(addr = %addr, "fcrunner listening");

    let timeout = config.shutdown.timeout();
    let state = Arc::new(AppState::new(config)?);
    let router = api::build_router(Arc::clone(&state));

    let stop_serving = CancellationToken::new();
    let server_exited = CancellationToken::new();
    let server = {
        let stop = stop_serving.clone();
        let exited = server_exited.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = &result {
                error!(error = %e, "server error");
            }
            exited.cancel();
            result
        })
    };

    let vm_state = Arc::clone(&state);
    let node_state = Arc::clone(&state);
    let coordinator = ShutdownCoordinator::new(timeout)
        .operation("vm-manager", move |ctx| async move {
            vm_state.vms().await.shutdown(&ctx).await?;
            Ok::<_, anyhow::Error>(())
        })
        .operation("node", move |_ctx| async move {
            node_state.node().await.shutdown().await;
            Ok::<_, anyhow::Error>(())
        })
        .operation("server", move |_ctx| async move {
            stop_serving.cancel();
            match server.await {
                Ok(result) => result.context("server failed"),
                Err(e) => Err(anyhow!("server task failed: {}", e)),
            }
        });

    let exited = server_exited.clone();
    let report = coordinator
        .spawn(async move {
            tokio::select! {
                _ = shutdown::termination_signal() => {}
                _ = exited.cancelled() => warn!("server stopped unexpectedly, shutting down"),
            }
        })
        .wait()
        .await;

    let failed = report
        .outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Outcome::Failed(_)))
        .count();
    info!(failed, timed_out = report.timed_out, "closing the listener");
    Ok(())
}

fn acquire_instance_lock(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open instance lock file {}", path.display()))?;
    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another fcrunner instance is already running (lock held on {}).\n\
             Two agents on one node would share the same bridge and tap devices.",
            path.display()
        );
    }
    Ok(lock_file)
}
