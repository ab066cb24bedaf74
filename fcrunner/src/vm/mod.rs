pub mod channel;
pub mod instance;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, LogConfig, VmConfig};
use crate::jobs::JobTracker;
use crate::trace::Tracer;
use crate::util::HostCommand;

pub use channel::{ChannelError, ChannelMode, CommandChannel, StreamEnd};
pub use instance::{VmInstance, VmSpec, VmState};

/// Errors callers need to tell apart.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("no VM registered with IP {0}")]
    NotFound(Ipv4Addr),

    #[error("a VM with IP {0} is already registered")]
    AlreadyRegistered(Ipv4Addr),

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identity of a registered VM as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub index: u32,
    pub ip: Ipv4Addr,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub tap: String,
    pub mac: String,
    pub state: VmState,
}

impl From<&VmInstance> for VmSummary {
    fn from(vm: &VmInstance) -> Self {
        Self {
            index: vm.index,
            ip: vm.ip,
            kernel_path: vm.kernel_path.clone(),
            rootfs_path: vm.rootfs_path.clone(),
            tap: vm.tap.clone(),
            mac: vm.mac.clone(),
            state: vm.state,
        }
    }
}

struct Registry {
    vms: HashMap<Ipv4Addr, VmInstance>,
    /// Never reused, so tap and MAC assignment stays unique after failures.
    next_index: u32,
}

/// Registry of microVMs on this node.
///
/// All registry access goes through one async mutex. Creation holds it for
/// the whole launch, so creation and stop-all never interleave.
pub struct VmManager {
    vm: VmConfig,
    logs: LogConfig,
    /// Parent of every per-VM token.
    ops: CancellationToken,
    tracer: Tracer,
    jobs: JobTracker,
    registry: Mutex<Registry>,
}

impl VmManager {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_tracer(config, Tracer::new(&config.tracer)?))
    }

    pub fn with_tracer(config: &Config, tracer: Tracer) -> Self {
        Self {
            vm: config.vm.clone(),
            logs: config.logs.clone(),
            ops: CancellationToken::new(),
            tracer,
            jobs: JobTracker::new(config.vm.max_jobs),
            registry: Mutex::new(Registry {
                vms: HashMap::new(),
                next_index: 0,
            }),
        }
    }

    /// Launch a VM and register it under its guest IP.
    ///
    /// The index is consumed even when the launch fails; nothing is
    /// registered in that case.
    #[instrument(skip(self, spec), fields(ip = %spec.ip))]
    pub async fn create_vm(&self, spec: VmSpec) -> Result<VmSummary, VmError> {
        if self.ops.is_cancelled() {
            return Err(VmError::Canceled);
        }

        let ip = spec.ip;
        let mut registry = self.registry.lock().await;
        if registry.vms.contains_key(&ip) {
            return Err(VmError::AlreadyRegistered(ip));
        }
        let index = registry.next_index;
        registry.next_index += 1;

        let mut vm = VmInstance::new(index, spec, &self.vm.run_dir, self.ops.child_token());
        let log_path = self.logs.vm_log_dir.join(format!("vm-{}.log", ip));
        ensure_dir(&self.logs.vm_log_dir).await?;

        vm.start(&self.vm, &log_path)
            .await
            .with_context(|| format!("failed to start VM {}", index))?;

        let summary = VmSummary::from(&vm);
        registry.vms.insert(ip, vm);
        info!(index, %ip, tap = %summary.tap, "VM registered");
        Ok(summary)
    }

    /// Stop every running VM concurrently.
    ///
    /// Fails only if `ctx` is already canceled. Each VM gets `stop_timeout`
    /// to exit after its token is canceled; individual failures are logged.
    #[instrument(skip_all)]
    pub async fn stop_all_vms(&self, ctx: &CancellationToken) -> Result<(), VmError> {
        if ctx.is_cancelled() {
            return Err(VmError::Canceled);
        }

        let mut registry = self.registry.lock().await;
        let timeout = self.vm.stop_timeout();
        let mut stops = JoinSet::new();
        for vm in registry.vms.values_mut() {
            if let Some(process) = vm.begin_stop() {
                let (index, ip) = (vm.index, vm.ip);
                stops.spawn(stop_process(index, ip, process, timeout));
            }
        }

        let count = stops.len();
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "VM stop task panicked");
            }
        }

        for vm in registry.vms.values_mut() {
            if vm.state == VmState::Stopping {
                vm.finish_stop();
            }
        }
        info!(count, "all VMs stopped");
        Ok(())
    }

    /// Run `command` in the guest at `ip`.
    ///
    /// Dial and handshake failures are returned. Output streams in the
    /// background into `vm-<ip>-client.log` (`wait`, joined by
    /// [`Self::wait_for_clients`]) or `vm-<ip>-server.log` (detached until
    /// the VM stops).
    #[instrument(skip(self))]
    pub async fn send_command(
        &self,
        ip: Ipv4Addr,
        command: &str,
        wait: bool,
    ) -> Result<(), VmError> {
        let (socket, vm_token) = {
            let registry = self.registry.lock().await;
            let vm = registry.vms.get(&ip).ok_or(VmError::NotFound(ip))?;
            if vm.state != VmState::Running {
                return Err(anyhow!("VM {} is {}", ip, vm.state).into());
            }
            (vm.vsock_socket.clone(), vm.cancel_token().clone())
        };

        let role = if wait { "client" } else { "server" };
        ensure_dir(&self.logs.test_dir).await?;
        let log_path = self.logs.test_dir.join(format!("vm-{}-{}.log", ip, role));
        let mut log = tokio::fs::File::create(&log_path)
            .await
            .with_context(|| format!("failed to create log file {}", log_path.display()))?;

        let opened = CommandChannel::open(&socket, self.vm.guest_command_port, command).await;
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                let _ = log.write_all(format!("Error: {}\n", e).as_bytes()).await;
                let _ = log.flush().await;
                return Err(e.into());
            }
        };

        let mode = if wait {
            ChannelMode::WaitForCompletion
        } else {
            ChannelMode::RunUntilCanceled
        };
        let deadline = self.vm.command_timeout();
        let cancel = vm_token.child_token();
        let stream_cancel = cancel.clone();
        let task = async move {
            match channel.stream(&stream_cancel, mode, deadline, &mut log).await {
                Ok(StreamEnd::Closed) => {
                    info!(vm = %ip, log = %log_path.display(), "guest command completed")
                }
                Ok(StreamEnd::Canceled) => {
                    info!(vm = %ip, log = %log_path.display(), "guest command stopped")
                }
                Err(e) => {
                    let _ = log.write_all(format!("Error: {}\n", e).as_bytes()).await;
                    let _ = log.flush().await;
                    warn!(vm = %ip, error = %e, "guest command failed");
                }
            }
        };

        if wait {
            self.jobs.track_waited(task).await;
        } else {
            self.jobs.spawn(format!("vm-{}-{}", ip, role), cancel, task).await?;
        }
        Ok(())
    }

    /// Run a client command in the guest and wait until every blocking
    /// command on this manager has finished.
    pub async fn send_client_command(&self, ip: Ipv4Addr, command: &str) -> Result<(), VmError> {
        self.send_command(ip, command, true).await?;
        self.wait_for_clients().await;
        Ok(())
    }

    /// Join the wait-group of blocking guest commands.
    pub async fn wait_for_clients(&self) {
        self.jobs.join_waited().await;
    }

    /// Trace the firecracker process of the VM at `ip`.
    pub async fn track_syscalls_for(&self, ip: Ipv4Addr) -> Result<(), VmError> {
        let pid = {
            let registry = self.registry.lock().await;
            let vm = registry.vms.get(&ip).ok_or(VmError::NotFound(ip))?;
            vm.pid()
                .filter(|_| vm.state == VmState::Running)
                .ok_or_else(|| anyhow!("VM {} has no running process", ip))?
        };
        self.trace_pid(ip, pid).await?;
        Ok(())
    }

    /// Trace every running VM. A failure for one VM is logged and does not
    /// stop the others. Returns how many tracers were started.
    pub async fn track_all_syscalls(&self) -> usize {
        let targets: Vec<(Ipv4Addr, u32)> = {
            let registry = self.registry.lock().await;
            registry
                .vms
                .values()
                .filter(|vm| vm.state == VmState::Running)
                .filter_map(|vm| vm.pid().map(|pid| (vm.ip, pid)))
                .collect()
        };

        let mut started = 0;
        for (ip, pid) in targets {
            match self.trace_pid(ip, pid).await {
                Ok(()) => started += 1,
                Err(e) => warn!(vm = %ip, pid, error = %e, "failed to track syscalls"),
            }
        }
        started
    }

    async fn trace_pid(&self, ip: Ipv4Addr, pid: u32) -> Result<()> {
        ensure_dir(&self.logs.syscalls_dir).await?;
        let log_path = self.logs.syscalls_dir.join(format!("vm-{}.log", ip));
        self.tracer.track(pid, &log_path, &self.jobs).await
    }

    /// Stop all syscall tracers. VMs keep running.
    pub async fn stop_syscalls(&self) {
        self.tracer.stop().await;
    }

    /// Stop tracers, then VMs, then every remaining background job.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), VmError> {
        self.tracer.stop().await;
        let stopped = self.stop_all_vms(ctx).await;
        self.ops.cancel();
        self.jobs.shutdown(self.vm.stop_timeout()).await;
        stopped
    }

    /// Background jobs still running: detached guest commands and tracers.
    pub async fn active_jobs(&self) -> usize {
        self.jobs.active().await
    }

    pub async fn vm_count(&self) -> usize {
        self.registry.lock().await.vms.len()
    }

    /// Registered VMs ordered by index.
    pub async fn list(&self) -> Vec<VmSummary> {
        let registry = self.registry.lock().await;
        let mut vms: Vec<VmSummary> = registry.vms.values().map(VmSummary::from).collect();
        vms.sort_by_key(|vm| vm.index);
        vms
    }

    /// Log the tap, MAC and IP of every registered VM.
    pub async fn log_networking_info(&self) {
        let vms = self.list().await;
        info!(count = vms.len(), "VM networking setup");
        for vm in vms {
            info!(
                index = vm.index,
                tap = %vm.tap,
                mac = %vm.mac,
                ip = %vm.ip,
                state = %vm.state,
                "VM network binding"
            );
        }
    }
}

/// Wait for one VM's process to exit; abort it after `timeout`.
async fn stop_process(
    index: u32,
    ip: Ipv4Addr,
    process: JoinHandle<Result<()>>,
    timeout: Duration,
) {
    let abort = process.abort_handle();
    match tokio::time::timeout(timeout, process).await {
        Ok(Ok(Ok(()))) => debug!(index, %ip, "VM stopped"),
        Ok(Ok(Err(e))) => warn!(index, %ip, error = %e, "failed to stop VM"),
        Ok(Err(e)) => warn!(index, %ip, error = %e, "VM process task failed"),
        Err(_) => {
            warn!(index, %ip, ?timeout, "VM did not stop in time, killing it");
            abort.abort();
        }
    }
}

/// Kill every hypervisor process on the host matching `binary`'s file name.
pub async fn kill_hypervisors(host: &HostCommand, binary: &Path) -> Result<bool> {
    let pattern = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string_lossy().into_owned());
    host.pkill(&pattern).await
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::util::write_script;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    struct Fixture {
        dir: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        /// Config whose firecracker creates its API socket and idles, and
        /// whose tracer prints its target pid and idles.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let fc = write_script(dir.path(), "firecracker", "touch \"$2\"; exec sleep 30");
            write_script(dir.path(), "trace.sh", "echo \"tracing $1\"; exec sleep 30");

            let mut config = Config::default();
            config.vm.firecracker_binary = fc;
            config.vm.run_dir = dir.path().join("run");
            config.vm.stop_timeout_secs = 1;
            config.logs.test_dir = dir.path().join("vm-test");
            config.logs.vm_log_dir = dir.path().join("vm-logs");
            config.logs.syscalls_dir = dir.path().join("vm-syscalls");
            config.tracer = TracerConfig {
                script: dir.path().join("trace.sh"),
                use_sudo: false,
            };
            Self { dir, config }
        }

        fn manager(&self) -> VmManager {
            VmManager::new(&self.config).unwrap()
        }
    }

    fn spec(last: u8) -> VmSpec {
        VmSpec {
            ip: Ipv4Addr::new(192, 168, 100, last),
            kernel_path: PathBuf::from("/images/vmlinux"),
            rootfs_path: PathBuf::from("/images/rootfs.ext4"),
            gateway: Ipv4Addr::new(192, 168, 100, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }

    #[tokio::test]
    async fn test_vm_manager_new_starts_empty() {
        let fx = Fixture::new();
        let manager = fx.manager();
        assert_eq!(manager.vm_count().await, 0);
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_assigns_monotonic_indexes_and_rejects_duplicates() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let a = manager.create_vm(spec(2)).await.unwrap();
        let b = manager.create_vm(spec(3)).await.unwrap();
        assert_eq!((a.index, a.tap.as_str()), (0, "tap0"));
        assert_eq!((b.index, b.tap.as_str()), (1, "tap1"));
        assert_eq!(a.kernel_path, PathBuf::from("/images/vmlinux"));

        let dup = manager.create_vm(spec(2)).await.unwrap_err();
        assert!(matches!(dup, VmError::AlreadyRegistered(_)), "{dup}");
        assert_eq!(manager.vm_count().await, 2);

        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing_and_burns_the_index() {
        let mut fx = Fixture::new();
        let good = fx.config.vm.firecracker_binary.clone();
        fx.config.vm.firecracker_binary = fx.dir.path().join("missing-firecracker");
        let broken = fx.manager();

        let err = broken.create_vm(spec(2)).await.unwrap_err();
        assert!(matches!(err, VmError::Other(_)), "{err}");
        assert_eq!(broken.vm_count().await, 0);

        // Same manager state, working binary: the next index is 1, not 0.
        let manager = VmManager {
            vm: VmConfig {
                firecracker_binary: good,
                ..fx.config.vm.clone()
            },
            ..broken
        };
        let vm = manager.create_vm(spec(2)).await.unwrap();
        assert_eq!(vm.index, 1);
        assert_eq!(vm.tap, "tap1");
        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_ip_is_not_found() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let ip = Ipv4Addr::new(10, 0, 0, 9);

        assert!(matches!(
            manager.send_command(ip, "echo", true).await,
            Err(VmError::NotFound(_))
        ));
        assert!(matches!(
            manager.track_syscalls_for(ip).await,
            Err(VmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_fails_fast_on_canceled_context() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.create_vm(spec(2)).await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            manager.stop_all_vms(&ctx).await,
            Err(VmError::Canceled)
        ));
        assert_eq!(manager.list().await[0].state, VmState::Running);
        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_is_bounded_when_one_vm_hangs() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.create_vm(spec(2)).await.unwrap();
        manager.create_vm(spec(3)).await.unwrap();

        // A VM whose process never finishes, even after cancellation.
        {
            let mut registry = manager.registry.lock().await;
            let index = registry.next_index;
            registry.next_index += 1;
            let token = manager.ops.child_token();
            let mut stuck = VmInstance::new(index, spec(4), &fx.config.vm.run_dir, token);
            stuck.attach_process(1, tokio::spawn(std::future::pending::<Result<()>>()));
            registry.vms.insert(stuck.ip, stuck);
        }

        let start = tokio::time::Instant::now();
        manager.stop_all_vms(&CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());

        let vms = manager.list().await;
        assert_eq!(vms.len(), 3);
        assert!(vms.iter().all(|vm| vm.state == VmState::Stopped), "{vms:?}");
    }

    #[tokio::test]
    async fn test_client_command_output_lands_in_log() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let vm = manager.create_vm(spec(2)).await.unwrap();
        assert_eq!(vm.index, 0);

        // Stand in for the firecracker vsock socket and the guest agent.
        let vsock = fx.config.vm.run_dir.join("vsock-0.sock");
        let listener = UnixListener::bind(&vsock).unwrap();
        let guest = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut connect = String::new();
            reader.read_line(&mut connect).await.unwrap();
            let mut command = String::new();
            reader.read_line(&mut command).await.unwrap();
            let mut stream = reader.into_inner();
            stream.write_all(b"OK 1073741824\nhi\n").await.unwrap();
            (connect, command)
        });

        manager.send_client_command(vm.ip, "echo hi").await.unwrap();

        let (connect, command) = guest.await.unwrap();
        assert_eq!(connect, "CONNECT 5000\n");
        assert_eq!(command, "echo hi\n");
        let log = fx.config.logs.test_dir.join("vm-192.168.100.2-client.log");
        assert_eq!(std::fs::read_to_string(log).unwrap(), "[OUTPUT] hi\n");

        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_is_returned_and_logged() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let vm = manager.create_vm(spec(2)).await.unwrap();

        let err = manager.send_command(vm.ip, "iperf3 -s", false).await.unwrap_err();
        assert!(matches!(err, VmError::Channel(ChannelError::Dial { .. })), "{err}");

        let log = fx.config.logs.test_dir.join("vm-192.168.100.2-server.log");
        assert!(std::fs::read_to_string(log).unwrap().starts_with("Error: "));
        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracing_runs_until_stopped() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.create_vm(spec(2)).await.unwrap();
        manager.create_vm(spec(3)).await.unwrap();

        assert_eq!(manager.track_all_syscalls().await, 2);
        assert_eq!(manager.jobs.active().await, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.stop_syscalls().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.jobs.active().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "tracers still running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The VMs themselves are untouched.
        assert!(manager
            .list()
            .await
            .iter()
            .all(|vm| vm.state == VmState::Running));
        let log = fx.config.logs.syscalls_dir.join("vm-192.168.100.2.log");
        assert!(std::fs::read_to_string(log).unwrap().starts_with("[STDOUT] tracing "));

        manager.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_after_shutdown_is_canceled() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.shutdown(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            manager.create_vm(spec(2)).await,
            Err(VmError::Canceled)
        ));
    }
}
