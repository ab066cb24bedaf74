use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureMode, CommandLine};
use crate::config::VmConfig;
use crate::network::tap_device_name;

/// First guest vsock CID; 0-2 are reserved.
const FIRST_GUEST_CID: u32 = 3;

/// Lifecycle state of a microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a caller asks for when creating a VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub ip: Ipv4Addr,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Firecracker `--config-file` contents.
#[derive(Debug, Clone, Serialize)]
pub struct FirecrackerConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    pub vsock: Vsock,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

/// Guest MAC for a VM slot: `AA:FC:00:00:00:<index+1>`.
pub fn guest_mac(index: u32) -> String {
    let n = index.wrapping_add(1);
    format!(
        "AA:FC:00:{:02X}:{:02X}:{:02X}",
        (n >> 16) & 0xff,
        (n >> 8) & 0xff,
        n & 0xff
    )
}

/// One microVM and the firecracker process backing it.
#[derive(Debug)]
pub struct VmInstance {
    pub index: u32,
    pub ip: Ipv4Addr,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub tap: String,
    pub mac: String,
    pub cid: u32,
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub config_path: PathBuf,
    pub state: VmState,
    cancel: CancellationToken,
    pid: Option<u32>,
    process: Option<JoinHandle<Result<()>>>,
}

impl VmInstance {
    /// Bind a VM slot to its tap, MAC, CID and socket paths under `run_dir`.
    pub fn new(index: u32, spec: VmSpec, run_dir: &Path, cancel: CancellationToken) -> Self {
        Self {
            index,
            ip: spec.ip,
            kernel_path: spec.kernel_path,
            rootfs_path: spec.rootfs_path,
            gateway: spec.gateway,
            netmask: spec.netmask,
            tap: tap_device_name(index),
            mac: guest_mac(index),
            cid: FIRST_GUEST_CID + index,
            api_socket: run_dir.join(format!("vm-{}.sock", index)),
            vsock_socket: run_dir.join(format!("vsock-{}.sock", index)),
            config_path: run_dir.join(format!("vm-{}.json", index)),
            state: VmState::Created,
            cancel,
            pid: None,
            process: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token canceled when this VM stops. Guest command streams use it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Kernel command line with the static guest network configuration.
    pub fn boot_args(&self, base: &str) -> String {
        format!(
            "{} ip={}::{}:{}::eth0:off",
            base.trim(),
            self.ip,
            self.gateway,
            self.netmask
        )
    }

    pub fn firecracker_config(&self, vm: &VmConfig) -> FirecrackerConfig {
        FirecrackerConfig {
            boot_source: BootSource {
                kernel_image_path: self.kernel_path.clone(),
                boot_args: self.boot_args(&vm.boot_args),
            },
            drives: vec![Drive {
                drive_id: "rootfs".into(),
                path_on_host: self.rootfs_path.clone(),
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".into(),
                guest_mac: self.mac.clone(),
                host_dev_name: self.tap.clone(),
            }],
            machine_config: MachineConfig {
                vcpu_count: vm.vcpu_count,
                mem_size_mib: vm.mem_size_mib,
            },
            vsock: Vsock {
                guest_cid: self.cid,
                uds_path: self.vsock_socket.clone(),
            },
        }
    }

    /// The firecracker invocation for this VM.
    pub fn command(&self, vm: &VmConfig) -> CommandLine {
        CommandLine::new(
            vm.firecracker_binary.to_string_lossy(),
            [
                "--api-sock".to_string(),
                self.api_socket.to_string_lossy().into_owned(),
                "--config-file".to_string(),
                self.config_path.to_string_lossy().into_owned(),
            ],
        )
    }

    /// Write the config, start firecracker and wait for its API socket.
    ///
    /// On failure the process is killed and reaped before returning.
    pub async fn start(&mut self, vm: &VmConfig, log_path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&vm.run_dir)
            .await
            .with_context(|| format!("failed to create run directory {}", vm.run_dir.display()))?;
        for stale in [&self.api_socket, &self.vsock_socket] {
            remove_if_exists(stale).await?;
        }

        let config = serde_json::to_vec_pretty(&self.firecracker_config(vm))
            .context("failed to serialize firecracker config")?;
        tokio::fs::write(&self.config_path, config)
            .await
            .with_context(|| format!("failed to write {}", self.config_path.display()))?;

        let capture = capture::run(
            self.cancel.clone(),
            &self.command(vm),
            log_path,
            CaptureMode::Detached,
        )
        .await
        .with_context(|| format!("failed to start firecracker for VM {}", self.index))?;
        let pid = capture.pid();
        let mut process = capture.into_done();
        debug!(index = self.index, pid, "firecracker spawned");

        if let Err(e) = wait_for_socket(&self.api_socket, vm.socket_timeout(), &process).await {
            self.cancel.cancel();
            if tokio::time::timeout(vm.stop_timeout(), &mut process).await.is_err() {
                process.abort();
            }
            return Err(e);
        }

        self.attach_process(pid, process);
        info!(
            index = self.index,
            ip = %self.ip,
            pid,
            socket = %self.api_socket.display(),
            "VM started"
        );
        Ok(())
    }

    pub(crate) fn attach_process(&mut self, pid: u32, process: JoinHandle<Result<()>>) {
        self.pid = Some(pid);
        self.process = Some(process);
        self.state = VmState::Running;
    }

    /// Cancel the VM and hand back its process task so the caller can await
    /// it alongside other VMs. `None` if the VM was not running.
    pub fn begin_stop(&mut self) -> Option<JoinHandle<Result<()>>> {
        if self.state != VmState::Running {
            return None;
        }
        self.state = VmState::Stopping;
        self.cancel.cancel();
        self.process.take()
    }

    /// Mark the VM stopped and remove its sockets.
    pub fn finish_stop(&mut self) {
        self.state = VmState::Stopped;
        for path in [&self.api_socket, &self.vsock_socket] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "failed to remove socket");
                }
            }
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            warn!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Wait for a socket file to appear on disk, with timeout. Fails early if
/// `process` finishes first.
pub async fn wait_for_socket(
    socket_path: &Path,
    timeout: Duration,
    process: &JoinHandle<Result<()>>,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(50);

    loop {
        if socket_path.exists() {
            return Ok(());
        }

        if process.is_finished() {
            bail!(
                "firecracker exited before its API socket appeared: {}",
                socket_path.display()
            );
        }

        if tokio::time::Instant::now() >= deadline {
            bail!(
                "API socket did not appear within {:?}: {}",
                timeout,
                socket_path.display()
            );
        }

        tokio::time::sleep(poll_interval).await;
    }
}
