use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the fcrunner node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub vm: VmConfig,
    pub logs: LogConfig,
    pub tracer: TracerConfig,
    pub node: NodeConfig,
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.network.subnet_prefix >= 8 && self.network.subnet_prefix <= 30,
            "network.subnet_prefix must be between 8 and 30"
        );
        anyhow::ensure!(
            !self.network.bridge_name.is_empty() && self.network.bridge_name.len() <= 15,
            "network.bridge_name must be 1-15 characters"
        );
        anyhow::ensure!(self.vm.vcpu_count >= 1, "vm.vcpu_count must be >= 1");
        anyhow::ensure!(self.vm.mem_size_mib >= 64, "vm.mem_size_mib must be >= 64");
        anyhow::ensure!(self.vm.max_jobs >= 1, "vm.max_jobs must be >= 1");
        anyhow::ensure!(
            self.vm.guest_command_port > 0,
            "vm.guest_command_port must be > 0"
        );
        anyhow::ensure!(
            self.shutdown.timeout_ms > 0,
            "shutdown.timeout_ms must be > 0"
        );
        Ok(())
    }
}

/// Request/response server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API listens on.
    pub bind_addr: String,
    /// Port the API listens on.
    pub port: u16,
    /// Exclusive lock file held for the lifetime of `serve`.
    pub lock_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: fcrunner_protocol::DEFAULT_API_PORT,
            lock_file: PathBuf::from("fcrunner.lock"),
        }
    }
}

/// Host networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridge device name.
    pub bridge_name: String,
    /// Bridge IP used when a setup request does not supply one. Also the
    /// gateway handed to guests.
    pub bridge_ip: Ipv4Addr,
    /// Prefix length applied to a bare bridge address.
    pub subnet_prefix: u8,
    /// Program (and leading args) every host networking command is run through.
    /// Empty runs commands directly.
    pub command_prefix: Vec<String>,
    /// Owner of created TAP devices. Defaults to `$USER` when unset.
    pub tap_owner: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "br0".into(),
            bridge_ip: Ipv4Addr::new(192, 168, 100, 1),
            subnet_prefix: 24,
            command_prefix: vec!["sudo".into()],
            tap_owner: None,
        }
    }
}

impl NetworkConfig {
    /// TAP owner to pass to `ip tuntap add`, falling back to `$USER`.
    pub fn resolved_tap_owner(&self) -> Option<String> {
        self.tap_owner
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|u| !u.is_empty())
    }
}

/// Firecracker / microVM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Path to the firecracker binary.
    pub firecracker_binary: PathBuf,
    /// Directory for API sockets, vsock sockets and config files.
    pub run_dir: PathBuf,
    /// Base kernel boot arguments; the guest `ip=` argument is appended.
    pub boot_args: String,
    /// vCPUs per VM.
    pub vcpu_count: u32,
    /// Memory per VM in MiB.
    pub mem_size_mib: u32,
    /// Guest vsock port the command agent listens on.
    pub guest_command_port: u32,
    /// Seconds to wait for the API socket after spawning firecracker.
    pub socket_timeout_secs: u64,
    /// Seconds to wait for one VM to stop before it is killed.
    pub stop_timeout_secs: u64,
    /// Deadline for blocking guest commands in seconds. 0 disables it.
    pub command_timeout_secs: u64,
    /// Maximum number of tracked background jobs per manager.
    pub max_jobs: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            firecracker_binary: PathBuf::from("firecracker"),
            run_dir: PathBuf::from("/tmp"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            vcpu_count: 1,
            mem_size_mib: 512,
            guest_command_port: 5000,
            socket_timeout_secs: 5,
            stop_timeout_secs: 5,
            command_timeout_secs: 0,
            max_jobs: 256,
        }
    }
}

impl VmConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

/// Log and temp file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Guest command channel logs.
    pub test_dir: PathBuf,
    /// Hypervisor process logs.
    pub vm_log_dir: PathBuf,
    /// VM syscall traces.
    pub syscalls_dir: PathBuf,
    /// Host command and host syscall logs.
    pub node_dir: PathBuf,
    /// Directory swept for stale temp files on cleanup.
    pub temp_dir: PathBuf,
    /// File name prefixes deleted from `temp_dir` on cleanup.
    pub temp_prefixes: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("vm-test"),
            vm_log_dir: PathBuf::from("vm-logs"),
            syscalls_dir: PathBuf::from("vm-syscalls"),
            node_dir: PathBuf::from("node-logs"),
            temp_dir: PathBuf::from("/tmp"),
            temp_prefixes: vec!["vm-".into(), "vsock-".into()],
        }
    }
}

impl LogConfig {
    /// Every log directory the filesystem cleanup recreates.
    pub fn log_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.test_dir.clone(),
            self.vm_log_dir.clone(),
            self.syscalls_dir.clone(),
            self.node_dir.clone(),
        ]
    }
}

/// Syscall tracing helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Helper script, resolved against the working directory when relative.
    pub script: PathBuf,
    /// Run the helper through `sudo`.
    pub use_sudo: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("trace_syscalls.sh"),
            use_sudo: true,
        }
    }
}

/// Host-side benchmark process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Process names killed with `pkill -f` on node cleanup.
    pub stray_processes: Vec<String>,
    /// Maximum number of tracked background jobs on the node.
    pub max_jobs: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stray_processes: vec!["iperf3".into(), "sockperf".into()],
            max_jobs: 64,
        }
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline after which the process exits regardless of pending cleanup.
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 50051);
        assert_eq!(config.network.bridge_name, "br0");
        assert_eq!(config.network.bridge_ip, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(config.network.subnet_prefix, 24);
        assert_eq!(config.network.command_prefix, vec!["sudo".to_string()]);
        assert_eq!(config.vm.firecracker_binary, PathBuf::from("firecracker"));
        assert_eq!(config.vm.guest_command_port, 5000);
        assert_eq!(config.logs.test_dir, PathBuf::from("vm-test"));
        assert_eq!(config.logs.syscalls_dir, PathBuf::from("vm-syscalls"));
        assert_eq!(config.logs.node_dir, PathBuf::from("node-logs"));
        assert_eq!(config.tracer.script, PathBuf::from("trace_syscalls.sh"));
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_load_from_toml() {
        let toml_content = r#"
[server]
port = 6000

[network]
bridge_name = "br-test"
bridge_ip = "10.0.0.1"
command_prefix = []

[vm]
vcpu_count = 2
command_timeout_secs = 30
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.network.bridge_name, "br-test");
        assert_eq!(config.network.bridge_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert!(config.network.command_prefix.is_empty());
        assert_eq!(config.vm.vcpu_count, 2);
        assert_eq!(config.vm.command_timeout(), Some(Duration::from_secs(30)));
        // Unset fields use defaults
        assert_eq!(config.network.subnet_prefix, 24);
        assert_eq!(config.vm.mem_size_mib, 512);
    }

    #[test]
    fn test_config_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[network\nbridge_name = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_config_validation_rejects_bad_subnet_prefix() {
        let mut config = Config::default();
        config.network.subnet_prefix = 31;
        assert!(config.validate().is_err());

        config.network.subnet_prefix = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_long_bridge_name() {
        let mut config = Config::default();
        config.network.bridge_name = "a-very-long-bridge-name".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_jobs() {
        let mut config = Config::default();
        config.vm.max_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_timeout_zero_disables() {
        let config = VmConfig::default();
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn test_explicit_tap_owner_wins() {
        let config = NetworkConfig {
            tap_owner: Some("runner".into()),
            ..NetworkConfig::default()
        };
        assert_eq!(config.resolved_tap_owner().as_deref(), Some("runner"));
    }

    #[test]
    fn test_log_dirs_lists_all_four() {
        let dirs = LogConfig::default().log_dirs();
        assert_eq!(dirs.len(), 4);
        assert!(dirs.contains(&PathBuf::from("vm-logs")));
    }
}
