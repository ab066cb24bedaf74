use serde::{Deserialize, Serialize};

/// Default port of the node agent's request/response API.
pub const DEFAULT_API_PORT: u16 = 50051;

/// Message returned once a blocking client command has finished.
pub const COMMAND_FINISHED: &str = "Command finished executing";

// ---------------------------------------------------------------------------
// Log file line format
// ---------------------------------------------------------------------------

/// Source tag prepended to every line written to a capture or channel log.
///
/// The tags are part of the on-disk artifact contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// Standard output of a host process.
    Stdout,
    /// Standard error of a host process.
    Stderr,
    /// Output streamed back from a guest over the command channel.
    Output,
}

impl LogTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::Stdout => "[STDOUT]",
            LogTag::Stderr => "[STDERR]",
            LogTag::Output => "[OUTPUT]",
        }
    }

    /// Format one log line. `line` may or may not carry its trailing newline;
    /// the result always ends with exactly the newline the input had, or one
    /// appended if it had none.
    pub fn format_line(self, line: &str) -> String {
        let mut out = String::with_capacity(line.len() + 10);
        out.push_str(self.as_str());
        out.push(' ');
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Guest command channel handshake
// ---------------------------------------------------------------------------

/// First line a host writes on a hybrid vsock socket to reach a guest port.
pub fn connect_line(port: u32) -> String {
    format!("CONNECT {}\n", port)
}

/// Whether `line` is the hypervisor's acknowledgement of a CONNECT request
/// (`OK <host_port>`).
pub fn is_connect_ack(line: &str) -> bool {
    let line = line.trim_end();
    match line.strip_prefix("OK ") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// VM service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub ip: String,
    pub kernel_path: String,
    pub rootfs_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub ip: String,
    pub kernel_path: String,
    pub rootfs_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmResponse {
    pub vm: VmInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCommandRequest {
    pub ip: String,
    pub command: String,
    /// Block-tracked (`true`) for commands expected to finish, detached
    /// (`false`) for long-running guest servers.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendClientCommandRequest {
    pub ip: String,
    pub command: String,
}

/// Trace one VM's hypervisor, or every running VM when `ip` is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackSyscallsRequest {
    #[serde(default)]
    pub ip: Option<String>,
}

// ---------------------------------------------------------------------------
// Network service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupNetworkRequest {
    pub vm_count: u32,
    /// Bridge address, with or without a prefix length (`/24` is assumed
    /// when absent).
    pub bridge_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupNetworkRequest {
    #[serde(default)]
    pub vm_count: u32,
}

// ---------------------------------------------------------------------------
// Node service
// ---------------------------------------------------------------------------

/// A host command given as an explicit argument vector; no shell parsing
/// is applied on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommandRequest {
    pub command: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared responses
// ---------------------------------------------------------------------------

/// Empty acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

/// Completion notice for blocking client commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub output: String,
}

impl CommandOutput {
    pub fn finished() -> Self {
        Self {
            output: COMMAND_FINISHED.to_string(),
        }
    }
}
