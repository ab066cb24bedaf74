//! The `check` subcommand: verify host prerequisites without starting the
//! agent.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;
use crate::trace::Tracer;

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `fcrunner check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_kvm(),
        check_tool(
            "Firecracker",
            &config.vm.firecracker_binary.to_string_lossy(),
            "--version",
            "Install firecracker and set vm.firecracker_binary",
        ),
        check_tool("iproute2", "ip", "-V", "Install iproute2: apt install iproute2"),
        check_tool("iptables", "iptables", "--version", "Install iptables: apt install iptables"),
        check_tracer(config),
        check_dir("Run directory", &config.vm.run_dir),
        check_dir("Temp directory", &config.logs.temp_dir),
    ];

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: fcrunner serve --config config.toml");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_kvm() -> Check {
    let path = "/dev/kvm";
    match std::fs::metadata(path) {
        Ok(meta) => {
            use std::os::unix::fs::FileTypeExt;
            if meta.file_type().is_char_device() {
                Check::pass("KVM device", path)
            } else {
                Check::fail(
                    "KVM device",
                    format!("{} exists but is not a character device", path),
                    "Load the KVM kernel module: modprobe kvm_intel (or kvm_amd)",
                )
            }
        }
        Err(e) => Check::fail(
            "KVM device",
            format!("{}: {}", path, e),
            "Load the KVM kernel module: modprobe kvm_intel (or kvm_amd)",
        ),
    }
}

/// Run `program version_flag` and report the first line of its output.
fn check_tool(label: &'static str, program: &str, version_flag: &str, fix: &str) -> Check {
    match std::process::Command::new(program).arg(version_flag).output() {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let version = stdout.lines().next().unwrap_or("unknown").trim().to_string();
            Check::pass(label, version)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(label, format!("{} exited with error: {}", program, stderr.trim()), fix)
        }
        Err(e) => Check::fail(label, format!("{} not found: {}", program, e), fix),
    }
}

fn check_tracer(config: &Config) -> Check {
    let path = match Tracer::new(&config.tracer) {
        Ok(tracer) => tracer.helper().to_path_buf(),
        Err(e) => {
            return Check::fail(
                "Syscall tracer",
                format!("{:#}", e),
                "Run fcrunner from an existing directory",
            )
        }
    };
    match std::fs::metadata(&path) {
        Ok(meta) => {
            use std::os::unix::fs::PermissionsExt;
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                Check::pass("Syscall tracer", path.display().to_string())
            } else {
                Check::fail(
                    "Syscall tracer",
                    format!("{} is not executable", path.display()),
                    format!("chmod +x {}", path.display()),
                )
            }
        }
        Err(e) => Check::fail(
            "Syscall tracer",
            format!("{}: {}", path.display(), e),
            "Set tracer.script to the strace wrapper, or run fcrunner from its directory",
        ),
    }
}

fn check_dir(label: &'static str, dir: &Path) -> Check {
    if dir.is_dir() {
        Check::pass(label, dir.display().to_string())
    } else {
        Check::fail(
            label,
            format!("{} does not exist", dir.display()),
            format!("mkdir -p {}", dir.display()),
        )
    }
}

/// Load the config at `config_path`, or defaults when none is given.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}
