use std::process::Output;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Runs host commands through an optional privilege prefix such as `sudo`.
///
/// With an empty prefix the program is executed directly.
#[derive(Debug, Clone, Default)]
pub struct HostCommand {
    prefix: Vec<String>,
}

impl HostCommand {
    pub fn new(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    /// Full argv for `program args...` after the prefix is applied.
    pub fn argv(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut argv = self.prefix.clone();
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    /// Run a command and return its output regardless of exit status.
    pub async fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
        let argv = self.argv(program, args);
        debug!(argv = ?argv, "running host command");

        Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .with_context(|| format!("failed to execute {}", program))
    }

    /// Run a command and fail with its trimmed stderr on non-zero exit.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = self.output(program, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed: {}",
                program,
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(())
    }

    /// Run a command and return its stdout on success.
    pub async fn stdout(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", program, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `pkill -f <pattern>`. Exit status 1 means nothing matched and is not
    /// an error.
    pub async fn pkill(&self, pattern: &str) -> Result<bool> {
        let output = self.output("pkill", &["-f", pattern]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("pkill -f {} failed: {}", pattern, stderr.trim());
            }
        }
    }
}

/// Write an executable shell script for tests that stand in for host tools.
#[cfg(test)]
pub(crate) fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
