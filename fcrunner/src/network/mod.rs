pub mod bridge;
pub mod firewall;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

pub use bridge::{tap_device_name, BridgeAddress, BridgeManager};
pub use firewall::FirewallRule;

use crate::config::NetworkConfig;
use crate::util::HostCommand;

/// Resources created by the last setup, tracked so cleanup can reverse them.
#[derive(Debug)]
struct Provisioned {
    bridge: BridgeManager,
    address: BridgeAddress,
    taps: Vec<String>,
    rules: Vec<FirewallRule>,
}

/// Failures collected by [`NetworkController::cleanup`]. Cleanup never stops
/// early, so this lists every resource that could not be removed.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Host networking for a node: one bridge, one tap per VM slot, forwarding
/// and firewall rules.
pub struct NetworkController {
    config: NetworkConfig,
    host: HostCommand,
    state: Option<Provisioned>,
}

impl NetworkController {
    pub fn new(config: NetworkConfig) -> Self {
        let host = HostCommand::new(config.command_prefix.clone());
        Self {
            config,
            host,
            state: None,
        }
    }

    /// Bridge address of the current setup, if any.
    pub fn address(&self) -> Option<BridgeAddress> {
        self.state.as_ref().map(|s| s.address)
    }

    /// Taps created so far, in creation order.
    pub fn taps(&self) -> &[String] {
        self.state.as_ref().map(|s| s.taps.as_slice()).unwrap_or(&[])
    }

    /// Provision the bridge and `vm_count` taps.
    ///
    /// Bridge bring-up and tap creation failures are returned; taps created
    /// before the failure stay tracked for cleanup. Address assignment,
    /// forwarding and firewall failures are logged only.
    #[instrument(skip(self))]
    pub async fn setup(
        &mut self,
        vm_count: u32,
        bridge_name: &str,
        address: BridgeAddress,
    ) -> Result<()> {
        let bridge = BridgeManager::new(bridge_name.to_string(), self.host.clone());

        // Reuse the tracked taps when setting up the same bridge again.
        let taps = match self.state.take() {
            Some(prev) if prev.bridge.bridge_name() == bridge_name => prev.taps,
            Some(prev) => {
                warn!(
                    previous = %prev.bridge.bridge_name(),
                    "replacing previous network setup without cleanup"
                );
                prev.taps
            }
            None => Vec::new(),
        };
        let rules = firewall::bridge_rules(bridge_name, &address.subnet());
        let state = self.state.insert(Provisioned {
            bridge,
            address,
            taps,
            rules: Vec::new(),
        });

        state
            .bridge
            .ensure_bridge()
            .await
            .context("failed to setup bridge")?;

        let owner = self.config.resolved_tap_owner();
        for index in 0..vm_count {
            let tap = tap_device_name(index);
            let tracked = &mut state.taps;
            state
                .bridge
                .create_tap(&tap, owner.as_deref(), |name| {
                    if !tracked.iter().any(|t| t == name) {
                        tracked.push(name.to_string());
                    }
                })
                .await
                .with_context(|| format!("failed to add {} to bridge", tap))?;
        }

        state.bridge.assign_address(&address).await;

        if let Err(e) = bridge::enable_ip_forwarding(&self.host).await {
            warn!(error = %e, "IP forwarding could not be enabled");
        }

        let failed = firewall::install(&self.host, &rules).await;
        state.rules = rules;

        info!(
            bridge = %bridge_name,
            vm_count,
            failed_rules = failed,
            "networking setup completed"
        );
        Ok(())
    }

    /// Remove taps, the bridge and firewall rules.
    ///
    /// Deletes the tracked taps plus `tap0..tap<extra_vm_count-1>`, so a node
    /// restarted since setup can still clean up. Every step is attempted.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self, extra_vm_count: u32) -> CleanupReport {
        let mut report = CleanupReport::default();
        let state = self.state.take();

        let bridge = match &state {
            Some(s) => s.bridge.clone(),
            None => BridgeManager::new(self.config.bridge_name.clone(), self.host.clone()),
        };

        let mut taps: Vec<String> = state.as_ref().map(|s| s.taps.clone()).unwrap_or_default();
        for index in 0..extra_vm_count {
            let tap = tap_device_name(index);
            if !taps.contains(&tap) {
                taps.push(tap);
            }
        }

        for tap in &taps {
            if let Err(e) = bridge.delete_link(tap).await {
                warn!(tap = %tap, error = %e, "failed to delete tap, might already be deleted");
                report.failures.push(format!("{:#}", e));
            }
        }

        if let Err(e) = bridge.delete_bridge().await {
            warn!(
                bridge = %bridge.bridge_name(),
                error = %e,
                "failed to delete bridge, might already be deleted"
            );
            report.failures.push(format!("{:#}", e));
        }

        if let Some(state) = &state {
            report
                .failures
                .extend(firewall::remove(&self.host, &state.rules).await);
        }

        info!(
            taps = taps.len(),
            failures = report.failures.len(),
            "networking cleanup completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::write_script;
    use std::path::PathBuf;

    struct Recorder {
        _dir: tempfile::TempDir,
        log: PathBuf,
        controller: NetworkController,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    /// A controller whose host commands are recorded by a fake prefix
    /// script. Commands matching `fail` exit 1; `addr show` prints `addrs`.
    fn recorder(fail: Option<&str>, addrs: &str) -> Recorder {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let body = format!(
            "echo \"$*\" >> '{log}'\ncase \"$*\" in\n  *\"addr show\"*) echo '{addrs}'; exit 0 ;;\n  *\"{fail}\"*) echo 'injected failure' >&2; exit 1 ;;\nesac\nexit 0",
            log = log.display(),
            addrs = addrs,
            fail = fail.unwrap_or("__never__"),
        );
        let fake = write_script(dir.path(), "fake-sudo", &body);
        let config = NetworkConfig {
            command_prefix: vec![fake.to_string_lossy().into_owned()],
            tap_owner: Some("tester".into()),
            ..NetworkConfig::default()
        };
        Recorder {
            _dir: dir,
            log,
            controller: NetworkController::new(config),
        }
    }

    fn addr() -> BridgeAddress {
        BridgeAddress::parse("192.168.100.1", 24).unwrap()
    }

    fn position(calls: &[String], needle: &str) -> usize {
        calls
            .iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("missing call {needle:?} in {calls:#?}"))
    }

    #[tokio::test]
    async fn test_setup_creates_bridge_taps_address_and_rules() {
        let mut rec = recorder(None, "");
        rec.controller.setup(2, "br0", addr()).await.unwrap();
        let calls = rec.calls();

        let bridge_up = position(&calls, "ip link set br0 up");
        let tap0 = position(&calls, "ip tuntap add dev tap0 mode tap user tester");
        let tap0_master = position(&calls, "ip link set tap0 master br0");
        let tap0_up = position(&calls, "ip link set tap0 up");
        let tap1 = position(&calls, "ip tuntap add dev tap1 mode tap user tester");
        let addr_add = position(&calls, "ip addr add 192.168.100.1/24 dev br0");
        let forward = position(&calls, "sysctl -w net.ipv4.ip_forward=1");
        let nat = position(
            &calls,
            "iptables -t nat -A POSTROUTING -s 192.168.100.0/24 ! -d 192.168.100.0/24 -j MASQUERADE",
        );

        assert!(position(&calls, "ip link add name br0 type bridge") < bridge_up);
        assert!(bridge_up < tap0);
        assert!(tap0 < tap0_master && tap0_master < tap0_up && tap0_up < tap1);
        assert!(tap1 < addr_add && addr_add < forward && forward < nat);
        assert_eq!(rec.controller.taps(), &["tap0".to_string(), "tap1".to_string()]);
    }

    #[tokio::test]
    async fn test_setup_then_cleanup_removes_everything_it_created() {
        for vm_count in [0u32, 1, 3] {
            let mut rec = recorder(None, "");
            rec.controller.setup(vm_count, "br0", addr()).await.unwrap();
            let report = rec.controller.cleanup(0).await;
            assert!(report.is_clean(), "{:?}", report.failures);
            let calls = rec.calls();

            for index in 0..vm_count {
                position(&calls, &format!("ip link delete tap{index}"));
            }
            position(&calls, "ip link delete br0");

            let installs: Vec<&String> = calls
                .iter()
                .filter(|c| c.starts_with("iptables") && !c.contains(" -D "))
                .collect();
            let deletes = calls.iter().filter(|c| c.contains(" -D ")).count();
            assert_eq!(installs.len(), deletes);
            assert!(rec.controller.taps().is_empty());
        }
    }

    #[tokio::test]
    async fn test_bridge_create_failure_is_benign() {
        let mut rec = recorder(Some("link add name br0"), "");
        rec.controller.setup(1, "br0", addr()).await.unwrap();
        position(&rec.calls(), "ip link set tap0 up");
    }

    #[tokio::test]
    async fn test_bridge_up_failure_is_fatal() {
        let mut rec = recorder(Some("set br0 up"), "");
        let err = rec.controller.setup(2, "br0", addr()).await.unwrap_err();
        assert!(format!("{err:#}").contains("bridge"), "{err:#}");
        assert!(!rec.calls().iter().any(|c| c.contains("tuntap")));
    }

    #[tokio::test]
    async fn test_tap_failure_aborts_setup_and_keeps_earlier_taps_tracked() {
        let mut rec = recorder(Some("set tap1 master"), "");
        let err = rec.controller.setup(3, "br0", addr()).await.unwrap_err();
        assert!(format!("{err:#}").contains("tap1"), "{err:#}");

        let calls = rec.calls();
        assert!(!calls.iter().any(|c| c.contains("tap2")));
        assert!(!calls.iter().any(|c| c.starts_with("iptables")));
        assert_eq!(rec.controller.taps(), &["tap0".to_string(), "tap1".to_string()]);

        rec.controller.cleanup(0).await;
        let calls = rec.calls();
        position(&calls, "ip link delete tap0");
        position(&calls, "ip link delete tap1");
    }

    #[tokio::test]
    async fn test_rule_failures_do_not_abort_setup() {
        let mut rec = recorder(Some("iptables"), "");
        rec.controller.setup(1, "br0", addr()).await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_address_is_not_added_again() {
        let addrs = "    inet 192.168.100.1/24 brd 192.168.100.255 scope global br0";
        let mut rec = recorder(None, addrs);
        rec.controller.setup(0, "br0", addr()).await.unwrap();
        assert!(!rec.calls().iter().any(|c| c.starts_with("ip addr add")));
    }

    #[tokio::test]
    async fn test_cleanup_attempts_every_resource_and_reports_failures() {
        let mut rec = recorder(Some("link delete"), "");
        let report = rec.controller.cleanup(2).await;
        // tap0, tap1 and the bridge all fail, all are attempted.
        assert_eq!(report.failures.len(), 3);
        let calls = rec.calls();
        position(&calls, "ip link delete tap0");
        position(&calls, "ip link delete tap1");
        position(&calls, "ip link delete br0");
    }
}
