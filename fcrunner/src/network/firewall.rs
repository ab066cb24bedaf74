use tracing::{debug, warn};

use crate::util::HostCommand;

/// How a rule is added to its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// `-I <chain>` at the head.
    Insert,
    /// `-I <chain> <n>`.
    InsertAt(u32),
    /// `-A <chain>` at the tail.
    Append,
}

/// One iptables rule installed for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    table: Option<&'static str>,
    chain: &'static str,
    placement: Placement,
    spec: Vec<String>,
}

impl FirewallRule {
    fn new(chain: &'static str, placement: Placement, spec: &[&str]) -> Self {
        Self {
            table: None,
            chain,
            placement,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn in_table(mut self, table: &'static str) -> Self {
        self.table = Some(table);
        self
    }

    /// Arguments that install the rule.
    pub fn install_args(&self) -> Vec<String> {
        let mut args = self.table_args();
        match self.placement {
            Placement::Insert => args.extend(["-I".to_string(), self.chain.to_string()]),
            Placement::InsertAt(n) => {
                args.extend(["-I".to_string(), self.chain.to_string(), n.to_string()])
            }
            Placement::Append => args.extend(["-A".to_string(), self.chain.to_string()]),
        }
        args.extend(self.spec.iter().cloned());
        args
    }

    /// Arguments that remove the rule.
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = self.table_args();
        args.extend(["-D".to_string(), self.chain.to_string()]);
        args.extend(self.spec.iter().cloned());
        args
    }

    fn table_args(&self) -> Vec<String> {
        match self.table {
            Some(table) => vec!["-t".to_string(), table.to_string()],
            None => Vec::new(),
        }
    }
}

/// Rules that let guests on `bridge` reach the host, each other and the
/// outside world through `subnet`.
pub fn bridge_rules(bridge: &str, subnet: &str) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    for chain in ["INPUT", "FORWARD"] {
        for proto in ["udp", "tcp", "icmp"] {
            rules.push(FirewallRule::new(
                chain,
                Placement::Insert,
                &["-i", bridge, "-p", proto, "-j", "ACCEPT"],
            ));
        }
    }
    rules.push(FirewallRule::new(
        "FORWARD",
        Placement::Insert,
        &["-o", bridge, "-p", "icmp", "-j", "ACCEPT"],
    ));
    rules.push(FirewallRule::new(
        "FORWARD",
        Placement::InsertAt(1),
        &["-i", bridge, "-o", bridge, "-j", "ACCEPT"],
    ));
    rules.push(
        FirewallRule::new(
            "POSTROUTING",
            Placement::Append,
            &["-s", subnet, "!", "-d", subnet, "-j", "MASQUERADE"],
        )
        .in_table("nat"),
    );
    rules
}

/// Install `rules`. Failures are logged, never returned, since a rule may
/// already be present. Returns the number of rules that failed.
pub async fn install(host: &HostCommand, rules: &[FirewallRule]) -> usize {
    let mut failed = 0;
    for rule in rules {
        let args = rule.install_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match host.run("iptables", &args).await {
            Ok(()) => debug!(rule = ?args, "iptables rule installed"),
            Err(e) => {
                failed += 1;
                warn!(rule = ?args, error = %e, "iptables command failed (might already exist)");
            }
        }
    }
    failed
}

/// Remove `rules`, attempting every one. Returns a message per failure.
pub async fn remove(host: &HostCommand, rules: &[FirewallRule]) -> Vec<String> {
    let mut failures = Vec::new();
    for rule in rules {
        let args = rule.delete_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        if let Err(e) = host.run("iptables", &args).await {
            debug!(rule = ?args, error = %e, "failed to remove iptables rule");
            failures.push(format!("iptables {}: {:#}", args.join(" "), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: Vec<String>) -> String {
        args.join(" ")
    }

    #[test]
    fn test_bridge_rules_cover_input_forward_and_nat() {
        let rules = bridge_rules("br0", "192.168.100.0/24");
        let installs: Vec<String> = rules.iter().map(|r| joined(r.install_args())).collect();

        assert_eq!(installs.len(), 9);
        assert!(installs.contains(&"-I INPUT -i br0 -p udp -j ACCEPT".to_string()));
        assert!(installs.contains(&"-I INPUT -i br0 -p icmp -j ACCEPT".to_string()));
        assert!(installs.contains(&"-I FORWARD -i br0 -p tcp -j ACCEPT".to_string()));
        assert!(installs.contains(&"-I FORWARD -o br0 -p icmp -j ACCEPT".to_string()));
        assert!(installs.contains(&"-I FORWARD 1 -i br0 -o br0 -j ACCEPT".to_string()));
        assert_eq!(
            installs.last().unwrap(),
            "-t nat -A POSTROUTING -s 192.168.100.0/24 ! -d 192.168.100.0/24 -j MASQUERADE"
        );
    }

    #[test]
    fn test_delete_args_mirror_install_args() {
        for rule in bridge_rules("br0", "10.0.0.0/24") {
            let install = joined(rule.install_args());
            let delete = joined(rule.delete_args());
            assert!(delete.contains("-D "), "{delete}");
            // Same match spec, minus the position argument.
            let spec = joined(rule.spec.clone());
            assert!(install.ends_with(&spec));
            assert!(delete.ends_with(&spec));
        }
    }

    #[test]
    fn test_nat_delete_keeps_table() {
        let rules = bridge_rules("br0", "10.0.0.0/24");
        let nat = rules.last().unwrap();
        assert_eq!(
            joined(nat.delete_args()),
            "-t nat -D POSTROUTING -s 10.0.0.0/24 ! -d 10.0.0.0/24 -j MASQUERADE"
        );
    }
}
