use std::fmt;
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::util::HostCommand;

/// Bridge address in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeAddress {
    ip: Ipv4Addr,
    prefix: u8,
}

impl BridgeAddress {
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            bail!("invalid prefix length /{}", prefix);
        }
        Ok(Self { ip, prefix })
    }

    /// Parse `a.b.c.d` or `a.b.c.d/len`; a bare address gets `default_prefix`.
    pub fn parse(input: &str, default_prefix: u8) -> Result<Self> {
        let input = input.trim();
        let (addr, prefix) = match input.split_once('/') {
            Some((addr, len)) => {
                let len: u8 = len
                    .parse()
                    .with_context(|| format!("invalid prefix length in {:?}", input))?;
                (addr, len)
            }
            None => (input, default_prefix),
        };
        let ip: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid bridge address {:?}", input))?;
        Self::new(ip, prefix)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Network address with host bits cleared, e.g. `192.168.100.0/24`.
    pub fn subnet(&self) -> String {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        let network = Ipv4Addr::from(u32::from(self.ip) & mask);
        format!("{}/{}", network, self.prefix)
    }

    /// Dotted netmask, e.g. `255.255.255.0`.
    pub fn netmask(&self) -> Ipv4Addr {
        if self.prefix == 0 {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::from(u32::MAX << (32 - u32::from(self.prefix)))
        }
    }
}

impl fmt::Display for BridgeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

/// TAP device name for a VM slot.
pub fn tap_device_name(index: u32) -> String {
    format!("tap{}", index)
}

/// Bridge and TAP device manager.
///
/// All operations shell out to `ip` through the configured command prefix.
#[derive(Debug, Clone)]
pub struct BridgeManager {
    bridge_name: String,
    host: HostCommand,
}

impl BridgeManager {
    pub fn new(bridge_name: String, host: HostCommand) -> Self {
        Self { bridge_name, host }
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }

    /// Create the bridge and bring it up.
    ///
    /// A failed create is assumed to mean the bridge already exists. Failing
    /// to bring it up is fatal.
    #[instrument(skip(self))]
    pub async fn ensure_bridge(&self) -> Result<()> {
        match self
            .host
            .run("ip", &["link", "add", "name", &self.bridge_name, "type", "bridge"])
            .await
        {
            Ok(()) => info!(bridge = %self.bridge_name, "bridge created"),
            Err(e) => info!(
                bridge = %self.bridge_name,
                error = %e,
                "bridge creation failed (might already exist)"
            ),
        }

        self.set_link_up(&self.bridge_name)
            .await
            .with_context(|| format!("failed to bring up bridge {}", self.bridge_name))?;
        Ok(())
    }

    /// Create a TAP device, attach it to the bridge and bring it up.
    ///
    /// `on_created` runs once the device exists, before it is attached, so
    /// the caller can track it for cleanup even if a later step fails.
    #[instrument(skip(self, on_created))]
    pub async fn create_tap(
        &self,
        tap_name: &str,
        owner: Option<&str>,
        on_created: impl FnOnce(&str),
    ) -> Result<()> {
        let mut args = vec!["tuntap", "add", "dev", tap_name, "mode", "tap"];
        if let Some(owner) = owner {
            args.extend(["user", owner]);
        }
        self.host
            .run("ip", &args)
            .await
            .with_context(|| format!("failed to create tap interface {}", tap_name))?;
        on_created(tap_name);

        self.host
            .run("ip", &["link", "set", tap_name, "master", &self.bridge_name])
            .await
            .with_context(|| format!("failed to add {} to bridge {}", tap_name, self.bridge_name))?;

        self.set_link_up(tap_name)
            .await
            .with_context(|| format!("failed to bring up {}", tap_name))?;

        debug!(tap = %tap_name, bridge = %self.bridge_name, "tap created and attached");
        Ok(())
    }

    /// Delete a network link (tap or bridge).
    pub async fn delete_link(&self, name: &str) -> Result<()> {
        self.host
            .run("ip", &["link", "delete", name])
            .await
            .with_context(|| format!("failed to delete {}", name))
    }

    /// Delete the bridge itself.
    pub async fn delete_bridge(&self) -> Result<()> {
        self.delete_link(&self.bridge_name).await
    }

    /// Whether the bridge already carries `address`.
    pub async fn has_address(&self, address: &BridgeAddress) -> bool {
        match self
            .host
            .stdout("ip", &["-4", "addr", "show", "dev", &self.bridge_name])
            .await
        {
            Ok(out) => {
                let needle = address.to_string();
                out.split_whitespace().any(|tok| tok == needle)
            }
            Err(e) => {
                debug!(bridge = %self.bridge_name, error = %e, "could not list bridge addresses");
                false
            }
        }
    }

    /// Assign `address` to the bridge unless it is already present.
    /// A failed assignment is logged, not returned.
    #[instrument(skip(self))]
    pub async fn assign_address(&self, address: &BridgeAddress) {
        if self.has_address(address).await {
            debug!(bridge = %self.bridge_name, %address, "bridge address already present");
            return;
        }
        let cidr = address.to_string();
        match self
            .host
            .run("ip", &["addr", "add", &cidr, "dev", &self.bridge_name])
            .await
        {
            Ok(()) => info!(bridge = %self.bridge_name, %address, "bridge address assigned"),
            Err(e) => warn!(
                bridge = %self.bridge_name,
                %address,
                error = %e,
                "failed to add IP to bridge (might already exist)"
            ),
        }
    }

    async fn set_link_up(&self, device: &str) -> Result<()> {
        self.host.run("ip", &["link", "set", device, "up"]).await
    }
}

/// Enable IP forwarding on the host. Required for NAT to work.
pub async fn enable_ip_forwarding(host: &HostCommand) -> Result<()> {
    host.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])
        .await
        .context("failed to enable IP forwarding")?;
    debug!("IP forwarding enabled");
    Ok(())
}
