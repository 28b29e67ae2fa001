use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Bridge used for VLAN tag 0 when no name is configured.
pub const DEFAULT_BRIDGE_NAME: &str = "docker";
/// Prefix for per-tag bridge names.
pub const DEFAULT_BRIDGE_PREFIX: &str = "docker";
/// Prefix for VLAN sub-interface names.
pub const DEFAULT_VLAN_PREFIX: &str = "vlan";

/// How pod traffic reaches the physical network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    /// Veth pairs attached to per-VLAN bridges.
    #[default]
    #[serde(alias = "")]
    Bridge,
    /// Macvlan sub-interfaces on the VLAN device.
    Macvlan,
    /// Ipvlan sub-interfaces on the VLAN device.
    Ipvlan,
    /// No bridges at all; proxy-ARP and non-local bind carry the traffic.
    Pure,
}

/// Network configuration for the provisioning agent
///
/// Loaded once at startup and immutable afterwards. Carries the base CNI
/// fields for wire compatibility plus the topology parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Physical interface the host topology hangs off
    #[serde(default)]
    pub device: String,
    /// Switch mode, bridge if absent
    #[serde(default)]
    pub switch: SwitchMode,
    /// Tri-state: absent keeps default behavior, false/true are explicit
    #[serde(default)]
    pub disable_default_bridge: Option<bool>,
    /// Bridge used for VLAN tag 0
    #[serde(default)]
    pub default_bridge_name: String,
    /// Prefix for per-tag bridge names
    #[serde(default)]
    pub bridge_name_prefix: String,
    /// Prefix for VLAN sub-interface names
    #[serde(default)]
    pub vlan_name_prefix: String,
    /// Configuration handed verbatim to the delegate plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<serde_json::Value>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: NetConf =
            serde_json::from_slice(bytes).context("Failed to parse network configuration")?;

        if conf.device.is_empty() {
            anyhow::bail!("Physical device name is required");
        }

        // Empty strings count as unset, same as absent fields.
        if conf.default_bridge_name.is_empty() {
            conf.default_bridge_name = DEFAULT_BRIDGE_NAME.to_string();
        }
        if conf.bridge_name_prefix.is_empty() {
            conf.bridge_name_prefix = DEFAULT_BRIDGE_PREFIX.to_string();
        }
        if conf.vlan_name_prefix.is_empty() {
            conf.vlan_name_prefix = DEFAULT_VLAN_PREFIX.to_string();
        }

        Ok(conf)
    }

    /// Load and parse NetConf from a file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read network configuration {}", path.display()))?;
        Self::parse(&bytes)
    }

    pub fn is_macvlan(&self) -> bool {
        self.switch == SwitchMode::Macvlan
    }

    pub fn is_ipvlan(&self) -> bool {
        self.switch == SwitchMode::Ipvlan
    }

    pub fn is_pure(&self) -> bool {
        self.switch == SwitchMode::Pure
    }

    /// Whether the operator explicitly opted out of the default bridge
    pub fn default_bridge_disabled(&self) -> bool {
        self.disable_default_bridge == Some(true)
    }

    /// Bridge name a veth endpoint for `tag` should attach to
    ///
    /// Empty for tag 0 in pure mode, where no bridge backs untagged traffic.
    pub fn bridge_name_for_vlan(&self, tag: u16) -> String {
        if tag == 0 && self.is_pure() {
            return String::new();
        }
        if tag == 0 {
            self.default_bridge_name.clone()
        } else {
            format!("{}{}", self.bridge_name_prefix, tag)
        }
    }

    /// Name of the VLAN sub-interface for `tag`
    pub fn vlan_name_for(&self, tag: u16) -> String {
        format!("{}{}", self.vlan_name_prefix, tag)
    }
}
