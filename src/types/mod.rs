use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// CNI lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    /// Parse the CNI_COMMAND value; anything but ADD/DEL is rejected here,
    /// before any side effect.
    pub fn parse(cmd: &str) -> Result<Self> {
        match cmd {
            "ADD" => Ok(CniCommand::Add),
            "DEL" => Ok(CniCommand::Del),
            other => anyhow::bail!("Unknown CNI command: {}", other),
        }
    }
}

impl fmt::Display for CniCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CniCommand::Add => write!(f, "ADD"),
            CniCommand::Del => write!(f, "DEL"),
        }
    }
}

/// Wire form of one request on the /cni endpoint
///
/// Mirrors what a CNI shim forwards: the CNI_* environment it was invoked
/// with plus its stdin network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRequest {
    /// CNI_* environment variables
    pub env: HashMap<String, String>,
    /// Raw network configuration from the shim's stdin
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One CNI invocation, parsed
#[derive(Debug, Clone)]
pub struct PodRequest {
    /// Lifecycle command
    pub command: CniCommand,
    /// Container ID
    pub container_id: String,
    /// Network namespace path, may be empty on DEL
    pub netns: String,
    /// Interface name inside the namespace
    pub ifname: String,
    /// Raw port-spec string, empty when the pod exposes nothing
    pub port_spec: String,
    /// Remaining CNI_ARGS key-value pairs
    pub args: HashMap<String, String>,
    /// CNI plugin search path
    pub path: String,
    /// Raw network configuration forwarded by the shim
    pub config: serde_json::Value,
}

impl CniRequest {
    /// Convert the wire form into a PodRequest
    pub fn into_pod_request(mut self) -> Result<PodRequest> {
        let command = self
            .env
            .remove("CNI_COMMAND")
            .context("CNI_COMMAND not found in request environment")?;
        let command = CniCommand::parse(&command)?;

        let container_id = self
            .env
            .remove("CNI_CONTAINERID")
            .context("CNI_CONTAINERID not found in request environment")?;

        let netns = self.env.remove("CNI_NETNS").unwrap_or_default();
        let ifname = self
            .env
            .remove("CNI_IFNAME")
            .unwrap_or_else(|| "eth0".to_string());
        let path = self.env.remove("CNI_PATH").unwrap_or_default();

        let args_str = self.env.remove("CNI_ARGS").unwrap_or_default();
        let mut args = parse_cni_args(&args_str);
        let port_spec = args.remove("PORTS").unwrap_or_default();

        Ok(PodRequest {
            command,
            container_id,
            netns,
            ifname,
            port_spec,
            args,
            path,
            config: self.config,
        })
    }
}

impl PodRequest {
    /// VLAN tag requested via CNI_ARGS, 0 when absent
    pub fn vlan_tag(&self) -> Result<u16> {
        let Some(raw) = self.args.get("VLAN") else {
            return Ok(0);
        };
        let tag: u16 = raw
            .parse()
            .with_context(|| format!("Invalid VLAN tag {:?}", raw))?;
        if tag > 4094 {
            anyhow::bail!("Invalid VLAN tag {} (must be at most 4094)", tag);
        }
        Ok(tag)
    }
}

impl fmt::Display for PodRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} container {} netns {:?}",
            self.command, self.container_id, self.netns
        )?;
        if !self.port_spec.is_empty() {
            write!(f, " ports {}", self.port_spec)?;
        }
        Ok(())
    }
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();

    if !args_str.is_empty() {
        for pair in args_str.split(';') {
            if let Some(idx) = pair.find('=') {
                let key = pair[..idx].to_string();
                let value = pair[idx + 1..].to_string();
                args.insert(key, value);
            }
        }
    }

    args
}

/// IP allocation result reported by a delegate (CNI 1.0.0 shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    pub dns: Option<DNS>,
    /// Routes to configure
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    pub nameservers: Option<Vec<String>>,
    /// DNS search domains
    pub search: Option<Vec<String>>,
    /// DNS options
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    pub gw: Option<String>,
}

impl AllocationResult {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            dns: None,
            routes: None,
        }
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// First IPv4 address allocated to the pod, if any
    pub fn pod_ipv4(&self) -> Option<Ipv4Addr> {
        for ip in self.ips.as_deref().unwrap_or_default() {
            if let Ok(IpNetwork::V4(net)) = ip.address.parse::<IpNetwork>() {
                return Some(net.ip());
            }
        }
        None
    }
}
