//! Host port forwarding for pods
//!
//! Parses the PORTS argument, remembers what was requested for each
//! container between ADD and DEL, and drives the reference `portmap` CNI
//! plugin to install and remove the DNAT rules.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::delegate::exec_plugin;
use crate::types::{CniCommand, PodRequest};

#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("invalid port mapping {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: &'static str },
    #[error("invalid container id {0:?}")]
    InvalidContainerId(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host-to-pod forwarding entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub pod_port: u16,
    pub protocol: Protocol,
    /// Filled in once the delegate reports the pod address
    pub pod_ip: Option<Ipv4Addr>,
}

fn invalid(entry: &str, reason: &'static str) -> PortMapError {
    PortMapError::InvalidSpec {
        spec: entry.to_string(),
        reason,
    }
}

fn parse_port(entry: &str, s: &str) -> Result<u16, PortMapError> {
    let port: u16 = s
        .parse()
        .map_err(|_| invalid(entry, "port is not a number in 1..=65535"))?;
    if port == 0 {
        return Err(invalid(entry, "port 0 is not mappable"));
    }
    Ok(port)
}

/// Parse a PORTS argument: comma-separated `hostPort:podPort[/protocol]`
/// entries, protocol defaulting to tcp.
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortMapping>, PortMapError> {
    let mut mappings = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(invalid(spec, "empty entry"));
        }
        let (ports, protocol) = match entry.split_once('/') {
            Some((ports, proto)) if proto.eq_ignore_ascii_case("tcp") => (ports, Protocol::Tcp),
            Some((ports, proto)) if proto.eq_ignore_ascii_case("udp") => (ports, Protocol::Udp),
            Some(_) => return Err(invalid(entry, "protocol must be tcp or udp")),
            None => (entry, Protocol::Tcp),
        };
        let (host, pod) = ports
            .split_once(':')
            .ok_or_else(|| invalid(entry, "expected hostPort:podPort"))?;
        mappings.push(PortMapping {
            host_port: parse_port(entry, host)?,
            pod_port: parse_port(entry, pod)?,
            protocol,
            pod_ip: None,
        });
    }
    Ok(mappings)
}

/// Persists the port spec for a container between ADD and DEL
///
/// One file per container id under the state directory. DEL consumes the
/// file; absence means nothing was mapped, which is not an error.
pub struct MappingStore {
    dir: PathBuf,
}

impl MappingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, container_id: &str) -> Result<PathBuf, PortMapError> {
        // The id becomes a file name; keep it to a safe character set.
        let safe = !container_id.is_empty()
            && container_id != "."
            && container_id != ".."
            && container_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !safe {
            return Err(PortMapError::InvalidContainerId(container_id.to_string()));
        }
        Ok(self.dir.join(container_id))
    }

    pub async fn save(&self, container_id: &str, spec: &str) -> Result<(), PortMapError> {
        let path = self.path_for(container_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, spec).await?;
        Ok(())
    }

    pub async fn consume(&self, container_id: &str) -> Result<Option<String>, PortMapError> {
        let path = self.path_for(container_id)?;
        let spec = match tokio::fs::read_to_string(&path).await {
            Ok(spec) => spec,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_file(&path).await?;
        Ok(Some(spec))
    }
}

/// Installs and removes host port forwarding rules
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn install(&self, req: &PodRequest, mappings: &[PortMapping]) -> Result<()>;
    async fn remove(&self, req: &PodRequest, mappings: &[PortMapping]) -> Result<()>;
}

/// Drives the reference `portmap` CNI plugin
pub struct PortmapPlugin {
    plugin_dir: PathBuf,
    program: String,
}

impl PortmapPlugin {
    pub fn new(plugin_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            program: program.into(),
        }
    }

    async fn invoke(
        &self,
        command: CniCommand,
        req: &PodRequest,
        mappings: &[PortMapping],
    ) -> Result<()> {
        let netconf = build_netconf(mappings);
        exec_plugin(&self.plugin_dir, &self.program, command, req, "", &netconf)
            .await
            .with_context(|| format!("portmap {} for container {}", command, req.container_id))?;
        info!(
            container = %req.container_id,
            mappings = mappings.len(),
            %command,
            "port forwarding rules updated"
        );
        Ok(())
    }
}

#[async_trait]
impl PortMapper for PortmapPlugin {
    async fn install(&self, req: &PodRequest, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            bail!("no port mappings to install");
        }
        self.invoke(CniCommand::Add, req, mappings).await
    }

    async fn remove(&self, req: &PodRequest, mappings: &[PortMapping]) -> Result<()> {
        self.invoke(CniCommand::Del, req, mappings).await
    }
}

/// Network configuration handed to the portmap plugin. The mappings travel
/// in runtimeConfig and the pod address in prevResult, the two places the
/// reference plugin reads.
fn build_netconf(mappings: &[PortMapping]) -> serde_json::Value {
    let port_mappings: Vec<serde_json::Value> = mappings
        .iter()
        .map(|m| {
            json!({
                "hostPort": m.host_port,
                "containerPort": m.pod_port,
                "protocol": m.protocol.as_str(),
            })
        })
        .collect();

    let mut netconf = json!({
        "cniVersion": "1.0.0",
        "name": "trellis",
        "type": "portmap",
        "runtimeConfig": { "portMappings": port_mappings },
    });
    if let Some(ip) = mappings.iter().find_map(|m| m.pod_ip) {
        netconf["prevResult"] = json!({
            "ips": [ { "address": format!("{}/32", ip) } ],
        });
    }
    netconf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netconf_carries_mappings_and_pod_address() {
        let mappings = vec![
            PortMapping {
                host_port: 8080,
                pod_port: 80,
                protocol: Protocol::Tcp,
                pod_ip: Some("10.1.2.3".parse().unwrap()),
            },
            PortMapping {
                host_port: 5353,
                pod_port: 53,
                protocol: Protocol::Udp,
                pod_ip: Some("10.1.2.3".parse().unwrap()),
            },
        ];
        let netconf = build_netconf(&mappings);

        assert_eq!(netconf["type"], "portmap");
        let ports = netconf["runtimeConfig"]["portMappings"].as_array().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0]["hostPort"], 8080);
        assert_eq!(ports[0]["containerPort"], 80);
        assert_eq!(ports[0]["protocol"], "tcp");
        assert_eq!(ports[1]["protocol"], "udp");
        assert_eq!(netconf["prevResult"]["ips"][0]["address"], "10.1.2.3/32");
    }

    #[test]
    fn netconf_without_pod_address_omits_prev_result() {
        let mappings = vec![PortMapping {
            host_port: 8080,
            pod_port: 80,
            protocol: Protocol::Tcp,
            pod_ip: None,
        }];
        let netconf = build_netconf(&mappings);
        assert!(netconf.get("prevResult").is_none());
    }
}
