//! Delegation to standard CNI plugins
//!
//! The agent never allocates pod addresses itself. It prepares the host
//! topology for the requested VLAN, injects the resulting device into the
//! delegate configuration, and executes the configured CNI plugin with the
//! environment a runtime would have given it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::topology::TopologyManager;
use crate::types::{AllocationResult, CniCommand, PodRequest};

/// Wires a pod into the network, one call per CNI command
#[async_trait]
pub trait NetworkDelegate: Send + Sync {
    async fn add(&self, req: &PodRequest) -> Result<AllocationResult>;
    async fn del(&self, req: &PodRequest) -> Result<()>;
}

/// Execute a CNI plugin binary with the standard environment, feeding
/// `netconf` on stdin and returning its stdout.
pub(crate) async fn exec_plugin(
    plugin_dir: &Path,
    program: &str,
    command: CniCommand,
    req: &PodRequest,
    cni_args: &str,
    netconf: &Value,
) -> Result<Vec<u8>> {
    let exe = plugin_dir.join(program);
    let search_path = if req.path.is_empty() {
        plugin_dir.display().to_string()
    } else {
        req.path.clone()
    };

    debug!(program, %command, container = %req.container_id, "executing CNI plugin");
    let mut cmd = Command::new(&exe);
    cmd.env("CNI_COMMAND", command.to_string())
        .env("CNI_CONTAINERID", &req.container_id)
        .env("CNI_NETNS", &req.netns)
        .env("CNI_IFNAME", &req.ifname)
        .env("CNI_PATH", search_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !cni_args.is_empty() {
        cmd.env("CNI_ARGS", cni_args);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute {}", exe.display()))?;

    let payload = serde_json::to_vec(netconf)?;
    let mut stdin = child
        .stdin
        .take()
        .context("plugin stdin not captured")?;
    stdin.write_all(&payload).await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        // Plugins report errors as JSON on stdout; fall back to stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stdout.trim().is_empty() {
            stderr.trim().to_string()
        } else {
            stdout.trim().to_string()
        };
        bail!("{} {} failed: {}", program, command, detail);
    }
    Ok(output.stdout)
}

/// CNI_ARGS string for a delegate invocation, keys sorted for stability
fn cni_args(req: &PodRequest) -> String {
    let mut pairs: Vec<String> = req
        .args
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    pairs.sort();
    if !req.port_spec.is_empty() {
        pairs.push(format!("PORTS={}", req.port_spec));
    }
    pairs.join(";")
}

/// Executes whatever plugin the delegate configuration's `type` names
pub struct CniExecDelegate {
    plugin_dir: PathBuf,
}

impl CniExecDelegate {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    async fn run(&self, command: CniCommand, req: &PodRequest, netconf: &Value) -> Result<Vec<u8>> {
        let program = netconf
            .get("type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .context("delegate configuration has no type")?
            .to_string();
        exec_plugin(
            &self.plugin_dir,
            &program,
            command,
            req,
            &cni_args(req),
            netconf,
        )
        .await
    }
}

/// Delegate that provisions the VLAN topology before handing off
pub struct VlanDelegate {
    topology: Arc<TopologyManager>,
    exec: CniExecDelegate,
}

impl VlanDelegate {
    pub fn new(topology: Arc<TopologyManager>, exec: CniExecDelegate) -> Self {
        Self { topology, exec }
    }

    /// Delegate netconf for this request: the configured delegate section
    /// when present, the shim's forwarded configuration otherwise, with the
    /// topology device injected. `provision` distinguishes ADD, which may
    /// create host devices, from DEL, which only derives their names.
    async fn prepared_netconf(&self, req: &PodRequest, provision: bool) -> Result<Value> {
        let cfg = self.topology.config();
        let tag = req.vlan_tag()?;

        let mut netconf = match &cfg.delegate {
            Some(delegate) => delegate.clone(),
            None => req.config.clone(),
        };
        let obj = netconf
            .as_object_mut()
            .context("delegate configuration is not a JSON object")?;
        if !obj.contains_key("cniVersion") && !cfg.cni_version.is_empty() {
            obj.insert("cniVersion".to_string(), json!(cfg.cni_version));
        }
        if !obj.contains_key("name") && !cfg.name.is_empty() {
            obj.insert("name".to_string(), json!(cfg.name));
        }

        if cfg.is_macvlan() || cfg.is_ipvlan() {
            let master = if provision {
                match self.topology.ensure_vlan_device(tag).await? {
                    Some(vlan) => vlan.name,
                    None => cfg.device.clone(),
                }
            } else if tag == 0 {
                cfg.device.clone()
            } else {
                cfg.vlan_name_for(tag)
            };
            obj.insert("master".to_string(), json!(master));
        } else {
            let bridge = if provision {
                self.topology.provision_bridge_for_vlan(tag).await?
            } else {
                cfg.bridge_name_for_vlan(tag)
            };
            if !bridge.is_empty() {
                obj.insert("bridge".to_string(), json!(bridge));
            }
        }

        Ok(netconf)
    }
}

#[async_trait]
impl NetworkDelegate for VlanDelegate {
    async fn add(&self, req: &PodRequest) -> Result<AllocationResult> {
        let netconf = self.prepared_netconf(req, true).await?;
        let stdout = self.exec.run(CniCommand::Add, req, &netconf).await?;
        let result: AllocationResult =
            serde_json::from_slice(&stdout).context("Failed to parse delegate result")?;
        Ok(result)
    }

    async fn del(&self, req: &PodRequest) -> Result<()> {
        let netconf = self.prepared_netconf(req, false).await?;
        self.exec.run(CniCommand::Del, req, &netconf).await?;
        Ok(())
    }
}
