//! Topology provisioning engine
//!
//! Resolves the physical parent interface, obtains or creates VLAN
//! sub-interfaces and bridges per tag, and owns the address migration that
//! turns a bare physical interface into a bridged one. Devices are never
//! deleted here: VLANs and bridges are shared, multi-tenant infrastructure
//! that outlives any single container.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::NetConf;
use crate::device::{
    ensure_device, DeviceError, DeviceKind, DeviceResolver, IfaceAddress, NetworkDevice,
    RouteEntry,
};

/// Errors from topology provisioning
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("no available address found on device {0}")]
    NoAddress(String),
    #[error("invalid VLAN tag {0} (must be at most 4094)")]
    InvalidVlanTag(u16),
    #[error("topology engine not initialized")]
    NotInitialized,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Interface indices resolved against the live kernel
///
/// Guarded by the engine's mutex. The lock is process-local: a second agent
/// instance on the same host can still race device creation, so deployments
/// run one instance per node.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopologyState {
    /// True physical parent, after following one level of vlan indirection
    pub parent_index: u32,
    /// Whatever interface is currently authoritative
    pub resolved_index: u32,
}

/// Reversal step recorded while the migration moves things around
enum RollbackOp {
    RestoreAddress(u32, IfaceAddress),
    RestoreRoute(RouteEntry),
}

/// Provisions the host side of the pod network
pub struct TopologyManager {
    config: NetConf,
    resolver: Arc<dyn DeviceResolver>,
    state: Mutex<TopologyState>,
}

impl TopologyManager {
    pub fn new(config: NetConf, resolver: Arc<dyn DeviceResolver>) -> Self {
        Self {
            config,
            resolver,
            state: Mutex::new(TopologyState::default()),
        }
    }

    pub fn config(&self) -> &NetConf {
        &self.config
    }

    /// Resolve the configured device and prepare the host for the selected
    /// switch mode. Runs once at startup, before requests are accepted.
    pub async fn init(&self) -> Result<(), TopologyError> {
        let device = self
            .resolver
            .link_by_name(&self.config.device)
            .await?
            .ok_or_else(|| TopologyError::DeviceNotFound(self.config.device.clone()))?;

        {
            let mut state = self.state.lock().await;
            state.resolved_index = device.index;
            state.parent_index = match device.kind {
                // One level only; a vlan-of-vlan parent is not chased further.
                DeviceKind::Vlan { parent_index, .. } => parent_index,
                _ => device.index,
            };
            info!(
                device = %device.name,
                index = device.index,
                parent = state.parent_index,
                "resolved parent device"
            );
        }

        if self.config.is_macvlan() || self.config.is_ipvlan() {
            return Ok(());
        }

        if self.config.is_pure() {
            self.resolver.clear_arp_ignore("all").await?;
            self.resolver.clear_arp_ignore(&device.name).await?;
            self.resolver.enable_proxy_arp(&device.name).await?;
            self.resolver.enable_nonlocal_bind().await?;
            return Ok(());
        }

        if self.config.default_bridge_disabled() {
            return Ok(());
        }

        let addrs: Vec<IfaceAddress> = self
            .resolver
            .ipv4_addresses(device.index)
            .await?
            .into_iter()
            .filter(|a| !a.is_loopback())
            .collect();

        if addrs.is_empty() {
            // A previous run should have moved everything onto the default
            // bridge already; verify the enslavement instead of guessing.
            let bridge = self
                .resolver
                .link_by_name(&self.config.default_bridge_name)
                .await?
                .ok_or_else(|| TopologyError::NoAddress(device.name.clone()))?;
            if device.master_index != Some(bridge.index) {
                return Err(TopologyError::NoAddress(device.name.clone()));
            }
            return Ok(());
        }

        self.migrate_to_bridge(&device, addrs).await
    }

    /// Move the device's addresses and routes onto the default bridge and
    /// enslave it, unwinding on failure.
    async fn migrate_to_bridge(
        &self,
        device: &NetworkDevice,
        addrs: Vec<IfaceAddress>,
    ) -> Result<(), TopologyError> {
        let bridge = self
            .ensure_bridge(&self.config.default_bridge_name, device.hardware_addr)
            .await?;
        info!(
            bridge = %bridge.name,
            device = %device.name,
            addrs = addrs.len(),
            "migrating addresses onto bridge"
        );

        let routes = self.resolver.ipv4_routes(device.index).await?;

        // Route restores are queued before any address op so they replay
        // last on unwind, once addresses are back on the device.
        let mut undo: Vec<RollbackOp> = routes
            .iter()
            .cloned()
            .map(RollbackOp::RestoreRoute)
            .collect();

        for addr in &addrs {
            if let Err(e) = self.resolver.delete_address(device.index, addr).await {
                self.unwind(undo).await;
                return Err(e.into());
            }
            undo.push(RollbackOp::RestoreAddress(device.index, addr.clone()));

            // The label named the old device and means nothing on the bridge.
            let moved = IfaceAddress {
                net: addr.net,
                label: None,
            };
            match self.resolver.add_address(bridge.index, &moved).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    self.unwind(undo).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.resolver.set_master(device.index, bridge.index).await {
            self.unwind(undo).await;
            return Err(e.into());
        }

        for route in &routes {
            let repointed = RouteEntry {
                link_index: bridge.index,
                ..route.clone()
            };
            match self.resolver.add_route(&repointed).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    self.unwind(undo).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.resolver.set_up(bridge.index).await {
            self.unwind(undo).await;
            return Err(e.into());
        }

        info!(
            bridge = %bridge.name,
            routes = routes.len(),
            "address migration complete"
        );
        Ok(())
    }

    /// Best-effort rollback. Reversal errors are logged, never escalated;
    /// the original failure is what the caller sees.
    async fn unwind(&self, ops: Vec<RollbackOp>) {
        warn!("unwinding partial address migration");
        for op in ops.into_iter().rev() {
            let outcome = match &op {
                RollbackOp::RestoreAddress(index, addr) => {
                    self.resolver.add_address(*index, addr).await
                }
                RollbackOp::RestoreRoute(route) => self.resolver.add_route(route).await,
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => warn!("rollback step failed: {}", e),
            }
        }
    }

    /// Bridge name a veth endpoint for `tag` should attach to, creating the
    /// VLAN sub-interface and bridge as needed. Idempotent: re-invocation
    /// discovers and reuses, never duplicates.
    pub async fn provision_bridge_for_vlan(&self, tag: u16) -> Result<String, TopologyError> {
        if tag > 4094 {
            return Err(TopologyError::InvalidVlanTag(tag));
        }
        if tag == 0 {
            return Ok(self.config.bridge_name_for_vlan(0));
        }

        let mut state = self.state.lock().await;
        let vlan = self.obtain_vlan_device(&mut state, tag).await?;

        if let Some(master) = self.usable_master(&vlan).await? {
            return Ok(master.name);
        }

        let bridge_name = self.config.bridge_name_for_vlan(tag);
        let bridge = self.ensure_bridge(&bridge_name, None).await?;
        if vlan.master_index != Some(bridge.index) {
            self.resolver.set_master(vlan.index, bridge.index).await?;
        }
        self.resolver.set_up(bridge.index).await?;
        if self.config.is_pure() {
            self.resolver.enable_proxy_arp(&bridge_name).await?;
        }
        info!(vlan = %vlan.name, bridge = %bridge_name, tag, "provisioned bridge for vlan");
        Ok(bridge_name)
    }

    /// Create the VLAN sub-interface for `tag` without any bridge concern.
    /// Tag 0 is the no-tagging sentinel and yields nothing.
    pub async fn ensure_vlan_device(
        &self,
        tag: u16,
    ) -> Result<Option<NetworkDevice>, TopologyError> {
        if tag > 4094 {
            return Err(TopologyError::InvalidVlanTag(tag));
        }
        if tag == 0 {
            return Ok(None);
        }
        let mut state = self.state.lock().await;
        let vlan = self.obtain_vlan_device(&mut state, tag).await?;
        Ok(Some(vlan))
    }

    /// Discover a VLAN sub-interface by (tag, parent) or create one under
    /// the derived name. Caller holds the topology lock.
    async fn obtain_vlan_device(
        &self,
        state: &mut TopologyState,
        tag: u16,
    ) -> Result<NetworkDevice, TopologyError> {
        let parent_index = state.parent_index;
        // Ifindex 0 is never valid; the parent is only known after init.
        if parent_index == 0 {
            return Err(TopologyError::NotInitialized);
        }

        // Match tag and parent both: tags may collide across different
        // parents sharing the host.
        let existing = self.resolver.link_list().await?.into_iter().find(|d| {
            matches!(
                d.kind,
                DeviceKind::Vlan { tag: t, parent_index: p } if t == tag && p == parent_index
            )
        });
        if let Some(existing) = existing {
            state.resolved_index = existing.index;
            return Ok(existing);
        }

        let name = self.config.vlan_name_for(tag);
        let create_name = name.clone();
        let vlan = ensure_device(&*self.resolver, &name, || async move {
            self.resolver
                .create_vlan(&create_name, parent_index, tag)
                .await
        })
        .await?;
        self.resolver.set_up(vlan.index).await?;
        state.resolved_index = vlan.index;
        info!(vlan = %vlan.name, tag, parent = parent_index, "created vlan device");
        Ok(vlan)
    }

    /// Bridge master of `vlan`, if any. No master, a non-bridge master, or a
    /// master the kernel no longer answers for all mean "attach a new one".
    async fn usable_master(
        &self,
        vlan: &NetworkDevice,
    ) -> Result<Option<NetworkDevice>, TopologyError> {
        let Some(master_index) = vlan.master_index else {
            return Ok(None);
        };
        let Some(master) = self.resolver.link_by_index(master_index).await? else {
            return Ok(None);
        };
        Ok(master.is_bridge().then_some(master))
    }

    async fn ensure_bridge(
        &self,
        name: &str,
        hardware_addr: Option<[u8; 6]>,
    ) -> Result<NetworkDevice, TopologyError> {
        let create_name = name.to_string();
        let device = ensure_device(&*self.resolver, name, || async move {
            self.resolver
                .create_bridge(&create_name, hardware_addr)
                .await
        })
        .await?;
        Ok(device)
    }
}
