//! Kernel interface model and the resolver seam
//!
//! The kernel owns every interface; this module only snapshots, creates and
//! enslaves. Deletion is nobody's business here.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use rtnetlink::packet_route::route::RouteScope;
use std::future::Future;
use std::net::Ipv4Addr;
use thiserror::Error;

pub mod netlink;

#[cfg(test)]
pub(crate) mod fake;

pub use netlink::NetlinkResolver;

/// Kind-specific payload of a kernel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Anything that is neither a VLAN sub-interface nor a bridge
    Physical,
    /// 802.1Q sub-interface
    Vlan { tag: u16, parent_index: u32 },
    Bridge,
}

/// Snapshot of one kernel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub name: String,
    pub index: u32,
    /// Index of the enslaving device, if any
    pub master_index: Option<u32>,
    pub hardware_addr: Option<[u8; 6]>,
    pub kind: DeviceKind,
}

impl NetworkDevice {
    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, DeviceKind::Bridge)
    }
}

/// IPv4 address bound to an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddress {
    /// Address and prefix length
    pub net: Ipv4Network,
    /// Interface label; device-specific, dropped when the address moves
    pub label: Option<String>,
}

impl IfaceAddress {
    pub fn is_loopback(&self) -> bool {
        self.net.ip().is_loopback()
    }
}

/// IPv4 route bound to an interface, main-table view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// None is the default route
    pub destination: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
    /// Preferred source address
    pub source: Option<Ipv4Addr>,
    pub scope: RouteScope,
    /// Output interface index
    pub link_index: u32,
}

/// Errors surfaced by kernel interface operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("interface {0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("netlink: {0}")]
    Netlink(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Benign when re-running an idempotent sequence
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DeviceError::AlreadyExists(_))
    }
}

/// Kernel network state, behind a seam so the provisioning logic can be
/// driven against an in-memory kernel in tests.
///
/// Sysctl toggles live here too: they are host kernel state the topology
/// engine mutates the same way it mutates interfaces.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Option<NetworkDevice>, DeviceError>;

    async fn link_by_index(&self, index: u32) -> Result<Option<NetworkDevice>, DeviceError>;

    async fn link_list(&self) -> Result<Vec<NetworkDevice>, DeviceError>;

    /// Create a VLAN sub-interface on `parent_index` carrying `tag`
    async fn create_vlan(&self, name: &str, parent_index: u32, tag: u16)
        -> Result<(), DeviceError>;

    /// Create a bridge, optionally with a fixed hardware address
    async fn create_bridge(
        &self,
        name: &str,
        hardware_addr: Option<[u8; 6]>,
    ) -> Result<(), DeviceError>;

    /// Enslave `index` to `master_index`
    async fn set_master(&self, index: u32, master_index: u32) -> Result<(), DeviceError>;

    async fn set_up(&self, index: u32) -> Result<(), DeviceError>;

    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<IfaceAddress>, DeviceError>;

    async fn add_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError>;

    async fn delete_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError>;

    /// Main-table IPv4 routes leaving through `index`
    async fn ipv4_routes(&self, index: u32) -> Result<Vec<RouteEntry>, DeviceError>;

    async fn add_route(&self, route: &RouteEntry) -> Result<(), DeviceError>;

    /// proxy_arp = 1 for `device`
    async fn enable_proxy_arp(&self, device: &str) -> Result<(), DeviceError>;

    /// arp_ignore = 0 for `device` ("all" covers every interface)
    async fn clear_arp_ignore(&self, device: &str) -> Result<(), DeviceError>;

    /// ip_nonlocal_bind = 1 host-wide
    async fn enable_nonlocal_bind(&self) -> Result<(), DeviceError>;
}

/// Obtain-or-create: look up by name, invoke the creation strategy once on
/// absence, re-look-up, fail if still absent. Used identically for bridges
/// and VLAN sub-interfaces.
pub async fn ensure_device<F, Fut>(
    resolver: &dyn DeviceResolver,
    name: &str,
    create: F,
) -> Result<NetworkDevice, DeviceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), DeviceError>>,
{
    if let Some(device) = resolver.link_by_name(name).await? {
        return Ok(device);
    }

    match create().await {
        Ok(()) => {}
        // Lost a creation race outside our lock; the re-lookup settles it.
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e),
    }

    resolver
        .link_by_name(name)
        .await?
        .ok_or_else(|| DeviceError::NotFound(name.to_string()))
}
