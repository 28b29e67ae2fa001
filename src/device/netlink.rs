//! rtnetlink-backed implementation of the resolver seam

use async_trait::async_trait;
use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{InfoData, InfoKind, InfoVlan, LinkAttribute, LinkInfo, LinkMessage};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{new_connection, Handle, LinkBridge, LinkUnspec, LinkVlan, RouteMessageBuilder};
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use super::{DeviceError, DeviceKind, DeviceResolver, IfaceAddress, NetworkDevice, RouteEntry};

const RT_TABLE_MAIN: u8 = 254;

/// Talks to the live kernel over a netlink socket
///
/// The connection task is spawned onto the current tokio runtime; the
/// resolver itself is just a cheap handle and can be shared freely.
pub struct NetlinkResolver {
    handle: Handle,
}

impl NetlinkResolver {
    /// Open a netlink connection; requires a running tokio runtime
    pub fn new() -> Result<Self, DeviceError> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

/// Map an rtnetlink failure, distinguishing the benign EEXIST
fn op_err(what: &str, err: rtnetlink::Error) -> DeviceError {
    if netlink_code(&err) == Some(-libc::EEXIST) {
        return DeviceError::AlreadyExists(what.to_string());
    }
    DeviceError::Netlink(format!("{}: {}", what, err))
}

fn netlink_code(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| c.get()),
        _ => None,
    }
}

/// Lookup misses surface as ENODEV/ENOENT rather than an empty dump
fn is_not_found(err: &rtnetlink::Error) -> bool {
    matches!(netlink_code(err), Some(code) if code == -libc::ENODEV || code == -libc::ENOENT)
}

fn device_from_link(link: LinkMessage) -> NetworkDevice {
    let mut name = String::new();
    let mut master_index = None;
    let mut hardware_addr = None;
    let mut info_kind = None;
    let mut vlan_tag = None;
    let mut vlan_parent = None;

    for attr in &link.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Controller(idx) => master_index = Some(*idx),
            LinkAttribute::Link(idx) => vlan_parent = Some(*idx),
            LinkAttribute::Address(addr) if addr.len() == 6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&addr[..6]);
                hardware_addr = Some(mac);
            }
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(kind) => info_kind = Some(kind.clone()),
                        LinkInfo::Data(InfoData::Vlan(vlan_attrs)) => {
                            for vlan_attr in vlan_attrs {
                                if let InfoVlan::Id(id) = vlan_attr {
                                    vlan_tag = Some(*id);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let kind = match info_kind {
        Some(InfoKind::Bridge) => DeviceKind::Bridge,
        Some(InfoKind::Vlan) => match (vlan_tag, vlan_parent) {
            (Some(tag), Some(parent_index)) => DeviceKind::Vlan { tag, parent_index },
            _ => DeviceKind::Physical,
        },
        _ => DeviceKind::Physical,
    };

    NetworkDevice {
        name,
        index: link.header.index,
        master_index,
        hardware_addr,
        kind,
    }
}

#[async_trait]
impl DeviceResolver for NetlinkResolver {
    async fn link_by_name(&self, name: &str) -> Result<Option<NetworkDevice>, DeviceError> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(device_from_link(link))),
            Ok(None) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(op_err(&format!("lookup of {}", name), e)),
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<NetworkDevice>, DeviceError> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(device_from_link(link))),
            Ok(None) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(op_err(&format!("lookup of ifindex {}", index), e)),
        }
    }

    async fn link_list(&self) -> Result<Vec<NetworkDevice>, DeviceError> {
        let mut links = self.handle.link().get().execute();
        let mut devices = Vec::new();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| op_err("link dump", e))?
        {
            devices.push(device_from_link(link));
        }
        Ok(devices)
    }

    async fn create_vlan(
        &self,
        name: &str,
        parent_index: u32,
        tag: u16,
    ) -> Result<(), DeviceError> {
        self.handle
            .link()
            .add(LinkVlan::new(name, parent_index, tag).build())
            .execute()
            .await
            .map_err(|e| op_err(&format!("vlan device {}", name), e))
    }

    async fn create_bridge(
        &self,
        name: &str,
        hardware_addr: Option<[u8; 6]>,
    ) -> Result<(), DeviceError> {
        let mut builder = LinkBridge::new(name);
        if let Some(mac) = hardware_addr {
            builder = builder.address(mac.to_vec());
        }
        self.handle
            .link()
            .add(builder.build())
            .execute()
            .await
            .map_err(|e| op_err(&format!("bridge device {}", name), e))
    }

    async fn set_master(&self, index: u32, master_index: u32) -> Result<(), DeviceError> {
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .controller(master_index)
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| op_err(&format!("enslave of ifindex {}", index), e))
    }

    async fn set_up(&self, index: u32) -> Result<(), DeviceError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| op_err(&format!("link up of ifindex {}", index), e))
    }

    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<IfaceAddress>, DeviceError> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(msg) = messages
            .try_next()
            .await
            .map_err(|e| op_err("address dump", e))?
        {
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            let mut ip = None;
            let mut label = None;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Address(IpAddr::V4(v4)) => ip = Some(*v4),
                    AddressAttribute::Label(l) => label = Some(l.clone()),
                    _ => {}
                }
            }
            if let Some(ip) = ip {
                let net = Ipv4Network::new(ip, msg.header.prefix_len)
                    .map_err(|e| DeviceError::Netlink(format!("address dump: {}", e)))?;
                addrs.push(IfaceAddress { net, label });
            }
        }
        Ok(addrs)
    }

    async fn add_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError> {
        // The add request carries no label attribute, so a moved address
        // arrives with its device-specific label cleared.
        self.handle
            .address()
            .add(index, IpAddr::V4(addr.net.ip()), addr.net.prefix())
            .execute()
            .await
            .map_err(|e| op_err(&format!("address {}", addr.net), e))
    }

    async fn delete_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError> {
        let mut msg = AddressMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.prefix_len = addr.net.prefix();
        msg.header.index = index;
        msg.attributes
            .push(AddressAttribute::Address(IpAddr::V4(addr.net.ip())));
        msg.attributes
            .push(AddressAttribute::Local(IpAddr::V4(addr.net.ip())));
        self.handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| op_err(&format!("address delete {}", addr.net), e))
    }

    async fn ipv4_routes(&self, index: u32) -> Result<Vec<RouteEntry>, DeviceError> {
        let dump = RouteMessageBuilder::<Ipv4Addr>::default().build();
        let mut messages = self.handle.route().get(dump).execute();

        let mut routes = Vec::new();
        while let Some(msg) = messages
            .try_next()
            .await
            .map_err(|e| op_err("route dump", e))?
        {
            if msg.header.table != RT_TABLE_MAIN {
                continue;
            }
            let mut oif = None;
            let mut destination_ip = None;
            let mut gateway = None;
            let mut source = None;
            for attr in &msg.attributes {
                match attr {
                    RouteAttribute::Oif(idx) => oif = Some(*idx),
                    RouteAttribute::Destination(RouteAddress::Inet(v4)) => {
                        destination_ip = Some(*v4)
                    }
                    RouteAttribute::Gateway(RouteAddress::Inet(v4)) => gateway = Some(*v4),
                    RouteAttribute::PrefSource(RouteAddress::Inet(v4)) => source = Some(*v4),
                    _ => {}
                }
            }
            if oif != Some(index) {
                continue;
            }
            let destination = match destination_ip {
                Some(ip) => Some(
                    Ipv4Network::new(ip, msg.header.destination_prefix_length)
                        .map_err(|e| DeviceError::Netlink(format!("route dump: {}", e)))?,
                ),
                None => None,
            };
            routes.push(RouteEntry {
                destination,
                gateway,
                source,
                scope: msg.header.scope,
                link_index: index,
            });
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<(), DeviceError> {
        let mut builder =
            RouteMessageBuilder::<Ipv4Addr>::default().output_interface(route.link_index);
        if let Some(dst) = route.destination {
            builder = builder.destination_prefix(dst.ip(), dst.prefix());
        }
        if let Some(gw) = route.gateway {
            builder = builder.gateway(gw);
        }
        let mut msg = builder.build();
        msg.header.scope = route.scope;
        if let Some(src) = route.source {
            msg.attributes
                .push(RouteAttribute::PrefSource(RouteAddress::Inet(src)));
        }
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| op_err("route", e))
    }

    async fn enable_proxy_arp(&self, device: &str) -> Result<(), DeviceError> {
        write_sysctl(&conf_path(device, "proxy_arp")?, "1").await
    }

    async fn clear_arp_ignore(&self, device: &str) -> Result<(), DeviceError> {
        write_sysctl(&conf_path(device, "arp_ignore")?, "0").await
    }

    async fn enable_nonlocal_bind(&self) -> Result<(), DeviceError> {
        write_sysctl("/proc/sys/net/ipv4/ip_nonlocal_bind", "1").await
    }
}

fn conf_path(device: &str, key: &str) -> Result<String, DeviceError> {
    if device.is_empty() || device.contains('/') {
        return Err(DeviceError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name {:?}", device),
        )));
    }
    Ok(format!("/proc/sys/net/ipv4/conf/{}/{}", device, key))
}

async fn write_sysctl(path: &str, value: &str) -> Result<(), DeviceError> {
    tokio::fs::write(path, value).await?;
    Ok(())
}
