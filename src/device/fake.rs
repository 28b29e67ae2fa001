//! In-memory kernel for exercising provisioning logic in tests
//!
//! Mimics the semantics the engine depends on: index allocation, name
//! uniqueness, EEXIST on duplicate addresses/routes, and the kernel dropping
//! a device's routes when its addresses are removed. Failures can be
//! injected per operation to drive rollback paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{DeviceError, DeviceKind, DeviceResolver, IfaceAddress, NetworkDevice, RouteEntry};

pub(crate) struct FakeKernel {
    state: Mutex<KernelState>,
}

#[derive(Default)]
struct KernelState {
    links: Vec<FakeLink>,
    addrs: HashMap<u32, Vec<IfaceAddress>>,
    routes: Vec<RouteEntry>,
    sysctls: Vec<String>,
    mutations: Vec<String>,
    fail_after: HashMap<String, u32>,
    next_index: u32,
}

struct FakeLink {
    device: NetworkDevice,
    up: bool,
}

fn fake_mac(index: u32) -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x00, index as u8]
}

impl KernelState {
    fn gate(&mut self, op: &str) -> Result<(), DeviceError> {
        if let Some(remaining) = self.fail_after.get_mut(op) {
            *remaining -= 1;
            if *remaining == 0 {
                self.fail_after.remove(op);
                return Err(DeviceError::Netlink(format!("injected {} failure", op)));
            }
        }
        Ok(())
    }

    fn alloc_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn push_link(&mut self, device: NetworkDevice, up: bool) -> u32 {
        let index = device.index;
        self.links.push(FakeLink { device, up });
        index
    }
}

impl FakeKernel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(KernelState::default()),
        }
    }

    /// Fail the nth future call of `op` (1 fails the next one)
    pub(crate) fn fail_after(&self, op: &str, nth: u32) {
        assert!(nth > 0);
        self.state
            .lock()
            .unwrap()
            .fail_after
            .insert(op.to_string(), nth);
    }

    pub(crate) fn seed_physical(&self, name: &str) -> u32 {
        let mut st = self.state.lock().unwrap();
        let index = st.alloc_index();
        st.push_link(
            NetworkDevice {
                name: name.to_string(),
                index,
                master_index: None,
                hardware_addr: Some(fake_mac(index)),
                kind: DeviceKind::Physical,
            },
            true,
        )
    }

    pub(crate) fn seed_vlan(&self, name: &str, tag: u16, parent_index: u32) -> u32 {
        let mut st = self.state.lock().unwrap();
        let index = st.alloc_index();
        st.push_link(
            NetworkDevice {
                name: name.to_string(),
                index,
                master_index: None,
                hardware_addr: Some(fake_mac(index)),
                kind: DeviceKind::Vlan { tag, parent_index },
            },
            true,
        )
    }

    pub(crate) fn seed_bridge(&self, name: &str) -> u32 {
        let mut st = self.state.lock().unwrap();
        let index = st.alloc_index();
        st.push_link(
            NetworkDevice {
                name: name.to_string(),
                index,
                master_index: None,
                hardware_addr: Some(fake_mac(index)),
                kind: DeviceKind::Bridge,
            },
            true,
        )
    }

    pub(crate) fn seed_master(&self, index: u32, master_index: u32) {
        let mut st = self.state.lock().unwrap();
        let link = st
            .links
            .iter_mut()
            .find(|l| l.device.index == index)
            .expect("seeded link");
        link.device.master_index = Some(master_index);
    }

    pub(crate) fn seed_address(&self, index: u32, net: &str, label: Option<&str>) {
        let mut st = self.state.lock().unwrap();
        st.addrs.entry(index).or_default().push(IfaceAddress {
            net: net.parse().expect("seeded address"),
            label: label.map(str::to_string),
        });
    }

    pub(crate) fn seed_route(&self, route: RouteEntry) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub(crate) fn link_named(&self, name: &str) -> Option<NetworkDevice> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.device.name == name)
            .map(|l| l.device.clone())
    }

    pub(crate) fn link_count(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }

    pub(crate) fn is_up(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.device.name == name)
            .map(|l| l.up)
            .unwrap_or(false)
    }

    pub(crate) fn addresses(&self, index: u32) -> Vec<IfaceAddress> {
        self.state
            .lock()
            .unwrap()
            .addrs
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().unwrap().routes.clone()
    }

    pub(crate) fn sysctls(&self) -> Vec<String> {
        self.state.lock().unwrap().sysctls.clone()
    }

    /// Every mutating call issued so far, in order
    pub(crate) fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }
}

#[async_trait]
impl DeviceResolver for FakeKernel {
    async fn link_by_name(&self, name: &str) -> Result<Option<NetworkDevice>, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("link_by_name")?;
        Ok(st
            .links
            .iter()
            .find(|l| l.device.name == name)
            .map(|l| l.device.clone()))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<NetworkDevice>, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("link_by_index")?;
        Ok(st
            .links
            .iter()
            .find(|l| l.device.index == index)
            .map(|l| l.device.clone()))
    }

    async fn link_list(&self) -> Result<Vec<NetworkDevice>, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("link_list")?;
        Ok(st.links.iter().map(|l| l.device.clone()).collect())
    }

    async fn create_vlan(
        &self,
        name: &str,
        parent_index: u32,
        tag: u16,
    ) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("create_vlan")?;
        if st.links.iter().any(|l| l.device.name == name) {
            return Err(DeviceError::AlreadyExists(name.to_string()));
        }
        st.mutations.push(format!("create_vlan {}", name));
        let index = st.alloc_index();
        st.push_link(
            NetworkDevice {
                name: name.to_string(),
                index,
                master_index: None,
                hardware_addr: Some(fake_mac(index)),
                kind: DeviceKind::Vlan { tag, parent_index },
            },
            false,
        );
        Ok(())
    }

    async fn create_bridge(
        &self,
        name: &str,
        hardware_addr: Option<[u8; 6]>,
    ) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("create_bridge")?;
        if st.links.iter().any(|l| l.device.name == name) {
            return Err(DeviceError::AlreadyExists(name.to_string()));
        }
        st.mutations.push(format!("create_bridge {}", name));
        let index = st.alloc_index();
        st.push_link(
            NetworkDevice {
                name: name.to_string(),
                index,
                master_index: None,
                hardware_addr: hardware_addr.or(Some(fake_mac(index))),
                kind: DeviceKind::Bridge,
            },
            false,
        );
        Ok(())
    }

    async fn set_master(&self, index: u32, master_index: u32) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("set_master")?;
        st.mutations
            .push(format!("set_master {} -> {}", index, master_index));
        let link = st
            .links
            .iter_mut()
            .find(|l| l.device.index == index)
            .ok_or_else(|| DeviceError::Netlink(format!("no such ifindex {}", index)))?;
        link.device.master_index = Some(master_index);
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("set_up")?;
        st.mutations.push(format!("set_up {}", index));
        let link = st
            .links
            .iter_mut()
            .find(|l| l.device.index == index)
            .ok_or_else(|| DeviceError::Netlink(format!("no such ifindex {}", index)))?;
        link.up = true;
        Ok(())
    }

    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<IfaceAddress>, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("ipv4_addresses")?;
        Ok(st.addrs.get(&index).cloned().unwrap_or_default())
    }

    async fn add_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("add_address")?;
        let list = st.addrs.entry(index).or_default();
        if list.iter().any(|a| a.net == addr.net) {
            return Err(DeviceError::AlreadyExists(addr.net.to_string()));
        }
        list.push(addr.clone());
        st.mutations.push(format!("add_address {} {}", index, addr.net));
        Ok(())
    }

    async fn delete_address(&self, index: u32, addr: &IfaceAddress) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("delete_address")?;
        let list = st.addrs.entry(index).or_default();
        let before = list.len();
        list.retain(|a| a.net != addr.net);
        if list.len() == before {
            return Err(DeviceError::Netlink(format!(
                "no address {} on ifindex {}",
                addr.net, index
            )));
        }
        // Address removal takes the device's routes with it.
        st.routes.retain(|r| r.link_index != index);
        st.mutations
            .push(format!("delete_address {} {}", index, addr.net));
        Ok(())
    }

    async fn ipv4_routes(&self, index: u32) -> Result<Vec<RouteEntry>, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("ipv4_routes")?;
        Ok(st
            .routes
            .iter()
            .filter(|r| r.link_index == index)
            .cloned()
            .collect())
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("add_route")?;
        // The main table is keyed by destination.
        if st.routes.iter().any(|r| r.destination == route.destination) {
            return Err(DeviceError::AlreadyExists(format!(
                "route {:?}",
                route.destination
            )));
        }
        st.routes.push(route.clone());
        st.mutations
            .push(format!("add_route {:?} via {:?}", route.destination, route.gateway));
        Ok(())
    }

    async fn enable_proxy_arp(&self, device: &str) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("enable_proxy_arp")?;
        st.sysctls.push(format!("proxy_arp:{}=1", device));
        Ok(())
    }

    async fn clear_arp_ignore(&self, device: &str) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("clear_arp_ignore")?;
        st.sysctls.push(format!("arp_ignore:{}=0", device));
        Ok(())
    }

    async fn enable_nonlocal_bind(&self) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.gate("enable_nonlocal_bind")?;
        st.sysctls.push("ip_nonlocal_bind=1".to_string());
        Ok(())
    }
}
