//! Node-local network provisioning agent
//!
//! This implementation provides the host-side half of a CNI setup:
//! - Resolves the physical parent interface and its VLAN sub-interfaces
//! - Creates or reuses bridges per VLAN tag, idempotently
//! - Migrates host addresses/routes onto a bridge when one is first introduced
//! - Dispatches CNI ADD/DEL requests arriving over a local unix socket
//! - Tracks per-container port mappings alongside the delegate's IP result

pub mod config;
pub mod delegate;
pub mod device;
pub mod firewall;
pub mod netns;
pub mod portmap;
pub mod server;
pub mod topology;
pub mod types;

// Re-export commonly used items
pub use config::NetConf;
pub use server::Dispatcher;
pub use topology::TopologyManager;
pub use types::{AllocationResult, CniCommand, PodRequest};
