//! Observed VM state handed back to the infrastructure engine.
//!
//! Rebuilt from a fresh config read and power query on every operation;
//! nothing here is cached between calls.

use crate::cluster::{PowerStatus, VmRef};
use crate::vm_config::{DiskSlot, VmConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmState {
    pub vmid: u32,
    pub node: String,
    pub name: Option<String>,
    pub cores: Option<u32>,
    pub memory: Option<u64>,
    pub onboot: bool,
    pub status: PowerStatus,
    pub disks: Vec<DiskSlot>,
    pub cicustom: Option<String>,
    /// Last IPv4 address reported by the guest agent.
    pub ipv4_address: Option<String>,
}

impl VmState {
    pub fn observe(
        vm: &VmRef,
        config: VmConfig,
        status: PowerStatus,
        ipv4_address: Option<String>,
    ) -> Self {
        Self {
            vmid: vm.vmid,
            node: vm.node.clone(),
            name: config.name,
            cores: config.cores,
            memory: config.memory,
            onboot: config.onboot,
            status,
            disks: config.disks,
            cicustom: config.cicustom,
            ipv4_address,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == PowerStatus::Running
    }
}
