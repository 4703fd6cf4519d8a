//! Field-level diff between observed config and desired spec.

use crate::cluster::ConfigUpdate;
use crate::config::{ReconcilerConfig, VmSpec};
use crate::disk::{DiskPlan, plan_disks};
use crate::vm_config::VmConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    /// Batched attribute writes, disk attaches included.
    pub update: ConfigUpdate,
    /// A changed attribute only takes effect after a power cycle.
    pub restart: bool,
    pub disks: DiskPlan,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.disks.is_empty()
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Compare `observed` with `desired`. `cicustom` is the custom cloud-init
/// pointer the VM should carry, if any.
pub fn diff_config(
    observed: &VmConfig,
    desired: &VmSpec,
    cicustom: Option<&str>,
    config: &ReconcilerConfig,
) -> ConfigDiff {
    let mut diff = ConfigDiff::default();
    let update = &mut diff.update;

    if observed.name.as_deref() != Some(desired.name.as_str()) {
        update.set("name", desired.name.as_str());
    }
    if observed.cores != Some(desired.cores) {
        update.set("cores", desired.cores.to_string());
        diff.restart = true;
    }
    if observed.memory != Some(desired.memory) {
        update.set("memory", desired.memory.to_string());
        diff.restart = true;
    }
    if observed.onboot != desired.onboot {
        update.set("onboot", flag(desired.onboot));
    }
    if let Some(cicustom) = cicustom {
        if observed.cicustom.as_deref() != Some(cicustom) {
            update.set("cicustom", cicustom);
        }
    }

    diff.disks = plan_disks(
        &observed.disks,
        &observed.bus_slots,
        &desired.disks,
        &config.disk_bus,
        &config.disk_format,
    );
    diff.disks.apply_attach(&mut diff.update);
    diff
}
