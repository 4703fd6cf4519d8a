//! Disk delta planning.
//!
//! Data disks sit on `<bus>N` slots with N >= 1 (slot 0 is the boot disk
//! inherited from the template). Slots need not be contiguous, and CD-ROM
//! drives may share the bus. Only the list length is reconciled: new disks
//! go above the highest taken slot, removed disks are cut from the highest
//! data disk downward. Existing disks are never resized or reordered.

use crate::cluster::ConfigUpdate;
use crate::config::DiskSpec;
use crate::vm_config::DiskSlot;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskPlan {
    /// `(device key, volume spec)` pairs, e.g. `("scsi2", "local:8,format=qcow2")`.
    pub attach: Vec<(String, String)>,
    /// Device keys to detach in one batch.
    pub detach: Vec<String>,
    /// `unusedN` placeholders to remove after the detach batch.
    pub purge: Vec<String>,
}

impl DiskPlan {
    pub fn is_empty(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty() && self.purge.is_empty()
    }

    /// Fold the attach operations into a batched config write.
    pub fn apply_attach(&self, update: &mut ConfigUpdate) {
        for (key, volume) in &self.attach {
            update.set(key.clone(), volume.clone());
        }
    }
}

/// `current` is sorted by slot; `taken` lists every occupied `<bus>N`
/// index, including drives that are not data disks.
pub fn plan_disks(
    current: &[DiskSlot],
    taken: &[u32],
    desired: &[DiskSpec],
    bus: &str,
    format: &str,
) -> DiskPlan {
    let have = current.len();
    let want = desired.len();
    let mut plan = DiskPlan::default();

    if want > have {
        let highest = taken
            .iter()
            .copied()
            .chain(current.iter().map(|d| d.slot))
            .max()
            .unwrap_or(0);
        for (slot, disk) in (highest + 1..).zip(&desired[have..]) {
            plan.attach.push((
                format!("{bus}{slot}"),
                format!("{}:{},format={format}", disk.storage, disk.size),
            ));
        }
    } else if want < have {
        plan.detach = current[want..]
            .iter()
            .map(|d| format!("{bus}{}", d.slot))
            .collect();
        plan.purge = (0..have - want).map(|i| format!("unused{i}")).collect();
    }

    plan
}

/// Slots present in both lists whose storage or size differ.
///
/// These are not reconciled; callers only report them.
pub fn drifted_slots(current: &[DiskSlot], desired: &[DiskSpec]) -> Vec<u32> {
    current
        .iter()
        .zip(desired)
        .filter(|(have, want)| have.storage != want.storage || have.size_gb != want.size)
        .map(|(have, _)| have.slot)
        .collect()
}
