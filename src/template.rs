//! Template swap: replace a VM's boot disk with a fresh copy of another
//! template's boot disk.
//!
//! The new template is fully cloned into an auxiliary VM, whose boot disk is
//! then moved into the target. The auxiliary VM is destroyed afterwards no
//! matter how the transplant went.

use crate::cluster::{CloneParams, ClusterApi, ConfigUpdate, MoveDisk, VmRef, require_vm};
use crate::error::PvmError;
use crate::vm_config::{PROPAGATED_KEYS, VmConfig};

/// A validated swap, ready to run. Building one performs no mutation.
#[derive(Debug)]
pub struct TemplateSwap {
    target: VmRef,
    template: VmRef,
    boot_disk: String,
    bus: String,
    target_config: VmConfig,
    template_config: VmConfig,
}

fn refuse(reason: impl Into<String>) -> PvmError {
    PvmError::RefuseIncompatible {
        reason: reason.into(),
    }
}

/// Volume id without its options: `local:100/vm-100-disk-0.qcow2`.
fn volume_id(volume: &str) -> &str {
    volume.split(',').next().unwrap_or(volume)
}

impl TemplateSwap {
    /// Read both configs and check that the boot disk can be exchanged.
    pub async fn prepare<A: ClusterApi>(
        api: &A,
        target: &VmRef,
        template: &VmRef,
        bus: &str,
    ) -> Result<Self, PvmError> {
        let target_config = VmConfig::from_raw(&api.read_config(target).await?, bus)?;
        let template_config = VmConfig::from_raw(&api.read_config(template).await?, bus)?;

        let Some(template_boot) = template_config.boot_disk.clone() else {
            return Err(refuse(format!("template {} has no boot disk", template.vmid)));
        };
        let Some(target_boot) = target_config.boot_disk.as_deref() else {
            return Err(PvmError::BootDiskMissing {
                vmid: target.vmid,
                placeholder: target_config.unused.first().map(|u| u.key.clone()),
            });
        };
        if template_boot != target_boot {
            return Err(refuse(format!(
                "boot disk is {template_boot} on the template but {target_boot} on VM {}",
                target.vmid
            )));
        }
        if template_config.scsi_controller() != target_config.scsi_controller() {
            return Err(refuse(format!(
                "SCSI controller is {} on the template but {} on VM {}",
                template_config.scsi_controller(),
                target_config.scsi_controller(),
                target.vmid
            )));
        }

        Ok(Self {
            target: target.clone(),
            template: template.clone(),
            boot_disk: template_boot,
            bus: bus.into(),
            target_config,
            template_config,
        })
    }

    /// Run the swap. The target must be stopped.
    pub async fn execute<A: ClusterApi>(self, api: &A, aux_name: &str) -> Result<(), PvmError> {
        let aux_id = api.next_id().await?;
        tracing::info!(
            vmid = self.target.vmid,
            template = self.template.vmid,
            aux = aux_id,
            "cloning template into auxiliary VM"
        );
        api.clone_vm(
            &self.template,
            &CloneParams {
                newid: aux_id,
                full: true,
                name: aux_name.into(),
                target: self.target.node.clone(),
                storage: None,
            },
        )
        .await?;

        let result = self.transplant(api, aux_id).await;

        let aux = VmRef::qemu(aux_id, self.target.node.clone());
        match api.destroy(&aux).await {
            Ok(()) => tracing::debug!(aux = aux_id, "auxiliary VM destroyed"),
            Err(e) => tracing::warn!(aux = aux_id, error = %e, "failed to destroy auxiliary VM"),
        }

        if result.is_ok() {
            tracing::info!(vmid = self.target.vmid, template = self.template.vmid, "template swapped");
        }
        result
    }

    async fn transplant<A: ClusterApi>(&self, api: &A, aux_id: u32) -> Result<(), PvmError> {
        let aux = require_vm(api, aux_id).await?;
        let boot = &self.boot_disk;

        api.write_config(&self.target, &ConfigUpdate::deleting([boot.as_str()]))
            .await?;
        api.move_disk(
            &aux,
            &MoveDisk {
                disk: boot.clone(),
                delete_source: true,
                target_vmid: self.target.vmid,
                target_disk: boot.clone(),
            },
        )
        .await?;

        let after = VmConfig::from_raw(&api.read_config(&self.target).await?, &self.bus)?;
        let mut update = ConfigUpdate::default();

        let old_volume = self.target_config.boot_volume.as_deref().map(volume_id);
        let placeholder = after
            .unused
            .iter()
            .find(|u| Some(volume_id(&u.volume)) == old_volume)
            .or_else(|| after.unused.iter().find(|u| u.key == "unused0"));
        match placeholder {
            Some(unused) => update.delete(unused.key.clone()),
            None => tracing::warn!(vmid = self.target.vmid, "no placeholder left for the old boot disk"),
        }

        for key in PROPAGATED_KEYS {
            match (self.template_config.propagated(key), after.propagated(key)) {
                (Some(want), have) if have != Some(want) => update.set(key, want),
                (None, Some(_)) => update.delete(key),
                _ => {}
            }
        }

        if !update.is_empty() {
            api.write_config(&self.target, &update).await?;
        }
        Ok(())
    }
}
