//! VM lifecycle reconciler: create, read, update and delete one VM against
//! its desired [`VmSpec`].
//!
//! Nothing is cached between calls. Every operation re-resolves the VM and
//! re-reads its config; the caller keeps only the vmid (and the last known
//! address) between invocations.

use tokio_util::sync::CancellationToken;

use crate::cloudinit;
use crate::cluster::{
    CloneParams, ClusterApi, ConfigUpdate, PowerStatus, VmRef, require_vm, resolve_template,
};
use crate::config::{ReconcilerConfig, VmSpec};
use crate::disk::drifted_slots;
use crate::error::{ApiErrorKind, PvmError};
use crate::flow::{Step, diff_config, plan_update};
use crate::template::TemplateSwap;
use crate::terminal::RemoteShell;
use crate::vm_config::VmConfig;
use crate::vm_state::VmState;
use crate::wait::{Deadline, wait_for_ipv4, wait_for_status};

pub struct Reconciler<A, R> {
    api: A,
    shell: R,
    config: ReconcilerConfig,
    cancel: CancellationToken,
}

impl<A: ClusterApi, R: RemoteShell> Reconciler<A, R> {
    pub fn new(api: A, shell: R, config: ReconcilerConfig) -> Self {
        Self {
            api,
            shell,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Clone the template, apply the spec and bring the VM to its desired
    /// power state.
    ///
    /// Failures after the clone come back as `CreateIncomplete` carrying the
    /// new vmid, since the VM now exists on the cluster.
    pub async fn create(&self, spec: &VmSpec) -> Result<VmState, PvmError> {
        spec.validate()?;
        let template = resolve_template(&self.api, &spec.template_name).await?;
        let vmid = self.api.next_id().await?;

        tracing::info!(vmid, name = %spec.name, template = template.vmid, node = %spec.target_node, "cloning VM");
        self.api
            .clone_vm(
                &template,
                &CloneParams {
                    newid: vmid,
                    full: true,
                    name: spec.name.clone(),
                    target: spec.target_node.clone(),
                    storage: Some(spec.target_storage.clone()),
                },
            )
            .await?;

        self.provision(vmid, spec)
            .await
            .map_err(|source| PvmError::CreateIncomplete {
                vmid,
                source: Box::new(source),
            })
    }

    async fn provision(&self, vmid: u32, spec: &VmSpec) -> Result<VmState, PvmError> {
        let vm = require_vm(&self.api, vmid).await?;

        let cicustom = match &spec.user_data {
            Some(user_data) => Some(self.write_snippet(&vm, user_data).await?),
            None => None,
        };

        let observed = self.read_config(&vm).await?;
        self.warn_drift(&vm, &observed, spec);
        let diff = diff_config(&observed, spec, cicustom.as_deref(), &self.config);
        if !diff.update.is_empty() {
            self.write(&vm, &diff.update).await?;
        }
        if !diff.disks.detach.is_empty() {
            self.write(&vm, &ConfigUpdate::deleting(diff.disks.detach)).await?;
        }
        if !diff.disks.purge.is_empty() {
            self.write(&vm, &ConfigUpdate::deleting(diff.disks.purge)).await?;
        }

        let ip = match spec.desired_status()? {
            PowerStatus::Running => self.start(&vm).await?,
            PowerStatus::Stopped => None,
        };
        self.snapshot(&vm, ip, false).await
    }

    /// Observe the VM. `Ok(None)` when it no longer exists.
    ///
    /// A running VM with the guest agent enabled gets a short address
    /// refresh; if that fails, `last_ip` is kept.
    pub async fn read(&self, vmid: u32, last_ip: Option<String>) -> Result<Option<VmState>, PvmError> {
        let Some(vm) = self.api.locate(vmid).await? else {
            tracing::info!(vmid, "VM is gone");
            return Ok(None);
        };
        match self.snapshot(&vm, last_ip, true).await {
            Ok(state) => Ok(Some(state)),
            Err(PvmError::Api(e)) if e.kind == ApiErrorKind::NotFound => {
                tracing::info!(vmid, "VM disappeared while reading");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Move the VM from `prior` to `desired`.
    pub async fn update(&self, vmid: u32, prior: &VmSpec, desired: &VmSpec) -> Result<VmState, PvmError> {
        desired.validate()?;
        let vm = require_vm(&self.api, vmid).await?;
        let observed = self.read_config(&vm).await?;
        let power = self.api.power_state(&vm).await?.status;
        let steps = plan_update(&observed, power, prior, desired, &self.config)?;
        self.warn_drift(&vm, &observed, desired);

        // Swap preconditions are checked before anything is mutated.
        let mut swap = None;
        if steps.contains(&Step::SwapTemplate) {
            let template = resolve_template(&self.api, &desired.template_name).await?;
            swap = Some(TemplateSwap::prepare(&self.api, &vm, &template, &self.config.disk_bus).await?);
        }

        tracing::info!(vmid, steps = steps.len(), "updating VM");
        let mut ip = None;
        for step in steps {
            tracing::debug!(vmid, ?step, "update step");
            match step {
                Step::SwapTemplate => {
                    if let Some(swap) = swap.take() {
                        let aux_name = format!("{}{}", desired.name, self.config.aux_name_suffix);
                        swap.execute(&self.api, &aux_name).await?;
                    }
                }
                Step::WriteConfig(update) => self.write(&vm, &update).await?,
                Step::DetachDisks(keys) | Step::PurgeUnused(keys) => {
                    self.write(&vm, &ConfigUpdate::deleting(keys)).await?
                }
                Step::Shutdown => self.shutdown(&vm).await?,
                Step::Start => ip = self.start(&vm).await?,
            }
        }

        let refresh = ip.is_none();
        self.snapshot(&vm, ip, refresh).await
    }

    /// Remove the VM. Deleting a VM that is already gone succeeds.
    ///
    /// The user-data snippet is removed first, on a best-effort basis; the
    /// shutdown, wait and destroy run regardless.
    pub async fn delete(&self, vmid: u32) -> Result<(), PvmError> {
        let Some(vm) = self.api.locate(vmid).await? else {
            tracing::info!(vmid, "VM already gone");
            return Ok(());
        };

        let config = self.read_config(&vm).await?;
        let snippet = cloudinit::snippet_name(vmid);
        match &config.cicustom {
            Some(cicustom)
                if cloudinit::points_at_snippet(cicustom, &self.config.snippet_storage, &snippet) =>
            {
                self.remove_snippet(&vm, &snippet).await
            }
            Some(cicustom) => {
                tracing::debug!(vmid, %cicustom, "cicustom not provisioned here, leaving snippet alone")
            }
            None => {}
        }

        let status = self.api.power_state(&vm).await?.status;
        if status == PowerStatus::Running {
            tracing::info!(vmid, "shutting down VM");
            self.api.shutdown(&vm).await?;
        }
        wait_for_status(&self.api, &vm, PowerStatus::Stopped, self.stop_bounds(), &self.cancel).await?;

        tracing::info!(vmid, "destroying VM");
        self.api.destroy(&vm).await?;
        Ok(())
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn read_config(&self, vm: &VmRef) -> Result<VmConfig, PvmError> {
        let raw = self.api.read_config(vm).await?;
        VmConfig::from_raw(&raw, &self.config.disk_bus)
    }

    async fn write(&self, vm: &VmRef, update: &ConfigUpdate) -> Result<(), PvmError> {
        tracing::debug!(
            vmid = vm.vmid,
            set = ?update.set.keys().collect::<Vec<_>>(),
            delete = ?update.delete_param(),
            "writing config"
        );
        self.api.write_config(vm, update).await?;
        Ok(())
    }

    async fn shutdown(&self, vm: &VmRef) -> Result<(), PvmError> {
        tracing::info!(vmid = vm.vmid, "shutting down VM");
        self.api.shutdown(vm).await?;
        wait_for_status(&self.api, vm, PowerStatus::Stopped, self.stop_bounds(), &self.cancel).await
    }

    /// Start the VM; with the guest agent enabled, wait for its address.
    async fn start(&self, vm: &VmRef) -> Result<Option<String>, PvmError> {
        tracing::info!(vmid = vm.vmid, "starting VM");
        self.api.start(vm).await?;
        let config = self.read_config(vm).await?;
        if !config.agent_enabled {
            return Ok(None);
        }
        let ip = wait_for_ipv4(
            &self.api,
            vm,
            &self.config.primary_interface,
            self.boot_bounds(),
            &self.cancel,
        )
        .await?;
        Ok(Some(ip))
    }

    async fn write_snippet(&self, vm: &VmRef, user_data: &str) -> Result<String, PvmError> {
        let name = cloudinit::snippet_name(vm.vmid);
        let command = cloudinit::write_command(&self.config.snippet_dir, &name, user_data);
        tracing::info!(vmid = vm.vmid, node = %vm.node, snippet = %name, "writing cloud-init snippet");
        self.shell.run(&self.api, &vm.node, &command).await?;
        Ok(cloudinit::cicustom_value(&self.config.snippet_storage, &name))
    }

    async fn remove_snippet(&self, vm: &VmRef, name: &str) {
        let command = cloudinit::remove_command(&self.config.snippet_dir, name);
        match self.shell.run(&self.api, &vm.node, &command).await {
            Ok(()) => tracing::debug!(vmid = vm.vmid, snippet = %name, "removed cloud-init snippet"),
            Err(e) => {
                tracing::warn!(vmid = vm.vmid, snippet = %name, error = %e, "failed to remove cloud-init snippet")
            }
        }
    }

    async fn snapshot(&self, vm: &VmRef, ip: Option<String>, refresh: bool) -> Result<VmState, PvmError> {
        let config = self.read_config(vm).await?;
        let status = self.api.power_state(vm).await?.status;
        // a stopped VM has no address, whatever was seen before
        let mut ip = ip.filter(|_| status == PowerStatus::Running);
        if refresh && status == PowerStatus::Running && config.agent_enabled {
            match wait_for_ipv4(
                &self.api,
                vm,
                &self.config.primary_interface,
                self.refresh_bounds(),
                &self.cancel,
            )
            .await
            {
                Ok(addr) => ip = Some(addr),
                Err(e @ PvmError::Cancelled { .. }) => return Err(e),
                Err(e) => tracing::warn!(vmid = vm.vmid, error = %e, "address refresh failed, keeping last known"),
            }
        }
        Ok(VmState::observe(vm, config, status, ip))
    }

    fn warn_drift(&self, vm: &VmRef, observed: &VmConfig, spec: &VmSpec) {
        for slot in drifted_slots(&observed.disks, &spec.disks) {
            tracing::warn!(
                vmid = vm.vmid,
                slot,
                "disk differs from spec; only adding or removing disks is supported"
            );
        }
    }

    fn stop_bounds(&self) -> Deadline {
        Deadline::new(self.config.stop_timeout(), self.config.poll_interval())
    }

    fn boot_bounds(&self) -> Deadline {
        Deadline::new(self.config.boot_timeout(), self.config.poll_interval())
    }

    fn refresh_bounds(&self) -> Deadline {
        Deadline::new(self.config.refresh_timeout(), self.config.poll_interval())
    }
}
