//! Update planning.
//!
//! An update is planned as an ordered list of [`Step`]s by a pure function
//! of the observed config, the observed power state and the prior/desired
//! specs. The reconciler executes the steps against the cluster; planning
//! itself never touches it.

pub mod diff;

use crate::cluster::{ConfigUpdate, PowerStatus};
use crate::config::{ReconcilerConfig, VmSpec};
use crate::error::PvmError;
use crate::vm_config::VmConfig;

pub use diff::{ConfigDiff, diff_config};

// ── Steps ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Replace the boot disk with one cloned from the desired template.
    SwapTemplate,
    /// One batched attribute write.
    WriteConfig(ConfigUpdate),
    /// Detach data disks (they become `unusedN` placeholders).
    DetachDisks(Vec<String>),
    /// Remove the placeholders left by the detach.
    PurgeUnused(Vec<String>),
    /// Shut down and wait until stopped.
    Shutdown,
    /// Start and, with the guest agent enabled, wait for an address.
    Start,
}

// ── Planning ────────────────────────────────────────────────────────

/// Attributes that cannot change without recreating the VM.
fn check_immutable(prior: &VmSpec, desired: &VmSpec) -> Result<(), PvmError> {
    let changed = if prior.target_node != desired.target_node {
        Some("target_node")
    } else if prior.target_storage != desired.target_storage {
        Some("target_storage")
    } else if prior.user_data != desired.user_data {
        Some("user_data")
    } else {
        None
    };
    match changed {
        Some(field) => Err(PvmError::RequiresReplacement {
            field: field.into(),
        }),
        None => Ok(()),
    }
}

fn push_config_steps(steps: &mut Vec<Step>, diff: ConfigDiff) {
    if !diff.update.is_empty() {
        steps.push(Step::WriteConfig(diff.update));
    }
    if !diff.disks.detach.is_empty() {
        steps.push(Step::DetachDisks(diff.disks.detach));
    }
    if !diff.disks.purge.is_empty() {
        steps.push(Step::PurgeUnused(diff.disks.purge));
    }
}

/// Plan the steps that move a VM from `prior` to `desired`.
///
/// Power state is reconciled last. A template change always stops the VM
/// first and covers any restart the attribute diff asked for; otherwise
/// the VM is power-cycled at most once.
pub fn plan_update(
    observed: &VmConfig,
    power: PowerStatus,
    prior: &VmSpec,
    desired: &VmSpec,
    config: &ReconcilerConfig,
) -> Result<Vec<Step>, PvmError> {
    check_immutable(prior, desired)?;
    let want = desired.desired_status()?;
    let diff = diff_config(observed, desired, None, config);
    let restart = diff.restart;
    let mut steps = Vec::new();

    if prior.template_name != desired.template_name {
        if power == PowerStatus::Running {
            steps.push(Step::Shutdown);
        }
        steps.push(Step::SwapTemplate);
        push_config_steps(&mut steps, diff);
        if want == PowerStatus::Running {
            steps.push(Step::Start);
        }
        return Ok(steps);
    }

    push_config_steps(&mut steps, diff);
    match (power, want) {
        (PowerStatus::Running, PowerStatus::Running) if restart => {
            steps.push(Step::Shutdown);
            steps.push(Step::Start);
        }
        (PowerStatus::Running, PowerStatus::Stopped) => steps.push(Step::Shutdown),
        (PowerStatus::Stopped, PowerStatus::Running) => steps.push(Step::Start),
        _ => {}
    }
    Ok(steps)
}
