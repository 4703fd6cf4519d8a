//! Bounded polling of power state and guest-agent addresses.
//!
//! Both waiters poll immediately, then sleep one interval between polls.
//! The deadline is checked after every poll, so the last poll happens no
//! later than the deadline. Cancellation interrupts the sleep.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{AgentInterface, ClusterApi, PowerStatus, VmRef};
use crate::error::PvmError;

/// Poll cadence and deadline for one wait.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Sleep until the next poll. `Err(Cancelled)` if the token fires first.
async fn pause(
    vm: &VmRef,
    deadline: Instant,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), PvmError> {
    let wake = (Instant::now() + interval).min(deadline);
    tokio::select! {
        _ = cancel.cancelled() => Err(PvmError::Cancelled { vmid: vm.vmid }),
        _ = tokio::time::sleep_until(wake) => Ok(()),
    }
}

pub async fn wait_for_status<A: ClusterApi>(
    api: &A,
    vm: &VmRef,
    target: PowerStatus,
    bounds: Deadline,
    cancel: &CancellationToken,
) -> Result<(), PvmError> {
    let started = Instant::now();
    let deadline = started + bounds.timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PvmError::Cancelled { vmid: vm.vmid });
        }
        let state = api.power_state(vm).await?;
        tracing::trace!(vmid = vm.vmid, status = %state.status, want = %target, "polled power state");
        if state.status == target {
            tracing::debug!(vmid = vm.vmid, status = %target, waited = ?started.elapsed(), "VM reached status");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PvmError::Timeout {
                vmid: vm.vmid,
                status: target.to_string(),
                waited: started.elapsed(),
            });
        }
        pause(vm, deadline, bounds.interval, cancel).await?;
    }
}

/// First IPv4 address the agent reports on `iface`.
pub fn primary_ipv4(interfaces: &[AgentInterface], iface: &str) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| i.name == iface)
        .flat_map(|i| &i.ip_addresses)
        .find(|addr| addr.ip_address.parse::<Ipv4Addr>().is_ok())
        .map(|addr| addr.ip_address.clone())
}

/// Wait until the guest agent reports an IPv4 address on the primary NIC.
///
/// "Agent not running" answers and answers without an IPv4 address yet are
/// both retried; any other API error aborts the wait.
pub async fn wait_for_ipv4<A: ClusterApi>(
    api: &A,
    vm: &VmRef,
    iface: &str,
    bounds: Deadline,
    cancel: &CancellationToken,
) -> Result<String, PvmError> {
    let started = Instant::now();
    let deadline = started + bounds.timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PvmError::Cancelled { vmid: vm.vmid });
        }
        match api.agent_interfaces(vm).await {
            Ok(interfaces) => {
                if let Some(ip) = primary_ipv4(&interfaces, iface) {
                    tracing::info!(vmid = vm.vmid, ip = %ip, "guest agent reported address");
                    return Ok(ip);
                }
                tracing::trace!(vmid = vm.vmid, iface, "no IPv4 address yet");
            }
            Err(e) if e.is_agent_not_running() => {
                tracing::trace!(vmid = vm.vmid, "guest agent not running yet");
            }
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Err(PvmError::AgentTimeout {
                vmid: vm.vmid,
                waited: started.elapsed(),
            });
        }
        pause(vm, deadline, bounds.interval, cancel).await?;
    }
}
