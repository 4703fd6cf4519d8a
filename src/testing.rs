//! In-memory cluster for unit tests.
//!
//! Mimics the cluster's observable behavior closely enough for the
//! reconciler: detached disks turn into `unusedN` placeholders, shutdown
//! takes a configurable number of polls, the guest agent can lag behind boot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::cluster::{
    AgentInterface, AgentIpAddress, CloneParams, ClusterApi, ConfigUpdate, MoveDisk, PowerState,
    PowerStatus, RawConfig, TermProxyTicket, VmKind, VmRef,
};
use crate::error::{ApiError, ApiErrorKind, PvmError};
use crate::terminal::RemoteShell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    FindByName(String),
    Locate(u32),
    NextId,
    Clone { template: u32, newid: u32, name: String },
    ReadConfig(u32),
    WriteConfig { vmid: u32, set: Vec<String>, delete: Vec<String> },
    PowerState(u32),
    Start(u32),
    Shutdown(u32),
    Destroy(u32),
    AgentInterfaces(u32),
    MoveDisk { from: u32, to: u32, disk: String },
    Termproxy(String),
    Shell { node: String, command: String },
}

impl Call {
    /// Calls that change cluster state (or run remote commands).
    pub(crate) fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::Clone { .. }
                | Call::WriteConfig { .. }
                | Call::Start(_)
                | Call::Shutdown(_)
                | Call::Destroy(_)
                | Call::MoveDisk { .. }
                | Call::Shell { .. }
        )
    }
}

struct FakeVm {
    node: String,
    kind: VmKind,
    config: RawConfig,
    status: PowerStatus,
    /// Polls left before a requested shutdown completes.
    stopping: Option<u32>,
}

struct State {
    vms: BTreeMap<u32, FakeVm>,
    next_id: u32,
    failures: BTreeMap<&'static str, ApiError>,
    agent_warmup: u32,
    stop_polls: u32,
    ip: Option<String>,
}

pub(crate) struct FakeCluster {
    state: Mutex<State>,
    log: Arc<Mutex<Vec<Call>>>,
}

fn object(value: Value) -> RawConfig {
    value.as_object().cloned().unwrap_or_default()
}

fn disk_key(key: &str) -> bool {
    ["scsi", "virtio", "sata", "ide"].iter().any(|bus| {
        key.strip_prefix(bus)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    })
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                vms: BTreeMap::new(),
                next_id: 100,
                failures: BTreeMap::new(),
                agent_warmup: 0,
                stop_polls: 1,
                ip: Some("10.0.0.5".into()),
            }),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_template(self, vmid: u32, name: &str, config: Value) -> Self {
        let mut config = object(config);
        config.insert("name".into(), json!(name));
        config.insert("template".into(), json!(1));
        self.insert(vmid, "pve", VmKind::Qemu, config, PowerStatus::Stopped);
        self
    }

    pub(crate) fn with_vm(self, vmid: u32, config: Value, status: PowerStatus) -> Self {
        self.insert(vmid, "pve", VmKind::Qemu, object(config), status);
        self
    }

    pub(crate) fn with_container(self, vmid: u32, name: &str) -> Self {
        self.insert(vmid, "pve", VmKind::Lxc, object(json!({"name": name})), PowerStatus::Stopped);
        self
    }

    fn insert(&self, vmid: u32, node: &str, kind: VmKind, config: RawConfig, status: PowerStatus) {
        self.state.lock().unwrap().vms.insert(
            vmid,
            FakeVm {
                node: node.into(),
                kind,
                config,
                status,
                stopping: None,
            },
        );
    }

    pub(crate) fn fail(&self, op: &'static str, err: ApiError) {
        self.state.lock().unwrap().failures.insert(op, err);
    }

    pub(crate) fn agent_warmup(&self, polls: u32) {
        self.state.lock().unwrap().agent_warmup = polls;
    }

    pub(crate) fn stop_polls(&self, polls: u32) {
        self.state.lock().unwrap().stop_polls = polls;
    }

    pub(crate) fn no_ip(&self) {
        self.state.lock().unwrap().ip = None;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.log.lock().unwrap().clear();
    }

    pub(crate) fn config_of(&self, vmid: u32) -> Option<RawConfig> {
        self.state.lock().unwrap().vms.get(&vmid).map(|vm| vm.config.clone())
    }

    pub(crate) fn status_of(&self, vmid: u32) -> Option<PowerStatus> {
        self.state.lock().unwrap().vms.get(&vmid).map(|vm| vm.status)
    }

    pub(crate) fn exists(&self, vmid: u32) -> bool {
        self.state.lock().unwrap().vms.contains_key(&vmid)
    }

    pub(crate) fn shell(&self) -> FakeShell {
        FakeShell {
            log: self.log.clone(),
            exit_status: None,
        }
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }

    fn check(&self, op: &'static str) -> Result<(), ApiError> {
        match self.state.lock().unwrap().failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn with_vm_mut<T>(
        &self,
        vmid: u32,
        f: impl FnOnce(&mut FakeVm) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut state = self.state.lock().unwrap();
        match state.vms.get_mut(&vmid) {
            Some(vm) => f(vm),
            None => Err(ApiError::new(
                ApiErrorKind::NotFound,
                format!("Configuration file 'nodes/pve/qemu-server/{vmid}.conf' does not exist"),
            )),
        }
    }
}

impl ClusterApi for FakeCluster {
    async fn find_by_name(&self, name: &str) -> Result<Vec<VmRef>, ApiError> {
        self.record(Call::FindByName(name.into()));
        self.check("find_by_name")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.config.get("name") == Some(&json!(name)))
            .map(|(vmid, vm)| VmRef {
                vmid: *vmid,
                node: vm.node.clone(),
                kind: vm.kind,
            })
            .collect())
    }

    async fn locate(&self, vmid: u32) -> Result<Option<VmRef>, ApiError> {
        self.record(Call::Locate(vmid));
        self.check("locate")?;
        let state = self.state.lock().unwrap();
        Ok(state.vms.get(&vmid).map(|vm| VmRef {
            vmid,
            node: vm.node.clone(),
            kind: vm.kind,
        }))
    }

    async fn next_id(&self) -> Result<u32, ApiError> {
        self.record(Call::NextId);
        self.check("next_id")?;
        let mut state = self.state.lock().unwrap();
        while state.vms.contains_key(&state.next_id) {
            state.next_id += 1;
        }
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }

    async fn clone_vm(&self, template: &VmRef, params: &CloneParams) -> Result<(), ApiError> {
        self.record(Call::Clone {
            template: template.vmid,
            newid: params.newid,
            name: params.name.clone(),
        });
        self.check("clone_vm")?;
        let mut config = self.with_vm_mut(template.vmid, |vm| Ok(vm.config.clone()))?;
        config.remove("template");
        config.insert("name".into(), json!(params.name));
        for value in config.values_mut() {
            if let Value::String(s) = value {
                *s = s.replace(
                    &format!("vm-{}-", template.vmid),
                    &format!("vm-{}-", params.newid),
                );
            }
        }
        self.insert(params.newid, &params.target, VmKind::Qemu, config, PowerStatus::Stopped);
        Ok(())
    }

    async fn read_config(&self, vm: &VmRef) -> Result<RawConfig, ApiError> {
        self.record(Call::ReadConfig(vm.vmid));
        self.check("read_config")?;
        self.with_vm_mut(vm.vmid, |vm| Ok(vm.config.clone()))
    }

    async fn write_config(&self, vm: &VmRef, update: &ConfigUpdate) -> Result<(), ApiError> {
        self.record(Call::WriteConfig {
            vmid: vm.vmid,
            set: update.set.keys().cloned().collect(),
            delete: update.delete.clone(),
        });
        self.check("write_config")?;
        let vmid = vm.vmid;
        self.with_vm_mut(vmid, |vm| {
            for key in &update.delete {
                let Some(old) = vm.config.remove(key) else {
                    continue;
                };
                if disk_key(key) {
                    let free = (0..)
                        .map(|i| format!("unused{i}"))
                        .find(|k| !vm.config.contains_key(k))
                        .unwrap_or_default();
                    let volume = old.as_str().unwrap_or_default();
                    let volume = volume.split(',').next().unwrap_or_default().to_string();
                    vm.config.insert(free, json!(volume));
                }
            }
            for (key, value) in &update.set {
                let stored = if disk_key(key) {
                    // "local:8,format=qcow2" allocates a fresh 8G volume.
                    let (head, rest) = value.split_once(',').unwrap_or((value.as_str(), ""));
                    match head.split_once(':') {
                        Some((storage, size)) if size.chars().all(|c| c.is_ascii_digit()) => {
                            let mut volume = format!("{storage}:vm-{vmid}-disk-{key},size={size}G");
                            if !rest.is_empty() {
                                volume.push(',');
                                volume.push_str(rest);
                            }
                            json!(volume)
                        }
                        _ => json!(value),
                    }
                } else if let Ok(n) = value.parse::<u64>() {
                    json!(n)
                } else {
                    json!(value)
                };
                vm.config.insert(key.clone(), stored);
            }
            Ok(())
        })
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState, ApiError> {
        self.record(Call::PowerState(vm.vmid));
        self.check("power_state")?;
        self.with_vm_mut(vm.vmid, |vm| {
            match vm.stopping {
                Some(0) => {
                    vm.status = PowerStatus::Stopped;
                    vm.stopping = None;
                }
                Some(n) => vm.stopping = Some(n - 1),
                None => {}
            }
            Ok(PowerState { status: vm.status })
        })
    }

    async fn start(&self, vm: &VmRef) -> Result<(), ApiError> {
        self.record(Call::Start(vm.vmid));
        self.check("start")?;
        self.with_vm_mut(vm.vmid, |vm| {
            vm.status = PowerStatus::Running;
            vm.stopping = None;
            Ok(())
        })
    }

    async fn shutdown(&self, vm: &VmRef) -> Result<(), ApiError> {
        self.record(Call::Shutdown(vm.vmid));
        self.check("shutdown")?;
        let polls = self.state.lock().unwrap().stop_polls;
        self.with_vm_mut(vm.vmid, |vm| {
            if vm.status == PowerStatus::Running {
                vm.stopping = Some(polls);
            }
            Ok(())
        })
    }

    async fn destroy(&self, vm: &VmRef) -> Result<(), ApiError> {
        self.record(Call::Destroy(vm.vmid));
        self.check("destroy")?;
        let vmid = vm.vmid;
        self.with_vm_mut(vmid, |vm| {
            if vm.status == PowerStatus::Running {
                return Err(ApiError::new(
                    ApiErrorKind::Validation,
                    format!("VM {vmid} is running - destroy failed"),
                ));
            }
            Ok(())
        })?;
        self.state.lock().unwrap().vms.remove(&vmid);
        Ok(())
    }

    async fn agent_interfaces(&self, vm: &VmRef) -> Result<Vec<AgentInterface>, ApiError> {
        self.record(Call::AgentInterfaces(vm.vmid));
        self.check("agent_interfaces")?;
        let running = self.with_vm_mut(vm.vmid, |vm| Ok(vm.status == PowerStatus::Running))?;
        let mut state = self.state.lock().unwrap();
        if !running || state.agent_warmup > 0 {
            state.agent_warmup = state.agent_warmup.saturating_sub(1);
            return Err(ApiError::new(
                ApiErrorKind::Other,
                format!("VM {} qmp command 'guest-network-get-interfaces' failed - QEMU guest agent is not running", vm.vmid),
            ));
        }
        let addr = |ip: &str, kind: &str| AgentIpAddress {
            ip_address: ip.into(),
            ip_address_type: Some(kind.into()),
        };
        let mut eth0 = vec![addr("fe80::be24:11ff:fe4a:1", "ipv6")];
        if let Some(ip) = &state.ip {
            eth0.push(addr(ip, "ipv4"));
        }
        Ok(vec![
            AgentInterface {
                name: "lo".into(),
                ip_addresses: vec![addr("127.0.0.1", "ipv4")],
            },
            AgentInterface {
                name: "eth0".into(),
                ip_addresses: eth0,
            },
        ])
    }

    async fn move_disk(&self, vm: &VmRef, params: &MoveDisk) -> Result<(), ApiError> {
        self.record(Call::MoveDisk {
            from: vm.vmid,
            to: params.target_vmid,
            disk: params.disk.clone(),
        });
        self.check("move_disk")?;
        let volume = self.with_vm_mut(vm.vmid, |vm| {
            let volume = if params.delete_source {
                vm.config.remove(&params.disk)
            } else {
                vm.config.get(&params.disk).cloned()
            };
            volume.ok_or_else(|| ApiError::new(ApiErrorKind::Validation, "disk not found"))
        })?;
        self.with_vm_mut(params.target_vmid, |target| {
            target.config.insert(params.target_disk.clone(), volume);
            Ok(())
        })
    }

    async fn termproxy(&self, node: &str) -> Result<TermProxyTicket, ApiError> {
        self.record(Call::Termproxy(node.into()));
        self.check("termproxy")?;
        Ok(TermProxyTicket {
            port: 5900,
            ticket: "PVEVNC:TICKET".into(),
            upid: "UPID:pve:termproxy".into(),
            user: "root@pam".into(),
        })
    }
}

/// Remote shell that records commands into the cluster's call log.
pub(crate) struct FakeShell {
    log: Arc<Mutex<Vec<Call>>>,
    exit_status: Option<i32>,
}

impl FakeShell {
    pub(crate) fn failing(mut self, exit_status: i32) -> Self {
        self.exit_status = Some(exit_status);
        self
    }
}

impl RemoteShell for FakeShell {
    async fn run<A: ClusterApi>(&self, _api: &A, node: &str, command: &str) -> Result<(), PvmError> {
        self.log.lock().unwrap().push(Call::Shell {
            node: node.into(),
            command: command.into(),
        });
        match self.exit_status {
            Some(exit_status) => Err(PvmError::CommandFailed { exit_status }),
            None => Ok(()),
        }
    }
}
