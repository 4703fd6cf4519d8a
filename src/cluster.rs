//! Contract of the virtualization cluster's management API.
//!
//! The crate never talks HTTP itself: callers hand in a [`ClusterApi`]
//! implementation and the reconciler drives it. Wire records derive
//! `Deserialize` so an implementation can decode the cluster's JSON directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer};

use crate::error::{ApiError, PvmError};

/// Raw attribute map as returned by a config read.
pub type RawConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    Qemu,
    Lxc,
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmKind::Qemu => f.write_str("qemu"),
            VmKind::Lxc => f.write_str("lxc"),
        }
    }
}

/// A resolved guest: vmid plus the node and type it lives on.
///
/// Becomes stale when the guest is removed behind our back, so every
/// mutating operation re-resolves it with [`ClusterApi::locate`] first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub vmid: u32,
    pub node: String,
    pub kind: VmKind,
}

impl VmRef {
    pub fn qemu(vmid: u32, node: impl Into<String>) -> Self {
        Self {
            vmid,
            node: node.into(),
            kind: VmKind::Qemu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneParams {
    pub newid: u32,
    pub full: bool,
    pub name: String,
    pub target: String,
    /// Storage for a full clone. `None` keeps the template's storage.
    pub storage: Option<String>,
}

/// One config write: attributes to set plus attributes to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub set: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

impl ConfigUpdate {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set.insert(key.into(), value.into());
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.delete.push(key.into());
    }

    pub fn deleting<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            set: BTreeMap::new(),
            delete: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }

    /// Value of the `delete` request parameter.
    pub fn delete_param(&self) -> Option<String> {
        (!self.delete.is_empty()).then(|| self.delete.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    Running,
    Stopped,
}

impl PowerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerStatus::Running => "running",
            PowerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerStatus {
    type Err = PvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(PowerStatus::Running),
            "stopped" => Ok(PowerStatus::Stopped),
            other => Err(PvmError::Validation {
                message: format!("status must be 'running' or 'stopped' (got '{other}')"),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerState {
    pub status: PowerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type", default)]
    pub ip_address_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveDisk {
    pub disk: String,
    pub delete_source: bool,
    pub target_vmid: u32,
    pub target_disk: String,
}

/// Response of `POST /nodes/{node}/termproxy`.
#[derive(Debug, Clone, Deserialize)]
pub struct TermProxyTicket {
    #[serde(deserialize_with = "port_from_any")]
    pub port: u16,
    pub ticket: String,
    #[serde(default)]
    pub upid: String,
    pub user: String,
}

fn port_from_any<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Text(String),
    }

    match Port::deserialize(de)? {
        Port::Num(n) => Ok(n),
        Port::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Credential shared by the API client and the terminal proxy connection.
#[derive(Clone)]
pub enum Credential {
    ApiToken(String),
    Ticket { ticket: String, csrf_token: String },
}

impl Credential {
    /// HTTP headers that authenticate a request with this credential.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Credential::ApiToken(token) => vec![("Authorization", format!("PVEAPIToken={token}"))],
            Credential::Ticket { ticket, csrf_token } => vec![
                ("Cookie", format!("PVEAuthCookie={ticket}")),
                ("CSRFPreventionToken", csrf_token.clone()),
            ],
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiToken(_) => f.write_str("Credential::ApiToken(..)"),
            Credential::Ticket { .. } => f.write_str("Credential::Ticket(..)"),
        }
    }
}

/// Operations consumed from the cluster's management API.
#[allow(async_fn_in_trait)] // generic-only use, no dyn dispatch
pub trait ClusterApi {
    /// All guests (templates included) carrying this name.
    async fn find_by_name(&self, name: &str) -> Result<Vec<VmRef>, ApiError>;
    /// Existence check; resolves the node a vmid lives on.
    async fn locate(&self, vmid: u32) -> Result<Option<VmRef>, ApiError>;
    async fn next_id(&self) -> Result<u32, ApiError>;
    async fn clone_vm(&self, template: &VmRef, params: &CloneParams) -> Result<(), ApiError>;
    async fn read_config(&self, vm: &VmRef) -> Result<RawConfig, ApiError>;
    async fn write_config(&self, vm: &VmRef, update: &ConfigUpdate) -> Result<(), ApiError>;
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState, ApiError>;
    async fn start(&self, vm: &VmRef) -> Result<(), ApiError>;
    async fn shutdown(&self, vm: &VmRef) -> Result<(), ApiError>;
    async fn destroy(&self, vm: &VmRef) -> Result<(), ApiError>;
    async fn agent_interfaces(&self, vm: &VmRef) -> Result<Vec<AgentInterface>, ApiError>;
    async fn move_disk(&self, vm: &VmRef, params: &MoveDisk) -> Result<(), ApiError>;
    async fn termproxy(&self, node: &str) -> Result<TermProxyTicket, ApiError>;
}

/// Resolve a template name to exactly one qemu guest.
pub async fn resolve_template<A: ClusterApi>(api: &A, name: &str) -> Result<VmRef, PvmError> {
    let mut found = api.find_by_name(name).await?;
    match found.len() {
        0 => Err(PvmError::TemplateNotFound { name: name.into() }),
        1 => {
            let template = found.remove(0);
            if template.kind != VmKind::Qemu {
                return Err(PvmError::WrongTemplateType {
                    name: name.into(),
                    kind: template.kind.to_string(),
                });
            }
            Ok(template)
        }
        count => Err(PvmError::AmbiguousTemplate {
            name: name.into(),
            count,
        }),
    }
}

/// Re-validate a vmid before mutating it.
pub async fn require_vm<A: ClusterApi>(api: &A, vmid: u32) -> Result<VmRef, PvmError> {
    api.locate(vmid)
        .await?
        .ok_or(PvmError::VmNotFound { vmid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termproxy_port_accepts_string() {
        let json = r#"{"port":"5900","ticket":"PVEVNC:abc","upid":"UPID:pve:1","user":"root@pam"}"#;
        let ticket: TermProxyTicket = serde_json::from_str(json).unwrap();
        assert_eq!(ticket.port, 5900);
        assert_eq!(ticket.user, "root@pam");
    }

    #[test]
    fn termproxy_port_accepts_number() {
        let json = r#"{"port":5901,"ticket":"t","user":"root@pam"}"#;
        let ticket: TermProxyTicket = serde_json::from_str(json).unwrap();
        assert_eq!(ticket.port, 5901);
        assert!(ticket.upid.is_empty());
    }

    #[test]
    fn agent_interfaces_decode() {
        let json = r#"[{"name":"eth0","ip-addresses":[{"ip-address":"10.0.0.5","ip-address-type":"ipv4"}]},{"name":"lo"}]"#;
        let ifaces: Vec<AgentInterface> = serde_json::from_str(json).unwrap();
        assert_eq!(ifaces[0].ip_addresses[0].ip_address, "10.0.0.5");
        assert!(ifaces[1].ip_addresses.is_empty());
    }

    #[test]
    fn power_status_round_trips_through_str() {
        assert_eq!("running".parse::<PowerStatus>().unwrap(), PowerStatus::Running);
        assert_eq!(PowerStatus::Stopped.to_string(), "stopped");
        assert!("paused".parse::<PowerStatus>().is_err());
    }

    #[test]
    fn delete_param_joins_keys() {
        let update = ConfigUpdate::deleting(["scsi2", "scsi3"]);
        assert_eq!(update.delete_param().as_deref(), Some("scsi2,scsi3"));
        assert_eq!(ConfigUpdate::default().delete_param(), None);
    }

    #[test]
    fn token_credential_headers() {
        let headers = Credential::ApiToken("root@pam!ci=secret".into()).headers();
        assert_eq!(headers, vec![("Authorization", "PVEAPIToken=root@pam!ci=secret".to_string())]);
    }

    #[test]
    fn ticket_credential_headers() {
        let headers = Credential::Ticket {
            ticket: "PVE:root@pam:1".into(),
            csrf_token: "csrf".into(),
        }
        .headers();
        assert_eq!(headers[0], ("Cookie", "PVEAuthCookie=PVE:root@pam:1".to_string()));
        assert_eq!(headers[1], ("CSRFPreventionToken", "csrf".to_string()));
    }
}
