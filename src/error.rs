use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Kind of failure reported by the cluster API client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    Permission,
    Validation,
    /// The in-guest agent is not up yet. Retryable while waiting for boot.
    AgentNotRunning,
    Other,
}

/// Error value returned by a [`crate::cluster::ClusterApi`] implementation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

/// Literal text the cluster puts in agent queries before the guest agent starts.
const AGENT_NOT_RUNNING: &str = "guest agent is not running";

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_agent_not_running(&self) -> bool {
        self.kind == ApiErrorKind::AgentNotRunning || self.message.contains(AGENT_NOT_RUNNING)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum PvmError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("template '{name}' not found")]
    #[diagnostic(help("check the template name with `qm list` on the cluster"))]
    TemplateNotFound { name: String },

    #[error("found {count} templates named '{name}'")]
    #[diagnostic(help("template names must be unique across the cluster"))]
    AmbiguousTemplate { name: String, count: usize },

    #[error("template '{name}' is a {kind} template, not a qemu VM template")]
    WrongTemplateType { name: String, kind: String },

    #[error("refusing template swap: {reason}")]
    #[diagnostic(help("recreate the VM instead of switching to this template"))]
    RefuseIncompatible { reason: String },

    #[error("VM {vmid} has no boot disk")]
    #[diagnostic(help(
        "an earlier template swap was likely interrupted; reattach the old boot volume or recreate the VM before retrying"
    ))]
    BootDiskMissing {
        vmid: u32,
        /// `unusedN` entry that probably holds the detached boot volume.
        placeholder: Option<String>,
    },

    #[error("VM {vmid} did not reach status '{status}' within {waited:?}")]
    Timeout {
        vmid: u32,
        status: String,
        waited: Duration,
    },

    #[error("guest agent of VM {vmid} reported no IPv4 address within {waited:?}")]
    #[diagnostic(help("make sure qemu-guest-agent is installed and enabled in the template"))]
    AgentTimeout { vmid: u32, waited: Duration },

    #[error("wait on VM {vmid} was cancelled")]
    Cancelled { vmid: u32 },

    #[error("terminal proxy on node '{node}' rejected the ticket")]
    TicketRejected { node: String },

    #[error("terminal protocol error: {message}")]
    Protocol { message: String },

    #[error("remote command failed with exit status {exit_status}")]
    CommandFailed { exit_status: i32 },

    #[error("malformed VM config attribute '{key}': {message}")]
    MalformedConfig { key: String, message: String },

    #[error("VM {vmid} does not exist")]
    VmNotFound { vmid: u32 },

    #[error("changing '{field}' requires replacing the VM")]
    RequiresReplacement { field: String },

    #[error("VM {vmid} was created but is not fully provisioned")]
    #[diagnostic(help("the VM exists on the cluster; delete it or retry the update"))]
    CreateIncomplete {
        vmid: u32,
        #[source]
        source: Box<PvmError>,
    },

    #[error("cluster API error: {0}")]
    Api(#[from] ApiError),
}

impl PvmError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        PvmError::Protocol {
            message: message.into(),
        }
    }

    /// Vmid of a VM left behind by a failed create, if any.
    pub fn orphaned_vmid(&self) -> Option<u32> {
        match self {
            PvmError::CreateIncomplete { vmid, .. } => Some(*vmid),
            _ => None,
        }
    }
}
