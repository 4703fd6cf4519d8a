use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::cluster::PowerStatus;
use crate::error::PvmError;

// ── Desired state ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct DiskSpec {
    pub storage: String,
    /// Size in GB.
    pub size: u64,
}

/// Desired VM as declared by the infrastructure engine.
#[derive(Debug, Clone, Facet)]
pub struct VmSpec {
    pub name: String,
    pub template_name: String,
    pub target_node: String,
    pub target_storage: String,
    pub cores: u32,
    /// Memory in MB.
    pub memory: u64,
    #[facet(default)]
    pub onboot: bool,
    #[facet(default = "running")]
    pub status: String,
    #[facet(default)]
    pub user_data: Option<String>,
    #[facet(default)]
    pub disks: Vec<DiskSpec>,
}

impl VmSpec {
    pub fn desired_status(&self) -> Result<PowerStatus, PvmError> {
        self.status.parse()
    }

    pub fn validate(&self) -> Result<(), PvmError> {
        validate_dns_name("name", &self.name)?;
        validate_dns_name("template_name", &self.template_name)?;
        if self.target_node.is_empty() {
            return Err(PvmError::Validation {
                message: "target_node must not be empty".into(),
            });
        }
        if self.target_storage.is_empty() {
            return Err(PvmError::Validation {
                message: "target_storage must not be empty".into(),
            });
        }
        if self.cores < 1 {
            return Err(PvmError::Validation {
                message: "cores must be at least 1".into(),
            });
        }
        if self.memory < 1 {
            return Err(PvmError::Validation {
                message: "memory must be at least 1".into(),
            });
        }
        for (idx, disk) in self.disks.iter().enumerate() {
            if disk.storage.is_empty() {
                return Err(PvmError::Validation {
                    message: format!("disks[{idx}]: storage must not be empty"),
                });
            }
            if disk.size < 1 {
                return Err(PvmError::Validation {
                    message: format!("disks[{idx}]: size must be at least 1"),
                });
            }
        }
        self.desired_status()?;
        Ok(())
    }
}

fn validate_dns_name(field: &str, value: &str) -> Result<(), PvmError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(PvmError::Validation {
            message: format!("{field} is not a valid DNS name (got '{value}')"),
        });
    }
    Ok(())
}

// ── Reconciler settings ───────────────────────────────────

/// Timeouts and cluster conventions used by the reconciler.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ReconcilerConfig {
    #[facet(default = 2000)]
    pub poll_interval_ms: u64,
    #[facet(default = 300)]
    pub stop_timeout_s: u64,
    #[facet(default = 300)]
    pub boot_timeout_s: u64,
    /// Deadline for the opportunistic IP lookup during reads.
    #[facet(default = 1000)]
    pub refresh_timeout_ms: u64,
    /// Silence tolerated between two lines of terminal output.
    #[facet(default = 30)]
    pub terminal_read_timeout_s: u64,
    #[facet(default = "eth0")]
    pub primary_interface: String,
    #[facet(default = "local")]
    pub snippet_storage: String,
    #[facet(default = "/var/lib/vz/snippets")]
    pub snippet_dir: String,
    #[facet(default = "qcow2")]
    pub disk_format: String,
    #[facet(default = "scsi")]
    pub disk_bus: String,
    #[facet(default = "-upgrade")]
    pub aux_name_suffix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            stop_timeout_s: 300,
            boot_timeout_s: 300,
            refresh_timeout_ms: 1000,
            terminal_read_timeout_s: 30,
            primary_interface: "eth0".into(),
            snippet_storage: "local".into(),
            snippet_dir: "/var/lib/vz/snippets".into(),
            disk_format: "qcow2".into(),
            disk_bus: "scsi".into(),
            aux_name_suffix: "-upgrade".into(),
        }
    }
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_s)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_s)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn terminal_read_timeout(&self) -> Duration {
        Duration::from_secs(self.terminal_read_timeout_s)
    }

    pub fn validate(&self) -> Result<(), PvmError> {
        if self.poll_interval_ms == 0 {
            return Err(PvmError::Validation {
                message: "poll_interval_ms must be greater than 0".into(),
            });
        }
        if self.terminal_read_timeout_s == 0 {
            return Err(PvmError::Validation {
                message: "terminal_read_timeout_s must be greater than 0".into(),
            });
        }
        if !matches!(self.disk_bus.as_str(), "scsi" | "virtio" | "sata" | "ide") {
            return Err(PvmError::Validation {
                message: format!(
                    "disk_bus must be one of scsi, virtio, sata, ide (got '{}')",
                    self.disk_bus
                ),
            });
        }
        if self.primary_interface.is_empty() {
            return Err(PvmError::Validation {
                message: "primary_interface must not be empty".into(),
            });
        }
        if !self.snippet_dir.starts_with('/') {
            return Err(PvmError::Validation {
                message: format!("snippet_dir must be absolute (got '{}')", self.snippet_dir),
            });
        }
        Ok(())
    }
}

// ── public API ────────────────────────────────────────────

fn read_toml(path: &Path) -> Result<String, PvmError> {
    std::fs::read_to_string(path).map_err(|source| PvmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_config(path: &Path) -> Result<ReconcilerConfig, PvmError> {
    let contents = read_toml(path)?;
    let config: ReconcilerConfig =
        facet_toml::from_str(&contents).map_err(|e| PvmError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

pub fn load_spec(path: &Path) -> Result<VmSpec, PvmError> {
    let contents = read_toml(path)?;
    let spec: VmSpec = facet_toml::from_str(&contents).map_err(|e| PvmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    spec.validate()?;
    Ok(spec)
}
