//! Typed view of a guest's raw config attribute map.
//!
//! The cluster returns loosely typed JSON: numbers sometimes arrive as
//! strings, booleans as `0`/`1`. Every conversion here fails with
//! `MalformedConfig` instead of guessing.

use serde_json::Value;

use crate::cluster::RawConfig;
use crate::error::PvmError;
use crate::util::parse_size_gb;

/// Template-derived scalar attributes copied onto a VM on template swap.
pub const PROPAGATED_KEYS: [&str; 3] = ["ostype", "vga", "cpu"];

/// Fallback boot devices, probed in order when `boot` names none.
const BOOT_CANDIDATES: [&str; 4] = ["scsi0", "virtio0", "sata0", "ide0"];

/// A data disk attached at `<bus><slot>`, slot >= 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSlot {
    pub slot: u32,
    pub storage: String,
    pub size_gb: u64,
    /// Full volume string, e.g. `local:vm-100-disk-1,size=8G`.
    pub volume: String,
}

/// `unusedN` placeholder left behind by a detach without erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusedDisk {
    pub key: String,
    pub volume: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmConfig {
    pub name: Option<String>,
    pub cores: Option<u32>,
    pub memory: Option<u64>,
    pub onboot: bool,
    pub agent_enabled: bool,
    pub cicustom: Option<String>,
    pub ostype: Option<String>,
    pub vga: Option<String>,
    pub cpu: Option<String>,
    pub scsihw: Option<String>,
    pub boot_disk: Option<String>,
    pub boot_volume: Option<String>,
    pub disks: Vec<DiskSlot>,
    /// Every taken `<bus>N` index with N >= 1, CD-ROM drives included.
    pub bus_slots: Vec<u32>,
    pub unused: Vec<UnusedDisk>,
}

impl VmConfig {
    /// Build the typed record. `bus` selects which device family holds data
    /// disks (`scsi` → `scsi1`, `scsi2`, ...).
    pub fn from_raw(raw: &RawConfig, bus: &str) -> Result<Self, PvmError> {
        let boot_disk = boot_disk(raw)?;
        let boot_volume = match &boot_disk {
            Some(key) => string(raw, key)?,
            None => None,
        };

        Ok(Self {
            name: string(raw, "name")?,
            cores: uint(raw, "cores")?
                .map(|n| {
                    u32::try_from(n).map_err(|_| malformed("cores", format!("{n} out of range")))
                })
                .transpose()?,
            memory: uint(raw, "memory")?,
            onboot: flag(raw, "onboot")?.unwrap_or(false),
            agent_enabled: agent_enabled(string(raw, "agent")?.as_deref()),
            cicustom: string(raw, "cicustom")?.filter(|s| !s.trim().is_empty()),
            ostype: string(raw, "ostype")?,
            vga: string(raw, "vga")?,
            cpu: string(raw, "cpu")?,
            scsihw: string(raw, "scsihw")?,
            boot_disk,
            boot_volume,
            disks: data_disks(raw, bus)?,
            bus_slots: bus_slots(raw, bus),
            unused: unused_disks(raw)?,
        })
    }

    /// Value of one of [`PROPAGATED_KEYS`].
    pub fn propagated(&self, key: &str) -> Option<&str> {
        match key {
            "ostype" => self.ostype.as_deref(),
            "vga" => self.vga.as_deref(),
            "cpu" => self.cpu.as_deref(),
            _ => None,
        }
    }

    pub fn scsi_controller(&self) -> &str {
        // The cluster omits scsihw when it is the default controller.
        self.scsihw.as_deref().unwrap_or("lsi")
    }
}

fn malformed(key: &str, message: impl Into<String>) -> PvmError {
    PvmError::MalformedConfig {
        key: key.into(),
        message: message.into(),
    }
}

fn string(raw: &RawConfig, key: &str) -> Result<Option<String>, PvmError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(malformed(key, format!("expected a string, got {other}"))),
    }
}

fn uint(raw: &RawConfig, key: &str) -> Result<Option<u64>, PvmError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return Ok(Some(v));
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as u64)),
                _ => Err(malformed(key, format!("expected a non-negative integer, got {n}"))),
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| malformed(key, format!("expected an integer, got '{s}'"))),
        Some(other) => Err(malformed(key, format!("expected an integer, got {other}"))),
    }
}

fn flag(raw: &RawConfig, key: &str) -> Result<Option<bool>, PvmError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(malformed(key, format!("expected 0 or 1, got {n}"))),
        },
        Some(Value::String(s)) => match s.trim() {
            "0" | "false" => Ok(Some(false)),
            "1" | "true" => Ok(Some(true)),
            _ => Err(malformed(key, format!("expected 0 or 1, got '{s}'"))),
        },
        Some(other) => Err(malformed(key, format!("expected a boolean, got {other}"))),
    }
}

/// `agent` is a property string: `1`, `enabled=1,fstrim_cloned_disks=1`, ...
fn agent_enabled(agent: Option<&str>) -> bool {
    let Some(agent) = agent else {
        return false;
    };
    agent.split(',').enumerate().any(|(i, part)| {
        let part = part.trim();
        match part.split_once('=') {
            Some(("enabled", v)) => v == "1",
            Some(_) => false,
            None => i == 0 && part == "1",
        }
    })
}

/// Option value out of a volume property string like `local:vm-1-disk-0,size=8G`.
fn volume_option<'a>(volume: &'a str, key: &str) -> Option<&'a str> {
    volume
        .split(',')
        .skip(1)
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn is_cdrom(volume: &str) -> bool {
    volume_option(volume, "media") == Some("cdrom")
}

fn is_disk_key(key: &str) -> bool {
    ["scsi", "virtio", "sata", "ide"].iter().any(|bus| {
        key.strip_prefix(bus)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    })
}

fn boot_disk(raw: &RawConfig) -> Result<Option<String>, PvmError> {
    let is_bootable = |key: &str| -> Result<bool, PvmError> {
        Ok(is_disk_key(key) && string(raw, key)?.is_some_and(|v| !is_cdrom(&v)))
    };

    if let Some(boot) = string(raw, "boot")? {
        let order = boot
            .split(',')
            .find_map(|part| part.trim().strip_prefix("order="));
        if let Some(order) = order {
            for dev in order.split(';') {
                if is_bootable(dev)? {
                    return Ok(Some(dev.to_string()));
                }
            }
        }
    }

    if let Some(dev) = string(raw, "bootdisk")? {
        if is_bootable(&dev)? {
            return Ok(Some(dev));
        }
    }

    for dev in BOOT_CANDIDATES {
        if is_bootable(dev)? {
            return Ok(Some(dev.to_string()));
        }
    }
    Ok(None)
}

/// Index of a `<bus>N` device key, N >= 1.
fn bus_index(key: &str, bus: &str) -> Option<u32> {
    key.strip_prefix(bus)
        .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n >= 1)
}

fn bus_slots(raw: &RawConfig, bus: &str) -> Vec<u32> {
    let mut slots: Vec<u32> = raw
        .iter()
        .filter(|(_, value)| !value.is_null())
        .filter_map(|(key, _)| bus_index(key, bus))
        .collect();
    slots.sort_unstable();
    slots
}

fn data_disks(raw: &RawConfig, bus: &str) -> Result<Vec<DiskSlot>, PvmError> {
    let mut disks = Vec::new();
    for (key, _) in raw.iter() {
        let Some(slot) = bus_index(key, bus) else {
            continue;
        };
        let Some(volume) = string(raw, key)? else {
            continue;
        };
        if is_cdrom(&volume) {
            continue;
        }
        let storage = volume
            .split(',')
            .next()
            .and_then(|v| v.split_once(':'))
            .map(|(storage, _)| storage.to_string())
            .ok_or_else(|| malformed(key, format!("volume '{volume}' has no storage prefix")))?;
        let size_gb = match volume_option(&volume, "size") {
            Some(size) => parse_size_gb(size).map_err(|e| malformed(key, e.to_string()))?,
            None => 0,
        };
        disks.push(DiskSlot {
            slot,
            storage,
            size_gb,
            volume,
        });
    }
    disks.sort_by_key(|d| d.slot);
    Ok(disks)
}

fn unused_disks(raw: &RawConfig) -> Result<Vec<UnusedDisk>, PvmError> {
    let mut unused = Vec::new();
    for (key, _) in raw.iter() {
        let Some(index) = key.strip_prefix("unused").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(volume) = string(raw, key)? {
            unused.push((index, UnusedDisk {
                key: key.clone(),
                volume,
            }));
        }
    }
    unused.sort_by_key(|(index, _)| *index);
    Ok(unused.into_iter().map(|(_, u)| u).collect())
}
