//! libvirt storage models
//!
//! Definitions are written to XML and handed to the hypervisor; descriptions
//! are read back from the XML the hypervisor returns.
//! See: https://libvirt.org/formatstorage.html

use crate::error::HypervisorError;
use crate::xml::{XmlDocument, XmlWriter};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Disk image format of a storage volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    Raw,
    Qcow2,
}

impl VolumeFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeFormat::Raw => "raw",
            VolumeFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeFormat {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(VolumeFormat::Raw),
            "qcow2" => Ok(VolumeFormat::Qcow2),
            other => Err(HypervisorError::Xml(format!("unsupported volume format '{}'", other))),
        }
    }
}

/// Directory-backed storage pool definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePoolDefinition {
    pub name: String,
    /// Directory holding the pool's volumes
    pub path: String,
}

impl StoragePoolDefinition {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = XmlWriter::new();
        xml.open("pool", &[("type", "dir")]);
        xml.text("name", &[], &self.name);
        xml.open("target", &[]);
        xml.text("path", &[], &self.path);
        xml.close("target");
        xml.close("pool");
        xml.finish()
    }
}

/// Runtime state of a storage pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub active: bool,
    pub autostart: bool,
}

/// Backing store of a copy-on-write volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStore {
    /// Path of the backing volume on the hypervisor host
    pub path: String,
    /// On-disk format of the backing volume
    pub format: String,
}

/// Storage volume definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolumeDefinition {
    pub name: String,
    /// Declared capacity in bytes
    pub capacity: u64,
    pub format: VolumeFormat,
    pub backing_store: Option<BackingStore>,
}

impl StorageVolumeDefinition {
    /// New volume definition.
    ///
    /// The format starts out as qcow2, the same placeholder libvirt tooling
    /// uses for new volumes; callers override it once the content is known.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            format: VolumeFormat::Qcow2,
            backing_store: None,
        }
    }

    pub fn with_format(mut self, format: VolumeFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_backing_store(mut self, backing_store: BackingStore) -> Self {
        self.backing_store = Some(backing_store);
        self
    }

    pub fn to_xml(&self) -> String {
        let capacity = self.capacity.to_string();
        let mut xml = XmlWriter::new();
        xml.open("volume", &[]);
        xml.text("name", &[], &self.name);
        xml.text("capacity", &[("unit", "bytes")], &capacity);
        xml.open("target", &[]);
        xml.empty("format", &[("type", self.format.as_str())]);
        xml.close("target");
        if let Some(backing) = &self.backing_store {
            xml.open("backingStore", &[]);
            xml.text("path", &[], &backing.path);
            xml.empty("format", &[("type", backing.format.as_str())]);
            xml.close("backingStore");
        }
        xml.close("volume");
        xml.finish()
    }
}

/// Storage volume as described by `vol-dumpxml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescription {
    pub name: String,
    /// Resolved path of the volume on the hypervisor host
    pub path: String,
    /// On-disk format reported by the hypervisor
    pub format: String,
    pub capacity: Option<u64>,
    /// Size of the file on disk; for qcow2 this differs from `capacity`
    pub physical: Option<u64>,
    pub backing_store: Option<BackingStore>,
    /// Last modification time of the volume's content
    pub mtime: Option<SystemTime>,
}

impl VolumeDescription {
    pub fn from_xml(xml: &str) -> Result<Self, HypervisorError> {
        let doc = XmlDocument::parse(xml)?;

        let backing_store = match doc.text("volume/backingStore/path") {
            Some(path) => Some(BackingStore {
                path: path.to_string(),
                format: doc
                    .attr("volume/backingStore/format", "type")
                    .unwrap_or("raw")
                    .to_string(),
            }),
            None => None,
        };

        Ok(Self {
            name: required_text(&doc, "volume", "volume/name")?,
            path: required_text(&doc, "volume", "volume/target/path")?,
            format: doc
                .attr("volume/target/format", "type")
                .ok_or_else(|| HypervisorError::MissingElement {
                    document: "volume",
                    element: "volume/target/format@type".to_string(),
                })?
                .to_string(),
            capacity: doc.text("volume/capacity").and_then(|c| c.parse().ok()),
            physical: doc.text("volume/physical").and_then(|c| c.parse().ok()),
            backing_store,
            mtime: doc
                .text("volume/target/timestamps/mtime")
                .and_then(parse_epoch_timestamp),
        })
    }
}

/// Host capabilities as reported by `capabilities`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Host CPU architecture, e.g. `x86_64` or `aarch64`
    pub arch: String,
}

impl HostCapabilities {
    pub fn from_xml(xml: &str) -> Result<Self, HypervisorError> {
        let doc = XmlDocument::parse(xml)?;
        Ok(Self {
            arch: required_text(&doc, "capabilities", "capabilities/host/cpu/arch")?,
        })
    }
}

/// Domain run state as reported by `domstate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    ShutOff,
    Other(String),
}

impl DomainState {
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "running" => DomainState::Running,
            "paused" => DomainState::Paused,
            "shut off" => DomainState::ShutOff,
            other => DomainState::Other(other.to_string()),
        }
    }

    /// Whether the domain has a live QEMU process
    pub fn is_active(&self) -> bool {
        match self {
            DomainState::Running | DomainState::Paused => true,
            DomainState::ShutOff => false,
            DomainState::Other(state) => matches!(state.as_str(), "idle" | "in shutdown" | "pmsuspended"),
        }
    }
}

/// Flags for undefining a domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndefineFlags {
    /// Remove the domain's NVRAM file
    pub nvram: bool,
    /// Remove any managed save image
    pub managed_save: bool,
    /// Remove snapshot metadata
    pub snapshots_metadata: bool,
}

impl UndefineFlags {
    /// Plain undefine
    pub const NONE: UndefineFlags = UndefineFlags {
        nvram: false,
        managed_save: false,
        snapshots_metadata: false,
    };

    /// Everything a teardown wants removed along with the domain
    pub const ALL: UndefineFlags = UndefineFlags {
        nvram: true,
        managed_save: true,
        snapshots_metadata: true,
    };

    /// virsh `undefine` arguments for these flags
    pub fn as_args(self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.nvram {
            args.push("--nvram");
        }
        if self.managed_save {
            args.push("--managed-save");
        }
        if self.snapshots_metadata {
            args.push("--snapshots-metadata");
        }
        args
    }
}

/// Parse a libvirt `seconds.nanoseconds` timestamp
pub fn parse_epoch_timestamp(value: &str) -> Option<SystemTime> {
    let (seconds, fraction) = match value.split_once('.') {
        Some((seconds, fraction)) => (seconds, fraction),
        None => (value, ""),
    };
    let seconds: u64 = seconds.trim().parse().ok()?;
    let nanos: u32 = if fraction.is_empty() {
        0
    } else {
        // libvirt prints nine digits; pad or cut anything else to nanoseconds
        let mut digits: String = fraction.chars().take(9).collect();
        while digits.len() < 9 {
            digits.push('0');
        }
        digits.parse().ok()?
    };
    UNIX_EPOCH.checked_add(Duration::new(seconds, nanos))
}

/// Format a time as a libvirt `seconds.nanoseconds` timestamp
pub fn format_epoch_timestamp(time: SystemTime) -> String {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos())
}

fn required_text(
    doc: &XmlDocument,
    document: &'static str,
    path: &str,
) -> Result<String, HypervisorError> {
    doc.text(path)
        .map(str::to_string)
        .ok_or_else(|| HypervisorError::MissingElement {
            document,
            element: path.to_string(),
        })
}
