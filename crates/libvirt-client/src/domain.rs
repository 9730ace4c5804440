//! libvirt domain definition
//!
//! A typed subset of the domain XML schema covering what a bootstrap VM needs.
//! See: https://libvirt.org/formatdomain.html

use crate::xml::XmlWriter;

/// Namespace for passing raw arguments to the QEMU command line
pub const QEMU_NAMESPACE: &str = "http://libvirt.org/schemas/domain/qemu/1.0";

/// Operating system section of a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainOs {
    /// Guest type, `hvm` for hardware virtualization
    pub os_type: String,
    /// Guest CPU architecture; the hypervisor default is used when unset
    pub arch: Option<String>,
    /// Firmware auto-selection (`efi` or `bios`)
    pub firmware: Option<String>,
}

/// Disk attached to a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    /// Path of the backing file on the host
    pub source_file: String,
    pub driver_name: String,
    /// On-disk format the driver opens the file with
    pub driver_type: String,
    /// Guest device name, e.g. `vda`
    pub target_dev: String,
    pub target_bus: String,
}

/// Network interface bound to a host bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInterface {
    pub bridge: String,
    pub mac: String,
    pub model: String,
}

/// Console device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConsole {
    pub target_type: String,
    pub target_port: u32,
}

/// virtio-serial channel backed by a unix socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainChannel {
    pub target_name: String,
}

/// Graphics protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsKind {
    Vnc,
}

impl GraphicsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphicsKind::Vnc => "vnc",
        }
    }
}

/// Graphics device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGraphics {
    pub kind: GraphicsKind,
    /// Let the hypervisor pick a free port
    pub autoport: bool,
}

/// Random number generator device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRng {
    /// Host entropy source, e.g. `/dev/urandom`
    pub backend: String,
}

/// Complete domain definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDefinition {
    pub name: String,
    /// Domain type attribute, `kvm` or `qemu`
    pub domain_type: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub os: DomainOs,
    /// Enabled machine features (`pae`, `acpi`, `apic`, ...)
    pub features: Vec<String>,
    pub cpu_mode: String,
    pub disks: Vec<DomainDisk>,
    pub interfaces: Vec<DomainInterface>,
    pub consoles: Vec<DomainConsole>,
    pub channels: Vec<DomainChannel>,
    pub graphics: Vec<DomainGraphics>,
    pub rng: Option<DomainRng>,
    /// Extra arguments appended to the QEMU command line
    pub qemu_args: Vec<String>,
}

impl DomainDefinition {
    /// Empty hvm domain of the given type
    pub fn new(name: impl Into<String>, domain_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain_type: domain_type.into(),
            memory_mib: 512,
            vcpus: 1,
            os: DomainOs {
                os_type: "hvm".to_string(),
                arch: None,
                firmware: None,
            },
            features: Vec::new(),
            cpu_mode: "host-passthrough".to_string(),
            disks: Vec::new(),
            interfaces: Vec::new(),
            consoles: Vec::new(),
            channels: Vec::new(),
            graphics: Vec::new(),
            rng: None,
            qemu_args: Vec::new(),
        }
    }

    pub fn to_xml(&self) -> String {
        let memory = self.memory_mib.to_string();
        let vcpus = self.vcpus.to_string();

        let mut xml = XmlWriter::new();
        if self.qemu_args.is_empty() {
            xml.open("domain", &[("type", self.domain_type.as_str())]);
        } else {
            xml.open(
                "domain",
                &[("type", self.domain_type.as_str()), ("xmlns:qemu", QEMU_NAMESPACE)],
            );
        }
        xml.text("name", &[], &self.name);
        xml.text("memory", &[("unit", "MiB")], &memory);
        xml.text("vcpu", &[], &vcpus);

        let mut os_attrs: Vec<(&str, &str)> = Vec::new();
        if let Some(firmware) = &self.os.firmware {
            os_attrs.push(("firmware", firmware.as_str()));
        }
        xml.open("os", &os_attrs);
        match &self.os.arch {
            Some(arch) => xml.text("type", &[("arch", arch.as_str())], &self.os.os_type),
            None => xml.text("type", &[], &self.os.os_type),
        }
        xml.close("os");

        if !self.features.is_empty() {
            xml.open("features", &[]);
            for feature in &self.features {
                xml.empty(feature.as_str(), &[]);
            }
            xml.close("features");
        }
        xml.empty("cpu", &[("mode", self.cpu_mode.as_str())]);

        xml.open("devices", &[]);
        for disk in &self.disks {
            xml.open("disk", &[("type", "file"), ("device", "disk")]);
            xml.empty("driver", &[("name", disk.driver_name.as_str()), ("type", disk.driver_type.as_str())]);
            xml.empty("source", &[("file", disk.source_file.as_str())]);
            xml.empty("target", &[("dev", disk.target_dev.as_str()), ("bus", disk.target_bus.as_str())]);
            xml.close("disk");
        }
        for interface in &self.interfaces {
            xml.open("interface", &[("type", "bridge")]);
            xml.empty("mac", &[("address", interface.mac.as_str())]);
            xml.empty("source", &[("bridge", interface.bridge.as_str())]);
            xml.empty("model", &[("type", interface.model.as_str())]);
            xml.close("interface");
        }
        for console in &self.consoles {
            let port = console.target_port.to_string();
            xml.open("console", &[("type", "pty")]);
            xml.empty("target", &[("type", console.target_type.as_str()), ("port", port.as_str())]);
            xml.close("console");
        }
        for channel in &self.channels {
            xml.open("channel", &[("type", "unix")]);
            xml.empty("source", &[("mode", "bind")]);
            xml.empty("target", &[("type", "virtio"), ("name", channel.target_name.as_str())]);
            xml.close("channel");
        }
        for graphics in &self.graphics {
            if graphics.autoport {
                xml.empty(
                    "graphics",
                    &[("type", graphics.kind.as_str()), ("port", "-1"), ("autoport", "yes")],
                );
            } else {
                xml.empty("graphics", &[("type", graphics.kind.as_str())]);
            }
        }
        if let Some(rng) = &self.rng {
            xml.open("rng", &[("model", "virtio")]);
            xml.text("backend", &[("model", "random")], &rng.backend);
            xml.close("rng");
        }
        xml.close("devices");

        if !self.qemu_args.is_empty() {
            xml.open("qemu:commandline", &[]);
            for arg in &self.qemu_args {
                xml.empty("qemu:arg", &[("value", arg.as_str())]);
            }
            xml.close("qemu:commandline");
        }
        xml.close("domain");
        xml.finish()
    }
}
