//! Bootstrap domain builder
//!
//! Turns the provisioning config, the host architecture and the uploaded
//! volumes into a complete domain definition, then defines and boots it.

use crate::config::ProvisioningConfig;
use crate::error::BootstrapError;
use crate::orchestrator::ResourceState;
use crate::overrides::HostOverrides;
use libvirt_client::{
    DomainChannel, DomainConsole, DomainDefinition, DomainDisk, DomainGraphics, DomainInterface, DomainRng,
    GraphicsKind, Hypervisor,
};
use tracing::{debug, info};

/// fw_cfg entry the CoreOS first-boot agent reads its config from
pub const IGNITION_FW_CFG_NAME: &str = "opt/com.coreos/config";

/// Whether the architecture lacks graphics device support
fn lacks_graphics(arch: &str) -> bool {
    arch == "aarch64" || arch == "s390x" || arch.starts_with("ppc64")
}

/// Build the bootstrap domain definition
///
/// # Arguments
/// * `name` - Domain name
/// * `arch` - Host CPU architecture from the capabilities
/// * `main_volume_path` - Root disk, always a qcow2 overlay
/// * `ignition_path` - Absolute path of the uploaded ignition volume
pub fn build_domain(
    name: &str,
    arch: &str,
    config: &ProvisioningConfig,
    overrides: &HostOverrides,
    main_volume_path: &str,
    ignition_path: &str,
) -> DomainDefinition {
    let mut domain = DomainDefinition::new(name, overrides.machine_type.as_str());
    domain.memory_mib = config.bootstrap_memory_mib;
    domain.vcpus = config.bootstrap_vcpus;
    domain.os.arch = Some(arch.to_string());
    if arch == "aarch64" {
        // Let libvirt pick the UEFI firmware and NVRAM template
        domain.os.firmware = Some("efi".to_string());
    }
    domain.features = vec!["pae".to_string(), "acpi".to_string(), "apic".to_string()];
    domain.cpu_mode = "host-passthrough".to_string();

    domain.disks.push(DomainDisk {
        source_file: main_volume_path.to_string(),
        driver_name: "qemu".to_string(),
        driver_type: "qcow2".to_string(),
        target_dev: "vda".to_string(),
        target_bus: "virtio".to_string(),
    });

    // One NIC per bridge, in config order, MAC pinned
    domain.interfaces = config
        .bridges
        .iter()
        .map(|bridge| DomainInterface {
            bridge: bridge.name.clone(),
            mac: bridge.mac.clone(),
            model: "virtio".to_string(),
        })
        .collect();

    let console_type = if arch == "s390x" { "sclp" } else { "serial" };
    domain.consoles.push(DomainConsole {
        target_type: console_type.to_string(),
        target_port: 0,
    });
    domain.channels.push(DomainChannel {
        target_name: "org.qemu.guest_agent.0".to_string(),
    });
    if !lacks_graphics(arch) {
        domain.graphics.push(DomainGraphics {
            kind: GraphicsKind::Vnc,
            autoport: true,
        });
    }
    domain.rng = Some(DomainRng {
        backend: overrides.rng_device.clone(),
    });

    domain.qemu_args = vec![
        "-fw_cfg".to_string(),
        format!("name={},file={}", IGNITION_FW_CFG_NAME, ignition_path),
    ];
    domain
}

/// Define and start a domain
///
/// A domain left by an earlier run is started if it is not running and left
/// alone if it is.
pub async fn boot_domain(
    hypervisor: &dyn Hypervisor,
    definition: &DomainDefinition,
) -> Result<ResourceState, BootstrapError> {
    let name = definition.name.as_str();
    match hypervisor.lookup_domain(name).await? {
        Some(state) if state.is_active() => {
            info!("Domain {} is already running", name);
            Ok(ResourceState::Reused)
        }
        Some(_) => {
            info!("Starting existing domain {}", name);
            hypervisor.start_domain(name).await?;
            Ok(ResourceState::Reused)
        }
        None => {
            debug!("Defining domain {}", name);
            hypervisor.define_domain(definition).await?;
            hypervisor.start_domain(name).await?;
            Ok(ResourceState::Created)
        }
    }
}
