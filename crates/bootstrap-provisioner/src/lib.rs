//! Bootstrap Node Provisioner
//!
//! Provisions the temporary bootstrap VM that brings up a bare-metal cluster's
//! control plane, and tears it down again afterwards.
//!
//! # Example
//!
//! ```no_run
//! use bootstrap_provisioner::{Bootstrapper, HostOverrides, ProvisioningConfig};
//! use libvirt_client::VirshClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProvisioningConfig::from_var_files(&["terraform.tfvars.json"])?;
//! let bootstrapper = Bootstrapper::new(VirshClient::new(config.libvirt_uri.as_str()));
//!
//! let record = bootstrapper.create(&config, &HostOverrides::from_env()).await?;
//! println!("bootstrap reached {:?}", record.phase);
//!
//! bootstrapper.destroy(&config.names()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Flow
//!
//! - **Storage pool**: directory pool named `<cluster>-bootstrap`
//! - **Base volume**: the OS image, from a local file or an HTTP(S) URL
//! - **Main volume**: copy-on-write overlay backed by the base volume
//! - **Ignition volume**: the first-boot config, passed to the guest via `-fw_cfg`
//! - **Domain**: the VM itself, shaped by the host architecture

pub mod backoff;
pub mod config;
pub mod domain;
pub mod error;
pub mod ignition;
pub mod image;
pub mod names;
pub mod orchestrator;
pub mod overrides;
pub mod volume;

pub use config::{Bridge, ProvisioningConfig};
pub use error::{BootstrapError, BootstrapStep, ConfigError, ImageError};
pub use image::{Image, ImportOutcome};
pub use names::BootstrapNames;
pub use orchestrator::{BootstrapPhase, Bootstrapper, ProvisioningRecord, ResourceKind, ResourceState};
pub use overrides::HostOverrides;
