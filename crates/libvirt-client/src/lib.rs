//! libvirt Client
//!
//! A Rust client library for managing libvirt storage pools, storage volumes
//! and domains. Calls are issued through the `virsh` command line tool, so no
//! libvirt development headers are needed to build or run.
//!
//! # Example
//!
//! ```no_run
//! use libvirt_client::{Hypervisor, StoragePoolDefinition, VirshClient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = VirshClient::new("qemu:///system").with_call_timeout(Duration::from_secs(60));
//!
//! let pool = StoragePoolDefinition::new("demo", "/var/lib/libvirt/images/demo");
//! client.define_pool(&pool).await?;
//! client.build_pool("demo").await?;
//! client.start_pool("demo").await?;
//!
//! if let Some(info) = client.lookup_pool("demo").await? {
//!     println!("pool {} active={}", info.name, info.active);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Storage pools**: define, build, start, refresh and tear down directory pools
//! - **Storage volumes**: create (optionally copy-on-write), describe, stream uploads
//! - **Domains**: define from a typed definition, start, destroy, undefine with flags
//! - **Error classification**: libvirt error codes recovered from virsh messages
//! - **Deadlines**: every call is bounded by a configurable timeout

pub mod client;
pub mod domain;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod hypervisor_trait;
pub mod xml;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::VirshClient;
pub use domain::*;
pub use error::{ErrorCode, HypervisorError};
pub use hypervisor_trait::{Hypervisor, VolumeWriter};
pub use models::*;
pub use xml::XmlDocument;
#[cfg(feature = "test-util")]
pub use mock::MockHypervisor;
