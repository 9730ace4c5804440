//! Hypervisor trait for mocking
//!
//! This trait abstracts the hypervisor connection so provisioning code can be
//! unit tested without a running libvirtd.
//! The concrete `VirshClient` implements this trait, and tests use `MockHypervisor`.

use crate::domain::DomainDefinition;
use crate::error::HypervisorError;
use crate::models::*;

/// Streaming upload into a storage volume
///
/// Obtained from [`Hypervisor::upload_volume`]. Chunks are written in order;
/// the upload is only complete once `finish` returns.
#[async_trait::async_trait]
pub trait VolumeWriter: Send {
    /// Append a chunk to the volume
    async fn write(&mut self, chunk: &[u8]) -> Result<(), HypervisorError>;

    /// Complete the upload, returning the number of bytes written
    async fn finish(self: Box<Self>) -> Result<u64, HypervisorError>;
}

/// Operations on a libvirt connection
///
/// Objects are addressed by name. Lookups return `Ok(None)` when the object
/// does not exist; every other call reports a missing object as a
/// not-found [`HypervisorError`].
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// Connection URI, e.g. `qemu:///system`
    fn uri(&self) -> &str;

    // Host
    async fn capabilities(&self) -> Result<HostCapabilities, HypervisorError>;

    // Storage pools
    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError>;
    async fn define_pool(&self, pool: &StoragePoolDefinition) -> Result<(), HypervisorError>;
    async fn build_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError>;
    async fn start_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn refresh_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn destroy_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn delete_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine_pool(&self, name: &str) -> Result<(), HypervisorError>;

    // Storage volumes
    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeDescription>, HypervisorError>;
    async fn create_volume(&self, pool: &str, volume: &StorageVolumeDefinition) -> Result<(), HypervisorError>;
    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError>;
    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String, HypervisorError>;
    async fn upload_volume(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, HypervisorError>;
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError>;

    // Domains
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError>;
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<(), HypervisorError>;
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<(), HypervisorError>;
}
