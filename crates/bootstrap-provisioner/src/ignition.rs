//! Ignition config upload
//!
//! The config arrives as an in-memory string. It is staged in a temporary file
//! and imported like any other local image into a raw volume of exactly its
//! size. The temporary file is removed when the upload returns, on every path.

use crate::error::{BootstrapError, ImageError};
use crate::image::{Image, LocalImage};
use crate::volume::{fresh_target, require_volume, VolumeCopier};
use libvirt_client::{Hypervisor, StorageVolumeDefinition, VolumeDescription, VolumeFormat};
use tracing::{debug, info};

/// Upload an Ignition config into a new raw volume of `pool`
///
/// The pool must already exist. A volume left by an earlier run is replaced,
/// since the config may have changed in between.
pub async fn create_and_upload(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    volume: &str,
    content: &str,
) -> Result<VolumeDescription, BootstrapError> {
    if hypervisor.lookup_pool(pool).await?.is_none() {
        return Err(BootstrapError::PoolNotFound(pool.to_string()));
    }
    hypervisor.refresh_pool(pool).await?;

    if hypervisor.lookup_volume(pool, volume).await?.is_some() {
        info!("Replacing ignition volume {}", volume);
        hypervisor.delete_volume(pool, volume).await?;
    }

    let staged = tempfile::Builder::new()
        .prefix("bootstrap-ignition-")
        .suffix(".ign")
        .tempfile()
        .map_err(ImageError::Io)?;
    tokio::fs::write(staged.path(), content.as_bytes())
        .await
        .map_err(ImageError::Io)?;

    let image = LocalImage::new(staged.path());
    let size = image.size().await?;
    debug!("Creating ignition volume {} of {} bytes", volume, size);

    let definition = StorageVolumeDefinition::new(volume, size).with_format(VolumeFormat::Raw);
    hypervisor.create_volume(pool, &definition).await?;

    let target = fresh_target(hypervisor, pool, volume).await?;
    let copier = VolumeCopier::new(hypervisor, pool, volume);
    image.import(&copier, &target).await?;

    require_volume(hypervisor, pool, volume).await
}
