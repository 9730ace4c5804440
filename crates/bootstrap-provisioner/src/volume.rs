//! Storage pool and volume management
//!
//! Creates the bootstrap storage pool, the base volume holding the OS image and
//! the copy-on-write main volume backed by it. Existing resources with the
//! expected names are reused so a failed run can simply be repeated.

use crate::error::{BootstrapError, ImageError};
use crate::image::{self, Copier, ImportOutcome};
use crate::orchestrator::ResourceState;
use libvirt_client::{
    BackingStore, Hypervisor, StoragePoolDefinition, StorageVolumeDefinition, VolumeDescription, VolumeFormat,
    VolumeWriter,
};
use tracing::{debug, info};

/// Copier streaming into a named volume through the hypervisor
pub struct VolumeCopier<'a> {
    hypervisor: &'a dyn Hypervisor,
    pool: String,
    volume: String,
}

impl<'a> VolumeCopier<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, pool: &str, volume: &str) -> Self {
        Self {
            hypervisor,
            pool: pool.to_string(),
            volume: volume.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Copier for VolumeCopier<'_> {
    async fn open(&self) -> Result<Box<dyn VolumeWriter>, ImageError> {
        Ok(self.hypervisor.upload_volume(&self.pool, &self.volume).await?)
    }
}

/// Create (or reuse) a directory-backed pool and make it active
///
/// A new pool is defined, built, marked to autostart, started and refreshed.
/// An existing pool is started if inactive, then refreshed.
pub async fn create_pool(
    hypervisor: &dyn Hypervisor,
    name: &str,
    path: &str,
) -> Result<ResourceState, BootstrapError> {
    if let Some(info) = hypervisor.lookup_pool(name).await? {
        info!("Reusing storage pool {}", name);
        if !info.active {
            hypervisor.start_pool(name).await?;
        }
        hypervisor.refresh_pool(name).await?;
        return Ok(ResourceState::Reused);
    }

    debug!("Defining storage pool {} at {}", name, path);
    hypervisor
        .define_pool(&StoragePoolDefinition::new(name, path))
        .await?;
    hypervisor.build_pool(name).await?;
    hypervisor.set_pool_autostart(name, true).await?;
    hypervisor.start_pool(name).await?;
    hypervisor.refresh_pool(name).await?;
    Ok(ResourceState::Created)
}

/// Create the base volume and import the OS image into it
///
/// The volume takes the image's exact size and is declared qcow2 or raw
/// depending on the image header. `in_use` says whether the main volume or the
/// domain already exists, i.e. whether something is layered on the base.
///
/// A base in use is never written again; it must still match the image's size
/// and format or the run fails with `StaleResource`. A base nothing depends on
/// is recreated when it no longer matches, otherwise the import is re-run and
/// skips content that is already current.
pub async fn create_base_volume(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    name: &str,
    image_source: &str,
    in_use: bool,
) -> Result<(VolumeDescription, ResourceState), BootstrapError> {
    let image = image::resolve(image_source)?;
    let format = if image.is_qcow2().await? {
        VolumeFormat::Qcow2
    } else {
        VolumeFormat::Raw
    };
    let size = image.size().await?;

    let (target, state) = match hypervisor.lookup_volume(pool, name).await? {
        Some(existing) if in_use => {
            if let Some(found) = mismatch(&existing, format, size) {
                return Err(BootstrapError::StaleResource {
                    resource: format!("volume {}", name),
                    expected: format!("{} image of {} bytes from {}", format, size, image),
                    found,
                });
            }
            info!("Base volume {} is in use, keeping its content", name);
            return Ok((existing, ResourceState::Reused));
        }
        Some(existing) => match mismatch(&existing, format, size) {
            None => {
                info!("Reusing base volume {}", name);
                (existing, ResourceState::Reused)
            }
            Some(found) => {
                info!("Recreating base volume {}, it holds {} instead of {}", name, found, image);
                hypervisor.delete_volume(pool, name).await?;
                create_volume_for_image(hypervisor, pool, name, format, size).await?;
                (fresh_target(hypervisor, pool, name).await?, ResourceState::Created)
            }
        },
        None if in_use => {
            return Err(BootstrapError::VolumeNotFound {
                pool: pool.to_string(),
                volume: name.to_string(),
            });
        }
        None => {
            debug!("Creating {} base volume {} of {} bytes from {}", format, name, size, image);
            create_volume_for_image(hypervisor, pool, name, format, size).await?;
            (fresh_target(hypervisor, pool, name).await?, ResourceState::Created)
        }
    };

    let copier = VolumeCopier::new(hypervisor, pool, name);
    match image.import(&copier, &target).await? {
        ImportOutcome::Copied { bytes } => info!("Imported {} bytes from {} into {}", bytes, image, name),
        ImportOutcome::Skipped => debug!("Base volume {} already holds {}", name, image),
    }

    Ok((require_volume(hypervisor, pool, name).await?, state))
}

async fn create_volume_for_image(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    name: &str,
    format: VolumeFormat,
    size: u64,
) -> Result<(), BootstrapError> {
    let definition = StorageVolumeDefinition::new(name, size).with_format(format);
    hypervisor.create_volume(pool, &definition).await?;
    Ok(())
}

/// How an existing base volume differs from the image, if it does
///
/// The on-disk size is compared when the hypervisor reports it; qcow2
/// volumes report their virtual size as capacity.
fn mismatch(existing: &VolumeDescription, format: VolumeFormat, size: u64) -> Option<String> {
    let found_size = existing.physical.or(existing.capacity);
    if existing.format != format.as_str() || found_size != Some(size) {
        let found_size = found_size.map_or_else(|| "unknown size".to_string(), |s| format!("{} bytes", s));
        return Some(format!("{} volume of {}", existing.format, found_size));
    }
    None
}

/// Create the main volume as a copy-on-write overlay of the base volume
///
/// The backing store path and format come from the base volume's description,
/// so this fails when that description cannot be read. An existing main volume
/// is only reused when it is backed by the same base volume in the same format.
pub async fn create_main_volume(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    name: &str,
    base_volume: &str,
    capacity: u64,
) -> Result<(VolumeDescription, ResourceState), BootstrapError> {
    let base_xml = hypervisor.volume_xml(pool, base_volume).await?;
    let base = VolumeDescription::from_xml(&base_xml)?;
    let backing_store = BackingStore {
        path: base.path,
        format: base.format,
    };

    if let Some(existing) = hypervisor.lookup_volume(pool, name).await? {
        if existing.backing_store.as_ref() != Some(&backing_store) {
            return Err(BootstrapError::StaleResource {
                resource: format!("volume {}", name),
                expected: describe_backing(Some(&backing_store)),
                found: describe_backing(existing.backing_store.as_ref()),
            });
        }
        info!("Reusing main volume {}", name);
        return Ok((existing, ResourceState::Reused));
    }

    debug!("Creating main volume {} backed by {}", name, backing_store.path);
    let definition = StorageVolumeDefinition::new(name, capacity)
        .with_format(VolumeFormat::Qcow2)
        .with_backing_store(backing_store);
    hypervisor.create_volume(pool, &definition).await?;

    Ok((require_volume(hypervisor, pool, name).await?, ResourceState::Created))
}

fn describe_backing(backing_store: Option<&BackingStore>) -> String {
    match backing_store {
        Some(b) => format!("backing store {} ({})", b.path, b.format),
        None => "no backing store".to_string(),
    }
}

/// Description of a volume created by this run, as an import target
///
/// Nothing has been imported yet, so the creation time must not count as
/// the content's modification time.
pub(crate) async fn fresh_target(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    name: &str,
) -> Result<VolumeDescription, BootstrapError> {
    Ok(VolumeDescription {
        mtime: None,
        ..require_volume(hypervisor, pool, name).await?
    })
}

pub(crate) async fn require_volume(
    hypervisor: &dyn Hypervisor,
    pool: &str,
    name: &str,
) -> Result<VolumeDescription, BootstrapError> {
    hypervisor
        .lookup_volume(pool, name)
        .await?
        .ok_or_else(|| BootstrapError::VolumeNotFound {
            pool: pool.to_string(),
            volume: name.to_string(),
        })
}
