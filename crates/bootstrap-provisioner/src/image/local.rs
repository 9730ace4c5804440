//! Local file image

use super::{copy_into, is_qcow2_magic, Copier, Image, ImportOutcome, QCOW2_MAGIC};
use crate::error::ImageError;
use libvirt_client::VolumeDescription;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Image stored on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalImage {
    path: PathBuf,
}

impl LocalImage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for LocalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[async_trait::async_trait]
impl Image for LocalImage {
    async fn size(&self) -> Result<u64, ImageError> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    async fn is_qcow2(&self) -> Result<bool, ImageError> {
        let mut file = File::open(&self.path).await?;
        let mut header = [0u8; QCOW2_MAGIC.len()];
        match file.read_exact(&mut header).await {
            Ok(_) => Ok(is_qcow2_magic(&header)),
            // Shorter than the magic, so not a QCOW2 image
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn import(&self, copier: &dyn Copier, target: &VolumeDescription) -> Result<ImportOutcome, ImageError> {
        let file = File::open(&self.path).await?;
        let modified = file.metadata().await?.modified()?;

        if target.mtime == Some(modified) {
            info!("Volume {} is up to date with {}, skipping copy", target.name, self);
            return Ok(ImportOutcome::Skipped);
        }

        debug!("Copying {} into volume {}", self, target.name);
        let bytes = copy_into(file, copier).await?;
        Ok(ImportOutcome::Copied { bytes })
    }
}
