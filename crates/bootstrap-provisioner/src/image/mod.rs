//! OS image sources
//!
//! An image is either a local file or an HTTP(S) URL. Both report their size,
//! sniff the QCOW2 header and stream their content into a volume through a
//! [`Copier`]. Imports skip the copy when the target volume is already current.

pub mod http;
pub mod local;

pub use http::HttpImage;
pub use local::LocalImage;

use crate::error::ImageError;
use libvirt_client::{VolumeDescription, VolumeWriter};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// First eight bytes of every QCOW2 image: `QFI\xfb` then version 3
pub const QCOW2_MAGIC: [u8; 8] = [0x51, 0x46, 0x49, 0xFB, 0x00, 0x00, 0x00, 0x03];

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Whether a header starts with the QCOW2 magic
pub fn is_qcow2_magic(header: &[u8]) -> bool {
    header.len() >= QCOW2_MAGIC.len() && header[..QCOW2_MAGIC.len()] == QCOW2_MAGIC
}

/// Opens the sink an import writes into
#[async_trait::async_trait]
pub trait Copier: Send + Sync {
    async fn open(&self) -> Result<Box<dyn VolumeWriter>, ImageError>;
}

/// Result of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Content was streamed into the volume
    Copied { bytes: u64 },
    /// The volume was already up to date
    Skipped,
}

/// An image that can be imported into a storage volume
#[async_trait::async_trait]
pub trait Image: fmt::Display + Send + Sync {
    /// Content length in bytes
    async fn size(&self) -> Result<u64, ImageError>;

    /// Whether the content starts with the QCOW2 magic
    async fn is_qcow2(&self) -> Result<bool, ImageError>;

    /// Stream the content through `copier` unless `target` is already current
    async fn import(&self, copier: &dyn Copier, target: &VolumeDescription) -> Result<ImportOutcome, ImageError>;
}

/// Pick the image variant for a source string
///
/// `http://` and `https://` are remote, `file://` and bare paths are local.
pub fn resolve(source: &str) -> Result<Box<dyn Image>, ImageError> {
    let source = source.trim();
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(Box::new(HttpImage::new(source)?));
    }
    if let Some(path) = source.strip_prefix("file://") {
        return Ok(Box::new(LocalImage::new(path)));
    }
    if source.contains("://") {
        return Err(ImageError::UnsupportedSource(source.to_string()));
    }
    Ok(Box::new(LocalImage::new(source)))
}

/// Copy a reader into a freshly opened volume writer
pub(crate) async fn copy_into<R>(mut reader: R, copier: &dyn Copier) -> Result<u64, ImageError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut writer = copier.open().await?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write(&buffer[..read]).await?;
    }
    Ok(writer.finish().await?)
}
