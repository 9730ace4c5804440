//! Provisioning errors

use libvirt_client::HypervisorError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors in the provisioning configuration
///
/// All of these are detected before the first hypervisor call.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A variable file is not valid JSON
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A variable file holds something other than a JSON object
    #[error("{0} does not contain a JSON object")]
    NotAnObject(PathBuf),

    /// The merged variables do not describe a provisioning config
    #[error("invalid variables: {0}")]
    Decode(#[from] serde_json::Error),

    /// A field is present but unusable
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors resolving, inspecting or importing an OS image
#[derive(Debug, Error)]
pub enum ImageError {
    /// Local file access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a status the operation cannot use
    #[error("unexpected HTTP status {status} from {url} (expected {expected})")]
    UnexpectedStatus {
        url: String,
        status: u16,
        expected: &'static str,
    },

    /// The response carried no usable Content-Length header
    #[error("missing or invalid Content-Length from {0}")]
    ContentLength(String),

    /// Every attempt ended in a server error
    #[error("giving up on {url} after {attempts} attempts, last status {status}")]
    RetriesExhausted { url: String, attempts: u32, status: u16 },

    /// The image source has a scheme that cannot be read
    #[error("unsupported image source: {0}")]
    UnsupportedSource(String),

    /// Writing into the target volume failed
    #[error("volume upload failed: {0}")]
    Upload(#[from] HypervisorError),
}

/// Named steps of the bootstrap create and teardown paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    CreatePool,
    CreateBaseVolume,
    CreateMainVolume,
    UploadIgnition,
    CreateDomain,
    DestroyDomain,
    UndefineDomain,
    DeleteVolumes,
    DeletePool,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BootstrapStep::CreatePool => "create storage pool",
            BootstrapStep::CreateBaseVolume => "create base volume",
            BootstrapStep::CreateMainVolume => "create main volume",
            BootstrapStep::UploadIgnition => "upload ignition config",
            BootstrapStep::CreateDomain => "create bootstrap domain",
            BootstrapStep::DestroyDomain => "destroy bootstrap domain",
            BootstrapStep::UndefineDomain => "undefine bootstrap domain",
            BootstrapStep::DeleteVolumes => "delete volumes",
            BootstrapStep::DeletePool => "delete storage pool",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while creating or tearing down the bootstrap node
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Hypervisor call failed
    #[error("{0}")]
    Hypervisor(#[from] HypervisorError),

    /// Image resolution or import failed
    #[error("{0}")]
    Image(#[from] ImageError),

    /// A storage pool expected to exist is missing
    #[error("storage pool not found: {0}")]
    PoolNotFound(String),

    /// A volume vanished right after it was created
    #[error("storage volume {volume} not found in pool {pool}")]
    VolumeNotFound { pool: String, volume: String },

    /// A resource left by an earlier run does not match what this run would create
    #[error("stale {resource}: expected {expected}, found {found}")]
    StaleResource {
        resource: String,
        expected: String,
        found: String,
    },

    /// A named step failed
    #[error("{step}: {source}")]
    Step {
        step: BootstrapStep,
        #[source]
        source: Box<BootstrapError>,
    },
}

impl BootstrapError {
    /// Step that failed, if the error carries one
    pub fn step(&self) -> Option<BootstrapStep> {
        match self {
            BootstrapError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Underlying hypervisor error, looking through step context
    pub fn hypervisor_error(&self) -> Option<&HypervisorError> {
        match self {
            BootstrapError::Hypervisor(e) => Some(e),
            BootstrapError::Image(ImageError::Upload(e)) => Some(e),
            BootstrapError::Step { source, .. } => source.hypervisor_error(),
            _ => None,
        }
    }
}

/// Attach the failing step to an error
pub(crate) trait StepContext<T> {
    fn step(self, step: BootstrapStep) -> Result<T, BootstrapError>;
}

impl<T, E> StepContext<T> for Result<T, E>
where
    E: Into<BootstrapError>,
{
    fn step(self, step: BootstrapStep) -> Result<T, BootstrapError> {
        self.map_err(|e| BootstrapError::Step {
            step,
            source: Box::new(e.into()),
        })
    }
}
