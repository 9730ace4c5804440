//! libvirt client errors

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classified libvirt error code.
///
/// virsh reports failures as text on stderr. The message prefixes are fixed by
/// libvirt's error table (`virErrorMsg`), so they are stable enough to map back
/// onto the numeric codes callers need to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// `VIR_ERR_NO_SUPPORT`: the driver does not implement the call
    NoSupport,
    /// `VIR_ERR_INVALID_ARG`: includes "unsupported flags"
    InvalidArg,
    /// `VIR_ERR_NO_DOMAIN`
    NoDomain,
    /// `VIR_ERR_NO_STORAGE_POOL`
    NoStoragePool,
    /// `VIR_ERR_NO_STORAGE_VOL`
    NoStorageVol,
    /// `VIR_ERR_OPERATION_INVALID`, e.g. destroying a domain that is not running
    OperationInvalid,
    /// `VIR_ERR_OPERATION_FAILED`
    OperationFailed,
    /// Anything not listed above
    Other,
}

impl ErrorCode {
    /// Classify a libvirt error message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("this function is not supported") || lower.contains("not supported by the connection driver") {
            ErrorCode::NoSupport
        } else if lower.contains("invalid argument") {
            ErrorCode::InvalidArg
        } else if lower.contains("domain not found") {
            ErrorCode::NoDomain
        } else if lower.contains("storage pool not found") {
            ErrorCode::NoStoragePool
        } else if lower.contains("storage volume not found") {
            ErrorCode::NoStorageVol
        } else if lower.contains("requested operation is not valid") {
            ErrorCode::OperationInvalid
        } else if lower.contains("operation failed") {
            ErrorCode::OperationFailed
        } else {
            ErrorCode::Other
        }
    }

    /// Whether the code means the looked-up object does not exist
    pub fn is_not_found(self) -> bool {
        matches!(
            self,
            ErrorCode::NoDomain | ErrorCode::NoStoragePool | ErrorCode::NoStorageVol
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoSupport => "ErrNoSupport",
            ErrorCode::InvalidArg => "ErrInvalidArg",
            ErrorCode::NoDomain => "ErrNoDomain",
            ErrorCode::NoStoragePool => "ErrNoStoragePool",
            ErrorCode::NoStorageVol => "ErrNoStorageVol",
            ErrorCode::OperationInvalid => "ErrOperationInvalid",
            ErrorCode::OperationFailed => "ErrOperationFailed",
            ErrorCode::Other => "ErrOther",
        };
        f.write_str(name)
    }
}

/// Errors that can occur when talking to the hypervisor
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// libvirt rejected the call
    #[error("libvirt error ({code}): {message}")]
    Libvirt {
        /// Classified error code
        code: ErrorCode,
        /// Error text as reported by libvirt
        message: String,
    },

    /// Spawning or talking to the virsh process failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML returned by libvirt could not be read
    #[error("XML error: {0}")]
    Xml(String),

    /// A description was missing a required element
    #[error("Missing element in {document}: {element}")]
    MissingElement {
        /// Kind of document (volume, capabilities, ...)
        document: &'static str,
        /// Slash-separated element path
        element: String,
    },

    /// The call did not finish before its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// virsh command that timed out
        operation: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },
}

impl HypervisorError {
    /// Build a libvirt error from an error message, classifying its code.
    pub fn libvirt(message: impl Into<String>) -> Self {
        let message = message.into();
        HypervisorError::Libvirt {
            code: ErrorCode::classify(&message),
            message,
        }
    }

    /// Build a libvirt error with an explicit code.
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        HypervisorError::Libvirt {
            code,
            message: message.into(),
        }
    }

    /// libvirt error code, if this is a libvirt error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            HypervisorError::Libvirt { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error reports a missing domain, pool or volume
    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(ErrorCode::is_not_found)
    }
}
