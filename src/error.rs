//! Error types for the Tribefire operator

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for runtime reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid runtime spec: unknown component type, cartridge without image,
    /// unsupported database type
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Field validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Status write was not observed on re-read within the retry budget
    #[error("status update for runtime {name} did not persist")]
    StatusUpdateNotPersisted {
        /// Runtime name
        name: String,
    },

    /// Required local file could not be read
    #[error("failed to read {path}: {source}")]
    LocalIo {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Database provisioning error
    #[error("provider error: {0}")]
    Provider(String),

    /// Messaging backend probe or provisioning error
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconciliation exceeded its deadline
    #[error("reconciliation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a backend error with the given message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a status-not-persisted error for the named runtime
    pub fn status_not_persisted(name: impl Into<String>) -> Self {
        Self::StatusUpdateNotPersisted { name: name.into() }
    }

    /// Create a local I/O error for the given path
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Returns true if retrying without a spec change can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
