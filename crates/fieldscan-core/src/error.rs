//! Unified error handling for fieldscan.
//!
//! This module provides a common error type that can be used across all crates,
//! plus the fault taxonomy recorded (not raised) while a discovery cycle runs.

use serde::{Deserialize, Serialize};

/// Unified error type for fieldscan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Probe/device errors.
    #[error("Device error: {0}")]
    Device(String),

    /// Classification errors.
    #[error("Classification error: {0}")]
    Classification(String),

    /// Namespace/tag derivation errors.
    #[error("Namespace error: {0}")]
    Namespace(String),

    /// Registry errors.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Storage/database errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Artifact generation errors.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Validation errors.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Timeout errors.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Parse errors with location context.
    #[error("Parse error at {location}: {message}")]
    Parse { location: String, message: String },

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! storage_err {
    ($msg:expr) => {
        $crate::error::Error::Storage($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Storage(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

// Error conversion helpers
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Parse {
            location: "config".to_string(),
            message: e.message().to_string(),
        }
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn namespace(msg: impl Into<String>) -> Self {
        Self::Namespace(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error should abort the running discovery cycle.
    ///
    /// Only failures of the canonical store are catastrophic; everything else
    /// degrades a single device or probe.
    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Internal(_))
    }
}

/// Fault taxonomy for recorded, non-fatal problems during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A probe exceeded its own timeout or was cut off by the cycle timeout.
    ProbeTimeout,
    /// A malformed or exception response from a device.
    ProbeProtocolError,
    /// The probe could not reach its endpoint at all.
    ProbeUnavailable,
    /// Classifier best score fell below the confidence floor.
    InsufficientEvidence,
    /// The namespace builder was asked for a path already held by another channel.
    NamespaceCollision,
    /// Two writers contended for the same registry key.
    RegistryConflict,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::ProbeTimeout => "probe_timeout",
            FaultKind::ProbeProtocolError => "probe_protocol_error",
            FaultKind::ProbeUnavailable => "probe_unavailable",
            FaultKind::InsufficientEvidence => "insufficient_evidence",
            FaultKind::NamespaceCollision => "namespace_collision",
            FaultKind::RegistryConflict => "registry_conflict",
        }
    }

    /// Whether this fault marks the probe itself as failed for the cycle.
    pub fn is_probe_failure(&self) -> bool {
        matches!(
            self,
            FaultKind::ProbeTimeout | FaultKind::ProbeProtocolError | FaultKind::ProbeUnavailable
        )
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Probe name or component that observed the fault.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub message: String,
    pub at: i64,
}

impl Fault {
    pub fn new(kind: FaultKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            device_id: None,
            message: message.into(),
            at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}
