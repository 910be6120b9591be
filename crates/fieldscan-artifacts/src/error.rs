//! Error types for artifact generation.

use thiserror::Error;

pub use fieldscan_core::Error as CoreError;

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ArtifactError {
    fn from(e: serde_json::Error) -> Self {
        ArtifactError::Serialization(e.to_string())
    }
}

impl From<ArtifactError> for CoreError {
    fn from(e: ArtifactError) -> Self {
        CoreError::Artifact(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_errors_are_not_catastrophic() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let core: CoreError = ArtifactError::from(io).into();
        assert!(matches!(core, CoreError::Artifact(ref m) if m.contains("read-only")));
        assert!(!core.is_catastrophic());
    }
}
