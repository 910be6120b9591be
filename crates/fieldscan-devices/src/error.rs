//! Probe errors.

use fieldscan_core::{Error, Fault, FaultKind};

/// Error raised by a probe or one of its I/O seams.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Modbus exception response
    #[error("Modbus exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Operation '{0}' is not supported by this probe")]
    Unsupported(&'static str),

    #[error("Invalid probe configuration: {0}")]
    InvalidConfig(String),

    #[error("Device not found: {0}")]
    NotFound(String),
}

impl ProbeError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ProbeError::Timeout(_) => FaultKind::ProbeTimeout,
            ProbeError::Exception { .. } | ProbeError::Protocol(_) => FaultKind::ProbeProtocolError,
            ProbeError::Unavailable(_) | ProbeError::InvalidConfig(_) => FaultKind::ProbeUnavailable,
            ProbeError::Unsupported(_) | ProbeError::NotFound(_) => FaultKind::ProbeProtocolError,
        }
    }

    /// Record this error as a fault observed by `probe`.
    pub fn to_fault(&self, probe: &str) -> Fault {
        Fault::new(self.fault_kind(), probe, self.to_string())
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => ProbeError::Timeout(e.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::NotFound
            | ErrorKind::PermissionDenied => ProbeError::Unavailable(e.to_string()),
            _ => ProbeError::Protocol(e.to_string()),
        }
    }
}

impl From<ProbeError> for Error {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Timeout(msg) => Error::Timeout(msg),
            ProbeError::InvalidConfig(msg) => Error::Config(msg),
            ProbeError::NotFound(msg) => Error::NotFound(msg),
            other => Error::Device(other.to_string()),
        }
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kinds() {
        assert_eq!(
            ProbeError::Timeout("unit 3".into()).fault_kind(),
            FaultKind::ProbeTimeout
        );
        assert_eq!(
            ProbeError::Exception { function: 3, code: 2 }.fault_kind(),
            FaultKind::ProbeProtocolError
        );
        assert_eq!(
            ProbeError::Unavailable("refused".into()).fault_kind(),
            FaultKind::ProbeUnavailable
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(ProbeError::from(refused), ProbeError::Unavailable(_)));
        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert!(matches!(ProbeError::from(timed_out), ProbeError::Timeout(_)));
    }

    #[test]
    fn test_exception_display_and_conversion() {
        let e = ProbeError::Exception { function: 3, code: 2 };
        assert_eq!(e.to_string(), "Modbus exception 0x02 for function 0x03");
        let core: Error = e.into();
        assert!(matches!(core, Error::Device(_)));
        let fault = ProbeError::Unsupported("sample").to_fault("mq");
        assert_eq!(fault.source, "mq");
    }
}
