//! Forwarding Error types

use thiserror::Error;

use crate::config::StorageError;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Failed to bind local port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Failed to connect to {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("Local port {port} is already used by rule '{owner}'")]
    DuplicatePort { port: u16, owner: String },

    #[error("Rule index {index} out of range ({len} rules)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Forwarder already started; create a new instance to restart")]
    AlreadyStarted,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Map a listener bind failure to a readable reason
    pub fn bind(port: u16, err: &std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::AddrInUse => {
                "port already in use. Another application may be using this port.".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "permission denied. Ports below 1024 require elevated privileges.".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "address not available on this system.".to_string()
            }
            _ => err.to_string(),
        };
        ForwardError::Bind { port, reason }
    }

    /// Registry validation failures leave the rule set untouched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ForwardError::DuplicatePort { .. }
                | ForwardError::IndexOutOfRange { .. }
                | ForwardError::InvalidRule(_)
        )
    }
}

// Serialize as the display string so errors can cross the presentation boundary
impl serde::Serialize for ForwardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_reason() {
        let io = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        let err = ForwardError::bind(8080, &io);
        assert!(err.to_string().contains("8080"));
        assert!(err.to_string().contains("already in use"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_classification() {
        let dup = ForwardError::DuplicatePort {
            port: 80,
            owner: "web".into(),
        };
        assert!(dup.is_validation());
        assert!(ForwardError::IndexOutOfRange { index: 3, len: 1 }.is_validation());
        assert!(!ForwardError::AlreadyStarted.is_validation());
    }

    #[test]
    fn test_error_serializes_as_string() {
        let err = ForwardError::IndexOutOfRange { index: 2, len: 0 };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Rule index 2 out of range (0 rules)\"");
    }
}
