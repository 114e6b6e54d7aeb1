//! WolfCoord Error Types

use thiserror::Error;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Namespace errors
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Parent node does not exist for {0}")]
    NoParent(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion { path: String, expected: i32, actual: i32 },

    #[error("Ephemeral nodes cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // Session errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    // Coordination errors
    #[error("Registration failed at {path}: {reason}")]
    Registration { path: String, reason: String },

    #[error("Already volunteered as {0}")]
    AlreadyVolunteered(String),

    #[error("Not volunteered for leadership")]
    NotVolunteered,

    #[error("Already registered as {0}")]
    AlreadyRegistered(String),

    #[error("Election node {0} no longer exists")]
    ElectionNodeMissing(String),

    #[error("Failed to re-arm watch: {0}")]
    WatchRearm(String),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means the session and everything it owned is gone
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::ConnectionLoss)
    }

    /// A node vanished between listing and reading it
    pub fn is_transient_race(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }

    /// Wrap a store failure as a registration failure at `path`.
    ///
    /// Session loss passes through untouched so callers can tell a dead
    /// session apart from a rejected create.
    pub fn into_registration(self, path: &str) -> Error {
        if self.is_session_lost() {
            return self;
        }
        match self {
            Error::Registration { .. } => self,
            other => Error::Registration {
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_wrapping() {
        let err = Error::NoParent("/election/c_".into()).into_registration("/election");
        match err {
            Error::Registration { path, reason } => {
                assert_eq!(path, "/election");
                assert!(reason.contains("/election/c_"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = Error::SessionExpired.into_registration("/election");
        assert!(err.is_session_lost());
    }

    #[test]
    fn test_classification() {
        assert!(Error::NoNode("/a".into()).is_transient_race());
        assert!(!Error::NodeExists("/a".into()).is_transient_race());
        assert!(Error::ConnectionTimeout("x".into()).is_retryable());
        assert!(Error::ConnectionLoss.is_session_lost());
    }
}
