//! Error types for flow admission.

use std::net::SocketAddr;

use thiserror::Error;

use crate::flow::FlowId;

/// Result type alias for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Coarse classification of a [`FlowError`], stable across payload changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowErrorKind {
    /// Registry full.
    CapacityExceeded,
    /// Name resolution failed.
    Resolution,
    /// No candidate accepted the connection.
    Connect,
    /// Flow buffers could not be allocated.
    BufferAllocation,
    /// A socket option could not be applied or read back.
    OptionApplication,
    /// The immediate connect issued during admission failed.
    EagerConnect,
    /// The request was rejected before any resource was acquired.
    InvalidSettings,
    /// No live flow carries the id.
    UnknownFlow,
    /// Socket-level I/O failure.
    Io,
}

/// Error variants for flow construction.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The registry already holds the maximum number of flows.
    #[error("Can not accept another flow, already handling {max} flows.")]
    CapacityExceeded {
        /// Configured flow ceiling.
        max: usize,
    },

    /// The host could not be resolved to any address.
    #[error("getaddrinfo() failed for \"{host}:{port}\": {reason}")]
    ResolutionError {
        /// Host as supplied by the request.
        host: String,
        /// Destination port.
        port: u16,
        /// Resolver diagnostic text.
        reason: String,
    },

    /// Every resolved candidate refused the connection.
    #[error("Could not establish connection to \"{host}:{port}\" after {} attempt(s): {source}", .attempts.len())]
    ConnectError {
        /// Host as supplied by the request.
        host: String,
        /// Destination port.
        port: u16,
        /// Candidates tried, in resolver order.
        attempts: Vec<SocketAddr>,
        /// Last system error observed.
        #[source]
        source: std::io::Error,
    },

    /// Read or write block could not be allocated.
    #[error("could not allocate memory for read/write blocks of {size} bytes: {reason}")]
    BufferAllocationError {
        /// Requested block size in bytes.
        size: usize,
        /// Allocator diagnostic.
        reason: String,
    },

    /// A socket option could not be applied or introspected.
    #[error("Unable to apply {option}: {reason}")]
    OptionApplicationError {
        /// Name of the option, e.g. `TCP_CONGESTION`.
        option: String,
        /// System error text.
        reason: String,
    },

    /// The immediate connect during admission failed.
    #[error("(early) connect to {addr} failed: {source}")]
    EagerConnectError {
        /// Peer address.
        addr: SocketAddr,
        /// System error.
        #[source]
        source: std::io::Error,
    },

    /// Settings rejected before admission started.
    #[error("invalid flow settings: {reason}")]
    InvalidSettings {
        /// What was wrong.
        reason: String,
    },

    /// No live flow has this id.
    #[error("unknown flow {id}")]
    UnknownFlow {
        /// Flow asked for.
        id: FlowId,
    },

    /// Socket creation or other I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FlowError {
    /// Returns the class of this error.
    pub fn kind(&self) -> FlowErrorKind {
        match self {
            FlowError::CapacityExceeded { .. } => FlowErrorKind::CapacityExceeded,
            FlowError::ResolutionError { .. } => FlowErrorKind::Resolution,
            FlowError::ConnectError { .. } => FlowErrorKind::Connect,
            FlowError::BufferAllocationError { .. } => FlowErrorKind::BufferAllocation,
            FlowError::OptionApplicationError { .. } => FlowErrorKind::OptionApplication,
            FlowError::EagerConnectError { .. } => FlowErrorKind::EagerConnect,
            FlowError::InvalidSettings { .. } => FlowErrorKind::InvalidSettings,
            FlowError::UnknownFlow { .. } => FlowErrorKind::UnknownFlow,
            FlowError::IoError(_) => FlowErrorKind::Io,
        }
    }

    pub(crate) fn option(option: &str, err: &std::io::Error) -> Self {
        FlowError::OptionApplicationError {
            option: option.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_message() {
        let err = FlowError::CapacityExceeded { max: 2048 };
        assert_eq!(
            err.to_string(),
            "Can not accept another flow, already handling 2048 flows."
        );
        assert_eq!(err.kind(), FlowErrorKind::CapacityExceeded);
    }

    #[test]
    fn test_resolution_error_carries_reason() {
        let err = FlowError::ResolutionError {
            host: "nonexistent.invalid".to_string(),
            port: 5999,
            reason: "Name or service not known".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nonexistent.invalid:5999"));
        assert!(msg.contains("Name or service not known"));
    }

    #[test]
    fn test_connect_error_counts_attempts() {
        let err = FlowError::ConnectError {
            host: "localhost".to_string(),
            port: 1,
            attempts: vec![
                "127.0.0.1:1".parse().unwrap(),
                "[::1]:1".parse().unwrap(),
            ],
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("after 2 attempt(s)"));
        assert_eq!(err.kind(), FlowErrorKind::Connect);
    }

    #[test]
    fn test_option_helper() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = FlowError::option("TCP_CONGESTION", &io);
        assert_eq!(err.kind(), FlowErrorKind::OptionApplication);
        assert!(err.to_string().starts_with("Unable to apply TCP_CONGESTION"));
    }

    #[test]
    fn test_unknown_flow_names_id() {
        let err = FlowError::UnknownFlow { id: FlowId::new(12) };
        assert_eq!(err.to_string(), "unknown flow 12");
        assert_eq!(err.kind(), FlowErrorKind::UnknownFlow);
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: FlowError = std_err.into();
        assert!(matches!(err, FlowError::IoError(_)));
        assert_eq!(err.kind(), FlowErrorKind::Io);
    }
}
