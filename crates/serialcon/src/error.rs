//! Error types for console operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::host::InstanceId;

/// Errors that can occur while managing serial consoles.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// The hypervisor does not expose a serial endpoint for the instance.
    #[error("serial port is not available for instance {0}")]
    EndpointUnavailable(InstanceId),

    /// The serial endpoint never accepted a connection.
    #[error("failed to connect to serial endpoint {}: {source}", endpoint.display())]
    EndpointConnect {
        /// The endpoint path.
        endpoint: PathBuf,
        /// The last connection error.
        #[source]
        source: std::io::Error,
    },

    /// No remote console is available: either remote access is disabled
    /// or no live session exists for the instance.
    #[error("serial console unavailable for instance {0}")]
    ConsoleUnavailable(InstanceId),

    /// The console log could not be read.
    #[error("could not get instance {instance_id} console output: {source}")]
    OutputUnavailable {
        /// The instance whose log was read.
        instance_id: InstanceId,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No listen port could be allocated for the network bridge.
    #[error("failed to allocate console port on {host}: {reason}")]
    PortAllocation {
        /// The bind host.
        host: String,
        /// Why allocation failed.
        reason: String,
    },

    /// The network bridge failed to start.
    #[error("network bridge failed: {0}")]
    Bridge(String),

    /// A stream pump was started again after being stopped.
    #[error("stream pump for instance {0} has been stopped and cannot be restarted")]
    PumpStopped(InstanceId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_unavailable_message() {
        let err = ConsoleError::ConsoleUnavailable("instance-0001".to_string());
        assert_eq!(
            err.to_string(),
            "serial console unavailable for instance instance-0001"
        );
    }

    #[test]
    fn test_output_unavailable_keeps_source() {
        let err = ConsoleError::OutputUnavailable {
            instance_id: "vm1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("vm1"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_conversion() {
        let err: ConsoleError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, ConsoleError::Io(_)));
    }
}
