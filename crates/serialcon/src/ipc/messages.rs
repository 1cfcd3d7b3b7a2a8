//! IPC message types for CLI-daemon communication.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::session::{ConsoleInfo, SessionSummary};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Shutdown,
    /// List registered console sessions.
    ListConsoles,
    /// Start the console session of an instance.
    StartConsole { instance_id: String },
    /// Stop the console session of an instance.
    StopConsole { instance_id: String },
    /// Ask where the instance's console can be reached.
    ConsoleInfo { instance_id: String },
    /// Fetch the instance's console transcript.
    ConsoleOutput { instance_id: String },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Number of registered console sessions.
        console_count: usize,
        /// Whether remote console access is enabled.
        remote_enabled: bool,
    },
    /// Acknowledgment that the daemon is shutting down.
    ShuttingDown,
    /// Registered console sessions.
    Consoles { consoles: Vec<SessionSummary> },
    /// The console session is running.
    Started { instance_id: String },
    /// The console session is gone.
    Stopped { instance_id: String },
    /// Remote console address.
    ConsoleInfo { host: String, port: u16 },
    /// Console transcript, base64 encoded.
    ConsoleOutput {
        instance_id: String,
        data_base64: String,
    },
    /// An error occurred processing the request.
    Error { message: String },
}

impl IpcResponse {
    /// Builds a `ConsoleInfo` response.
    pub fn console_info(info: ConsoleInfo) -> Self {
        IpcResponse::ConsoleInfo {
            host: info.host,
            port: info.port,
        }
    }

    /// Builds a `ConsoleOutput` response, base64 encoding `data`.
    pub fn console_output(instance_id: impl Into<String>, data: &[u8]) -> Self {
        IpcResponse::ConsoleOutput {
            instance_id: instance_id.into(),
            data_base64: BASE64.encode(data),
        }
    }

    /// Builds an `Error` response from any displayable error.
    pub fn error(err: impl std::fmt::Display) -> Self {
        IpcResponse::Error {
            message: err.to_string(),
        }
    }
}

/// Decodes the payload of an [`IpcResponse::ConsoleOutput`].
pub fn decode_output(data_base64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data_base64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_request_serialization() {
        let json = serde_json::to_string(&IpcRequest::Ping).unwrap();
        assert_eq!(json, r#""Ping""#);

        let json = serde_json::to_string(&IpcRequest::ListConsoles).unwrap();
        assert_eq!(json, r#""ListConsoles""#);
    }

    #[test]
    fn test_start_console_serialization() {
        let request = IpcRequest::StartConsole {
            instance_id: "instance-0001".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"StartConsole":{"instance_id":"instance-0001"}}"#);

        let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_console_output_is_base64() {
        let response = IpcResponse::console_output("vm1", b"login:\x00\xff");
        let IpcResponse::ConsoleOutput { data_base64, .. } = &response else {
            panic!("unexpected response: {:?}", response);
        };
        assert_eq!(data_base64, "bG9naW46AP8=");
        assert_eq!(decode_output(data_base64).unwrap(), b"login:\x00\xff");
    }

    #[test]
    fn test_consoles_response_json() {
        let response = IpcResponse::Consoles {
            consoles: vec![SessionSummary {
                instance_id: "vm1".to_string(),
                alive: true,
                console: Some(ConsoleInfo {
                    host: "127.0.0.1".to_string(),
                    port: 10000,
                }),
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""instance_id":"vm1""#));
        assert!(json.contains(r#""port":10000"#));

        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_error_response() {
        let response = IpcResponse::error("serial console unavailable for instance vm1");
        assert_eq!(
            response,
            IpcResponse::Error {
                message: "serial console unavailable for instance vm1".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_request_rejected() {
        let result: Result<IpcRequest, _> = serde_json::from_str(r#"{"Reboot":{}}"#);
        assert!(result.is_err());
    }
}
