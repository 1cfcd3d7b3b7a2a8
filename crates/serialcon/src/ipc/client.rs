//! IPC client used by the CLI.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::messages::{decode_output, IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::session::{ConsoleInfo, SessionSummary};

/// Default timeout for client operations in seconds.
///
/// Starting a console may wait for the serial endpoint, so this is longer
/// than a plain request/response round trip needs.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A client for the daemon's control socket.
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to the daemon. Fails if the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream, Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
    }

    /// Connects to the daemon, giving up after `timeout`.
    ///
    /// The same timeout applies to every request on this client until
    /// [`set_timeout`](Self::set_timeout) changes it.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Io`] with `TimedOut` if the daemon does not accept
    /// in time, or the connect error if the socket is missing.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    /// Sets the per-request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a request and waits for the response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Requests the daemon status.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Asks the daemon to shut down.
    pub async fn shutdown(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Shutdown).await
    }

    /// Lists registered console sessions.
    pub async fn list_consoles(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.send(IpcRequest::ListConsoles).await? {
            IpcResponse::Consoles { consoles } => Ok(consoles),
            other => Err(unexpected(other)),
        }
    }

    /// Starts the console session of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Daemon`] with the daemon's message if the session
    /// could not be started.
    pub async fn start_console(&mut self, instance_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::StartConsole {
            instance_id: instance_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Started { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Stops the console session of an instance. Succeeds if none is running.
    pub async fn stop_console(&mut self, instance_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::StopConsole {
            instance_id: instance_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Stopped { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Returns where the instance's console can be reached.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Daemon`] if remote access is disabled or no live
    /// session is registered.
    pub async fn console_info(&mut self, instance_id: &str) -> Result<ConsoleInfo, IpcError> {
        let request = IpcRequest::ConsoleInfo {
            instance_id: instance_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::ConsoleInfo { host, port } => Ok(ConsoleInfo { host, port }),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches and decodes the instance's console transcript.
    pub async fn console_output(&mut self, instance_id: &str) -> Result<Vec<u8>, IpcError> {
        let request = IpcRequest::ConsoleOutput {
            instance_id: instance_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::ConsoleOutput { data_base64, .. } => Ok(decode_output(&data_base64)?),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { message } => IpcError::Daemon(message),
        other => IpcError::UnexpectedResponse(Box::new(other)),
    }
}
