//! Connecting to a VM's serial endpoint.
//!
//! The hypervisor creates the endpoint socket when the VM boots, but it may
//! not be accepting yet when a session starts. Connection is retried until
//! the timeout elapses.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ConsoleError, Result};

/// Delay between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Opens the serial endpoint at `path`.
///
/// Missing or not-yet-listening endpoints are retried every 200ms until
/// `timeout` elapses. Other errors fail immediately. Cancelling `token`
/// aborts the wait with an [`io::ErrorKind::Interrupted`] error.
pub async fn connect(
    path: &Path,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<UnixStream> {
    let deadline = Instant::now() + timeout;

    loop {
        let error = match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        if !is_retryable(&error) || Instant::now() + RETRY_INTERVAL > deadline {
            return Err(ConsoleError::EndpointConnect {
                endpoint: path.to_path_buf(),
                source: error,
            });
        }

        tracing::trace!(
            endpoint = %path.display(),
            error = %error,
            "Serial endpoint not ready, retrying"
        );

        tokio::select! {
            _ = token.cancelled() => {
                return Err(ConsoleError::EndpointConnect {
                    endpoint: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"),
                });
            }
            _ = sleep(RETRY_INTERVAL) => {}
        }
    }
}

fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
