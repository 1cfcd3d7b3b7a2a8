//! Serial stream pump.
//!
//! A [`StreamPump`] owns the connection to one VM's serial endpoint and
//! runs two tasks:
//!
//! - inbound: endpoint → outbound queue, mirrored to the console log
//! - outbound: inbound queue → endpoint, only while a consumer is attached
//!
//! Every await in both tasks is raced against the pump's cancellation
//! token. Either task trips the token on an I/O failure, which takes the
//! other one down too.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::endpoint;
use super::log::ConsoleLog;
use super::queue::DirectedQueue;
use crate::config::{ConsoleConfig, DEFAULT_MAX_LOG_SIZE};
use crate::error::{ConsoleError, Result};
use crate::host::{ConsoleLogPaths, EndpointName, InstanceId};

/// Buffer size for reading from the serial endpoint.
const READ_BUFFER_SIZE: usize = 4096;

/// Lifecycle state of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Constructed, not started.
    Idle,
    /// Workers launched.
    Running,
    /// Stopped. Terminal.
    Stopped,
}

/// Settings shared by every pump of a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSettings {
    /// Rotation threshold for the active console log.
    pub max_log_size: u64,
    /// How long `start` waits for the endpoint to accept.
    pub connect_timeout: Duration,
}

impl PumpSettings {
    /// Derives pump settings from the `[console]` section.
    pub fn from_config(config: &ConsoleConfig) -> Self {
        Self {
            max_log_size: config.max_log_size,
            connect_timeout: config.endpoint_connect_timeout(),
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Moves bytes between a serial endpoint and a pair of queues.
pub struct StreamPump {
    instance_id: InstanceId,
    endpoint: EndpointName,
    log_paths: ConsoleLogPaths,
    settings: PumpSettings,
    /// Remote client → VM.
    inbound: Arc<DirectedQueue>,
    /// VM → remote client.
    outbound: Arc<DirectedQueue>,
    state: PumpState,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl StreamPump {
    /// Creates an idle pump.
    ///
    /// The endpoint is not opened until [`start`](Self::start).
    pub fn new(
        instance_id: impl Into<InstanceId>,
        endpoint: impl Into<EndpointName>,
        log_paths: ConsoleLogPaths,
        settings: PumpSettings,
        inbound: Arc<DirectedQueue>,
        outbound: Arc<DirectedQueue>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            endpoint: endpoint.into(),
            log_paths,
            settings,
            inbound,
            outbound,
            state: PumpState::Idle,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Returns the instance this pump serves.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Returns the lifecycle state.
    ///
    /// A `Running` pump whose worker failed stays `Running` until
    /// [`stop`](Self::stop); use [`is_running`](Self::is_running) for liveness.
    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Returns true while the workers run and neither has failed.
    pub fn is_running(&self) -> bool {
        self.state == PumpState::Running && !self.shutdown.is_cancelled()
    }

    /// Connects to the endpoint, opens the log and launches both workers.
    ///
    /// No-op on a running pump. A stopped pump cannot be restarted.
    ///
    /// # Errors
    ///
    /// - [`ConsoleError::PumpStopped`] if the pump was stopped before
    /// - [`ConsoleError::EndpointConnect`] if the endpoint never accepts
    ///   within the connect timeout
    /// - [`ConsoleError::Io`] if the console log cannot be opened
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            PumpState::Running => return Ok(()),
            PumpState::Stopped => return Err(ConsoleError::PumpStopped(self.instance_id.clone())),
            PumpState::Idle => {}
        }

        let token = CancellationToken::new();
        self.shutdown = token.clone();

        let stream =
            endpoint::connect(&self.endpoint, self.settings.connect_timeout, &token).await?;
        let log = ConsoleLog::open(self.log_paths.clone(), self.settings.max_log_size).await?;
        let (reader, writer) = stream.into_split();

        let inbound_task = tokio::spawn(inbound_loop(
            self.instance_id.clone(),
            reader,
            log,
            Arc::clone(&self.outbound),
            token.clone(),
        ));
        let outbound_task = tokio::spawn(outbound_loop(
            self.instance_id.clone(),
            writer,
            Arc::clone(&self.inbound),
            token,
        ));
        self.workers = vec![inbound_task, outbound_task];
        self.state = PumpState::Running;

        tracing::info!(
            instance_id = %self.instance_id,
            endpoint = %self.endpoint.display(),
            "Serial stream pump started"
        );
        Ok(())
    }

    /// Cancels both workers and waits for them to exit.
    ///
    /// Safe in any state and idempotent.
    pub async fn stop(&mut self) {
        if self.state == PumpState::Stopped {
            return;
        }
        self.shutdown.cancel();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Stream pump worker panicked"
                );
            }
        }

        let was_running = self.state == PumpState::Running;
        self.state = PumpState::Stopped;
        if was_running {
            tracing::info!(instance_id = %self.instance_id, "Serial stream pump stopped");
        }
    }

    /// Path of the endpoint this pump connects to.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}

impl std::fmt::Debug for StreamPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPump")
            .field("instance_id", &self.instance_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn inbound_loop(
    instance_id: InstanceId,
    mut reader: OwnedReadHalf,
    mut log: ConsoleLog,
    outbound: Arc<DirectedQueue>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::warn!(instance_id = %instance_id, "Serial endpoint closed");
                    token.cancel();
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "Error reading from serial endpoint"
                    );
                    token.cancel();
                    break;
                }
            },
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        outbound.put(data.clone());

        if let Err(e) = log.append(&data).await {
            tracing::warn!(
                instance_id = %instance_id,
                log = %log.paths().active.display(),
                error = %e,
                "Failed to write console log"
            );
        }
    }

    if let Err(e) = log.close().await {
        tracing::warn!(instance_id = %instance_id, error = %e, "Failed to close console log");
    }
    tracing::debug!(instance_id = %instance_id, "Inbound loop exited");
}

async fn outbound_loop(
    instance_id: InstanceId,
    mut writer: OwnedWriteHalf,
    inbound: Arc<DirectedQueue>,
    token: CancellationToken,
) {
    loop {
        // Hold client input back until a client is actually connected.
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = inbound.wait_for_consumer() => {}
        }

        let buffer = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            buffer = inbound.get() => match buffer {
                Some(buffer) => buffer,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = writer.write_all(&buffer) => {
                if let Err(e) = result {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "Error writing to serial endpoint"
                    );
                    token.cancel();
                    break;
                }
            }
        }
    }

    tracing::debug!(instance_id = %instance_id, "Outbound loop exited");
}
