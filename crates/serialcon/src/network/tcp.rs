//! Raw TCP console bridge.
//!
//! Serves one client at a time. While a client is connected both queues
//! are marked attached and bytes flow in both directions. With nobody
//! connected, VM output is drained and dropped; it is still in the
//! console log. Extra clients are disconnected on accept.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BridgeFactory, NetworkBridge};
use crate::error::{ConsoleError, Result};
use crate::host::InstanceId;
use crate::session::DirectedQueue;

/// Buffer size for reading from the remote client.
const READ_BUFFER_SIZE: usize = 4096;

/// Bridges a console session to plain TCP clients.
pub struct TcpBridge {
    instance_id: InstanceId,
    inbound: Arc<DirectedQueue>,
    outbound: Arc<DirectedQueue>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpBridge {
    /// Creates an idle bridge over the session's queues.
    ///
    /// `inbound` receives client keystrokes, `outbound` is drained toward
    /// the client. Nothing is bound until [`NetworkBridge::start`].
    pub fn new(
        instance_id: impl Into<InstanceId>,
        inbound: Arc<DirectedQueue>,
        outbound: Arc<DirectedQueue>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            inbound,
            outbound,
            shutdown: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    /// Address the bridge is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns `true` while the accept loop is running.
    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    async fn listen(&mut self, host: &str, port: u16) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            ConsoleError::Bridge(format!("failed to listen on {}:{}: {}", host, port, e))
        })?;
        self.local_addr = listener.local_addr().ok();

        let token = CancellationToken::new();
        self.shutdown = token.clone();
        self.task = Some(tokio::spawn(serve(
            self.instance_id.clone(),
            listener,
            Arc::clone(&self.inbound),
            Arc::clone(&self.outbound),
            token,
        )));

        tracing::info!(
            instance_id = %self.instance_id,
            addr = %format!("{}:{}", host, port),
            "Console bridge listening"
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Console bridge task panicked"
                );
            }
            tracing::info!(instance_id = %self.instance_id, "Console bridge stopped");
        }
        self.local_addr = None;
        self.inbound.clear_consumer_attached();
        self.outbound.clear_consumer_attached();
    }
}

impl NetworkBridge for TcpBridge {
    fn start<'a>(
        &'a mut self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.listen(host, port))
    }

    fn stop<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.shutdown())
    }
}

/// Creates a [`TcpBridge`] per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBridgeFactory;

impl BridgeFactory for TcpBridgeFactory {
    fn create(
        &self,
        instance_id: &str,
        inbound: Arc<DirectedQueue>,
        outbound: Arc<DirectedQueue>,
    ) -> Box<dyn NetworkBridge> {
        Box::new(TcpBridge::new(instance_id, inbound, outbound))
    }
}

async fn serve(
    instance_id: InstanceId,
    listener: TcpListener,
    inbound: Arc<DirectedQueue>,
    outbound: Arc<DirectedQueue>,
    token: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, error = %e, "Accept failed");
                    continue;
                }
            },
            // Nobody to deliver to.
            buffer = outbound.get() => match buffer {
                Some(_) => continue,
                None => break,
            },
        };

        tracing::info!(instance_id = %instance_id, peer = %peer, "Console client connected");
        let keep_serving =
            serve_client(&instance_id, &listener, stream, &inbound, &outbound, &token).await;
        tracing::info!(instance_id = %instance_id, peer = %peer, "Console client disconnected");

        if !keep_serving {
            break;
        }
    }

    inbound.clear_consumer_attached();
    outbound.clear_consumer_attached();
}

/// Pumps bytes for one client. Returns false when the bridge should exit.
async fn serve_client(
    instance_id: &str,
    listener: &TcpListener,
    stream: TcpStream,
    inbound: &DirectedQueue,
    outbound: &DirectedQueue,
    token: &CancellationToken,
) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    inbound.set_consumer_attached();
    outbound.set_consumer_attached();

    let keep_serving = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break false,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break true,
                Ok(n) => inbound.put(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, error = %e, "Client read failed");
                    break true;
                }
            },
            buffer = outbound.get() => {
                let Some(buffer) = buffer else { break false };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break false,
                    result = writer.write_all(&buffer) => {
                        if let Err(e) = result {
                            tracing::warn!(
                                instance_id = %instance_id,
                                error = %e,
                                "Client write failed"
                            );
                            break true;
                        }
                    }
                }
            },
            extra = listener.accept() => {
                if let Ok((extra, peer)) = extra {
                    tracing::debug!(
                        instance_id = %instance_id,
                        peer = %peer,
                        "Rejecting second console client"
                    );
                    drop(extra);
                }
            },
        }
    };

    inbound.clear_consumer_attached();
    outbound.clear_consumer_attached();
    keep_serving
}
