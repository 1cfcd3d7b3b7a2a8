//! Daemon orchestrator for wiring together all components.
//!
//! [`ConsoleDaemon`] builds the host collaborators and the session registry
//! from configuration, reconciles sessions for already-running instances,
//! reaps dead sessions in the background and serves the control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ConsoleError;
use crate::host::FsHost;
use crate::ipc::{IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::network::{RangePortAllocator, TcpBridgeFactory};
use crate::session::{ConsoleServices, SessionRegistry, SessionSettings};

/// Daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Initial state, not started.
    Stopped,
    /// Binding the control socket and reconciling sessions.
    Starting,
    /// Serving requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// What a control connection needs to answer requests.
#[derive(Clone)]
struct RequestContext {
    registry: Arc<SessionRegistry>,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

/// The serial console daemon.
pub struct ConsoleDaemon {
    config: Config,
    state: Arc<RwLock<DaemonState>>,
    registry: Arc<SessionRegistry>,
    socket_path: PathBuf,
    started_at: Instant,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Cleanup and control-socket tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Per-connection request handlers.
    connections: TaskTracker,
}

impl ConsoleDaemon {
    /// Creates a daemon backed by the local filesystem, a port-range
    /// allocator and raw TCP bridges.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let (start, end) = config
            .console
            .ports()
            .context("Invalid console port range")?;
        let host = Arc::new(FsHost::from_config(&config.host));
        let services = ConsoleServices {
            host: host.clone(),
            paths: host,
            ports: Arc::new(RangePortAllocator::new(start, end)),
            bridges: Arc::new(TcpBridgeFactory),
        };

        Self::with_services(config, services)
    }

    /// Creates a daemon with caller-provided collaborators.
    pub fn with_services(config: Config, services: ConsoleServices) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let settings = SessionSettings::from_config(&config.console);
        let registry = Arc::new(SessionRegistry::new(services, settings));
        let socket_path = config.daemon.control_socket();

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(DaemonState::Stopped)),
            registry,
            socket_path,
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            connections: TaskTracker::new(),
        })
    }

    /// Returns the current daemon state.
    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Binds the control socket, starts sessions for running instances and
    /// launches the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != DaemonState::Stopped {
                anyhow::bail!("Daemon is already running");
            }
            *state = DaemonState::Starting;
        }

        info!(
            socket = %self.socket_path.display(),
            remote_enabled = self.config.console.enabled,
            "Starting serial console daemon"
        );

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = DaemonState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind control socket {}", self.socket_path.display())
                });
            }
        };

        if let Err(e) = self.registry.reconcile_active_sessions().await {
            warn!(error = %e, "Failed to enumerate running instances");
        }

        let cleanup = self.registry.start_cleanup_task(
            self.config.console.cleanup_interval(),
            self.shutdown_token.clone(),
        );
        debug!("Started session cleanup task");

        let context = RequestContext {
            registry: Arc::clone(&self.registry),
            shutdown_token: self.shutdown_token.clone(),
            started_at: self.started_at,
        };
        let control = tokio::spawn(serve_control_socket(
            server,
            context,
            self.connections.clone(),
        ));

        self.tasks.lock().await.extend([cleanup, control]);
        *self.state.write().await = DaemonState::Running;

        info!(
            consoles = self.registry.count().await,
            "Serial console daemon started"
        );
        Ok(())
    }

    /// Stops background tasks and every console session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == DaemonState::Stopped {
                return Ok(());
            }
            if *state == DaemonState::ShuttingDown {
                anyhow::bail!("Daemon is already shutting down");
            }
            *state = DaemonState::ShuttingDown;
        }

        info!("Stopping serial console daemon...");
        self.shutdown_token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Daemon task panicked");
            }
        }

        // The accept loop has exited; let requests already in flight finish
        // so none of them registers a session after stop_all.
        self.connections.close();
        self.connections.wait().await;

        self.registry.stop_all().await;

        *self.state.write().await = DaemonState::Stopped;
        info!("Serial console daemon stopped");
        Ok(())
    }

    /// Returns the session registry shared with the control socket.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the path of the control socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    ///
    /// A `Shutdown` request on the control socket cancels it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

async fn serve_control_socket(
    server: IpcServer,
    context: RequestContext,
    connections: TaskTracker,
) {
    loop {
        let conn = tokio::select! {
            _ = context.shutdown_token.cancelled() => break,
            accepted = server.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept control connection");
                    continue;
                }
            },
        };

        let context = context.clone();
        connections.spawn(async move {
            handle_connection(conn, context).await;
        });
    }

    debug!(socket = %server.path().display(), "Control socket closed");
}

async fn handle_connection(mut conn: IpcConnection, context: RequestContext) {
    loop {
        let request = tokio::select! {
            _ = context.shutdown_token.cancelled() => break,
            request = conn.read_request() => request,
        };

        let response = match request {
            Ok(Some(request)) => handle_request(&context, request).await,
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::error(format!("invalid request: {}", e)),
            Err(e) => {
                debug!(error = %e, "Control connection failed");
                break;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "Failed to send control response");
            break;
        }
    }
}

async fn handle_request(context: &RequestContext, request: IpcRequest) -> IpcResponse {
    let registry = &context.registry;

    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::Status => IpcResponse::Status {
            running: !context.shutdown_token.is_cancelled(),
            uptime_secs: context.started_at.elapsed().as_secs(),
            console_count: registry.count().await,
            remote_enabled: registry.settings().remote_enabled,
        },
        IpcRequest::Shutdown => {
            info!("Shutdown requested over control socket");
            context.shutdown_token.cancel();
            IpcResponse::ShuttingDown
        }
        IpcRequest::ListConsoles => IpcResponse::Consoles {
            consoles: registry.list().await,
        },
        IpcRequest::StartConsole { instance_id } => match registry.start(&instance_id).await {
            Ok(()) => IpcResponse::Started { instance_id },
            Err(e) => console_error(&instance_id, e),
        },
        IpcRequest::StopConsole { instance_id } => {
            registry.stop(&instance_id).await;
            IpcResponse::Stopped { instance_id }
        }
        IpcRequest::ConsoleInfo { instance_id } => {
            match registry.query_console_info(&instance_id).await {
                Ok(info) => IpcResponse::console_info(info),
                Err(e) => console_error(&instance_id, e),
            }
        }
        IpcRequest::ConsoleOutput { instance_id } => {
            match registry.read_console_output(&instance_id).await {
                Ok(data) => IpcResponse::console_output(instance_id, &data),
                Err(e) => console_error(&instance_id, e),
            }
        }
    }
}

fn console_error(instance_id: &str, error: ConsoleError) -> IpcResponse {
    match &error {
        // Expected whenever remote access is off or the VM is not running.
        ConsoleError::ConsoleUnavailable(_) => {
            debug!(instance_id = %instance_id, "Console unavailable")
        }
        _ => warn!(instance_id = %instance_id, error = %error, "Console request failed"),
    }
    IpcResponse::error(error)
}
