//! Per-instance console session.
//!
//! A session composes one [`StreamPump`] and, when remote access is
//! enabled, one [`NetworkBridge`] sharing the same pair of queues. The
//! bridge is started before the pump and stopped before it, so bytes read
//! from the VM always have somewhere to go.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pump::{PumpSettings, StreamPump};
use super::queue::DirectedQueue;
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, Result};
use crate::host::{HostInspector, InstanceId, InstancePaths};
use crate::network::{BridgeFactory, NetworkBridge, PortAllocator};

/// Where a remote client can reach an instance's console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub host: String,
    pub port: u16,
}

/// External collaborators a session needs.
#[derive(Clone)]
pub struct ConsoleServices {
    pub host: Arc<dyn HostInspector>,
    pub paths: Arc<dyn InstancePaths>,
    pub ports: Arc<dyn PortAllocator>,
    pub bridges: Arc<dyn BridgeFactory>,
}

impl fmt::Debug for ConsoleServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleServices").finish_non_exhaustive()
    }
}

/// Session behaviour derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Expose the console through a network bridge.
    pub remote_enabled: bool,
    /// Bridge listen address, also reported to clients.
    pub proxy_address: String,
    pub pump: PumpSettings,
}

impl SessionSettings {
    /// Derives session settings from the `[console]` section.
    pub fn from_config(config: &ConsoleConfig) -> Self {
        Self {
            remote_enabled: config.enabled,
            proxy_address: config.proxy_address.clone(),
            pump: PumpSettings::from_config(config),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            remote_enabled: false,
            proxy_address: "127.0.0.1".to_string(),
            pump: PumpSettings::default(),
        }
    }
}

/// Serial console of one instance.
pub struct ConsoleSession {
    instance_id: InstanceId,
    services: ConsoleServices,
    settings: SessionSettings,
    inbound: Arc<DirectedQueue>,
    outbound: Arc<DirectedQueue>,
    pump: Option<StreamPump>,
    bridge: Option<Box<dyn NetworkBridge>>,
    listen: Option<ConsoleInfo>,
}

impl ConsoleSession {
    /// Creates a stopped session for an instance.
    ///
    /// No endpoint is resolved and no port is allocated until
    /// [`start`](Self::start).
    pub fn new(
        instance_id: impl Into<InstanceId>,
        services: ConsoleServices,
        settings: SessionSettings,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            services,
            settings,
            inbound: Arc::new(DirectedQueue::new()),
            outbound: Arc::new(DirectedQueue::new()),
            pump: None,
            bridge: None,
            listen: None,
        }
    }

    /// Returns the instance this session belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Returns true while the pump is running.
    pub fn is_alive(&self) -> bool {
        self.pump.as_ref().is_some_and(StreamPump::is_running)
    }

    /// Client → VM queue of the current run.
    pub fn inbound(&self) -> &Arc<DirectedQueue> {
        &self.inbound
    }

    /// VM → client queue of the current run.
    pub fn outbound(&self) -> &Arc<DirectedQueue> {
        &self.outbound
    }

    /// Starts the bridge (if enabled) and then the pump.
    ///
    /// Idempotent. On failure everything acquired so far is released.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::EndpointUnavailable`] if the instance has no
    /// serial endpoint, a port allocation or bridge error when remote access
    /// is enabled, or any error from [`StreamPump::start`].
    pub async fn start(&mut self) -> Result<()> {
        if self.pump.is_some() {
            return Ok(());
        }

        let endpoint = self
            .services
            .host
            .resolve_console_endpoint(&self.instance_id)
            .ok_or_else(|| ConsoleError::EndpointUnavailable(self.instance_id.clone()))?;
        let log_paths = self.services.paths.console_log_paths(&self.instance_id);

        self.inbound = Arc::new(DirectedQueue::new());
        self.outbound = Arc::new(DirectedQueue::new());
        let mut pump = StreamPump::new(
            self.instance_id.clone(),
            endpoint,
            log_paths,
            self.settings.pump.clone(),
            Arc::clone(&self.inbound),
            Arc::clone(&self.outbound),
        );

        if self.settings.remote_enabled {
            self.start_bridge().await?;
        }

        if let Err(e) = pump.start().await {
            self.stop_bridge().await;
            return Err(e);
        }
        self.pump = Some(pump);

        tracing::info!(
            instance_id = %self.instance_id,
            remote = self.listen.is_some(),
            "Console session started"
        );
        Ok(())
    }

    async fn start_bridge(&mut self) -> Result<()> {
        let host = self.settings.proxy_address.clone();
        // The allocator checks ports with blocking binds.
        let ports = Arc::clone(&self.services.ports);
        let bind_host = host.clone();
        let port = tokio::task::spawn_blocking(move || ports.allocate_port(&bind_host))
            .await
            .map_err(|e| ConsoleError::PortAllocation {
                host: host.clone(),
                reason: e.to_string(),
            })??;

        let mut bridge = self.services.bridges.create(
            &self.instance_id,
            Arc::clone(&self.inbound),
            Arc::clone(&self.outbound),
        );
        if let Err(e) = bridge.start(&host, port).await {
            self.services.ports.release_port(&host, port);
            return Err(e);
        }

        self.bridge = Some(bridge);
        self.listen = Some(ConsoleInfo { host, port });
        Ok(())
    }

    async fn stop_bridge(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop().await;
        }
        if let Some(info) = self.listen.take() {
            self.services.ports.release_port(&info.host, info.port);
        }
    }

    /// Stops the bridge, releases its port, stops the pump and closes the
    /// queues. Idempotent.
    pub async fn stop(&mut self) {
        let was_started = self.pump.is_some() || self.bridge.is_some();

        self.stop_bridge().await;
        if let Some(mut pump) = self.pump.take() {
            pump.stop().await;
        }
        self.inbound.close();
        self.outbound.close();

        if was_started {
            tracing::info!(instance_id = %self.instance_id, "Console session stopped");
        }
    }

    /// Returns where remote clients can connect.
    ///
    /// Fails with [`ConsoleError::ConsoleUnavailable`] when remote access is
    /// disabled or the session is not live.
    pub fn query_console_info(&self) -> Result<ConsoleInfo> {
        if !self.settings.remote_enabled || !self.is_alive() {
            return Err(ConsoleError::ConsoleUnavailable(self.instance_id.clone()));
        }
        self.listen
            .clone()
            .ok_or_else(|| ConsoleError::ConsoleUnavailable(self.instance_id.clone()))
    }
}

impl fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("instance_id", &self.instance_id)
            .field("alive", &self.is_alive())
            .field("listen", &self.listen)
            .finish()
    }
}
