//! Registry of console sessions.
//!
//! Holds at most one [`ConsoleSession`] per instance. Every lifecycle
//! operation on an instance runs under that instance's async mutex, so
//! concurrent start/stop/query calls for one VM are serialized while calls
//! for different VMs proceed independently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::console::{ConsoleInfo, ConsoleServices, ConsoleSession, SessionSettings};
use super::log::read_transcript;
use crate::error::{ConsoleError, Result};
use crate::host::{is_valid_instance_id, InstanceId};

/// Per-instance slot. The mutex is the instance's lifecycle lock.
type Slot = Arc<Mutex<Option<ConsoleSession>>>;

/// Summary of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub instance_id: InstanceId,
    /// Whether the pump is still running.
    pub alive: bool,
    /// Remote endpoint, if remote access is enabled and the session is live.
    pub console: Option<ConsoleInfo>,
}

/// Process-wide map from instance to console session.
pub struct SessionRegistry {
    services: ConsoleServices,
    settings: SessionSettings,
    /// Slots are created on start and dropped once empty and unshared.
    slots: DashMap<InstanceId, Slot>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    ///
    /// Every session it starts shares `services` and `settings`.
    pub fn new(services: ConsoleServices, settings: SessionSettings) -> Self {
        Self {
            services,
            settings,
            slots: DashMap::new(),
        }
    }

    /// Returns the settings applied to new sessions.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn slot(&self, instance_id: &str) -> Slot {
        Arc::clone(self.slots.entry(instance_id.to_string()).or_default().value())
    }

    /// Drops the slot of an instance if it holds no session and no other
    /// caller has a handle to it.
    fn release_slot(&self, instance_id: &str) {
        self.slots.remove_if(instance_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|current| current.is_none())
        });
    }

    fn existing_slot(&self, instance_id: &str) -> Option<Slot> {
        self.slots.get(instance_id).map(|entry| Arc::clone(entry.value()))
    }

    fn all_slots(&self) -> Vec<(InstanceId, Slot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Starts the console session of an instance.
    ///
    /// No-op if a live session is registered. A registered session whose
    /// pump has died is stopped and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::EndpointUnavailable`] for an invalid id and
    /// otherwise any error from [`ConsoleSession::start`]. Nothing is
    /// registered on failure.
    pub async fn start(&self, instance_id: &str) -> Result<()> {
        if !is_valid_instance_id(instance_id) {
            return Err(ConsoleError::EndpointUnavailable(instance_id.to_string()));
        }

        let result = {
            let slot = self.slot(instance_id);
            let mut current = slot.lock().await;

            if current.as_ref().is_some_and(ConsoleSession::is_alive) {
                return Ok(());
            }
            if let Some(mut dead) = current.take() {
                tracing::warn!(instance_id = %instance_id, "Replacing dead console session");
                dead.stop().await;
            }

            let mut session =
                ConsoleSession::new(instance_id, self.services.clone(), self.settings.clone());
            let result = session.start().await;
            if result.is_ok() {
                *current = Some(session);
            }
            result
        };

        if result.is_err() {
            self.release_slot(instance_id);
        }
        result
    }

    /// Stops and removes the session of an instance. No-op if none.
    pub async fn stop(&self, instance_id: &str) {
        let Some(slot) = self.existing_slot(instance_id) else {
            return;
        };
        {
            let mut current = slot.lock().await;
            if let Some(mut session) = current.take() {
                session.stop().await;
            }
        }
        drop(slot);
        self.release_slot(instance_id);
    }

    /// Returns where remote clients can reach the instance's console.
    pub async fn query_console_info(&self, instance_id: &str) -> Result<ConsoleInfo> {
        let unavailable = || ConsoleError::ConsoleUnavailable(instance_id.to_string());

        let slot = self.existing_slot(instance_id).ok_or_else(unavailable)?;
        let current = slot.lock().await;
        current.as_ref().ok_or_else(unavailable)?.query_console_info()
    }

    /// Returns the instance's console transcript, oldest bytes first.
    ///
    /// Works whether or not a session is registered.
    pub async fn read_console_output(&self, instance_id: &str) -> Result<Vec<u8>> {
        let output_error = |source| ConsoleError::OutputUnavailable {
            instance_id: instance_id.to_string(),
            source,
        };

        if !is_valid_instance_id(instance_id) {
            return Err(output_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid instance id",
            )));
        }

        let paths = self.services.paths.console_log_paths(instance_id);
        let slot = self.existing_slot(instance_id);
        let _guard = match &slot {
            Some(slot) => Some(slot.lock().await),
            None => None,
        };

        read_transcript(&paths).await.map_err(output_error)
    }

    /// Starts a session for every running instance that has an instance
    /// directory. A failure for one instance does not stop the others.
    pub async fn reconcile_active_sessions(&self) -> Result<()> {
        let running = self.services.host.list_running_instances()?;
        tracing::info!(instances = running.len(), "Reconciling console sessions");

        for instance_id in running {
            if !self.services.paths.instance_dir_exists(&instance_id) {
                tracing::debug!(
                    instance_id = %instance_id,
                    "Skipping instance without instance directory"
                );
                continue;
            }
            if let Err(e) = self.start(&instance_id).await {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to start console session"
                );
            }
        }

        Ok(())
    }

    /// Lists registered sessions ordered by instance id.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for (instance_id, slot) in self.all_slots() {
            let current = slot.lock().await;
            if let Some(session) = current.as_ref() {
                summaries.push(SessionSummary {
                    instance_id,
                    alive: session.is_alive(),
                    console: session.query_console_info().ok(),
                });
            }
        }
        summaries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        summaries
    }

    /// Returns the number of registered sessions.
    pub async fn count(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.all_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Returns `true` if a session is registered for the instance.
    pub async fn contains(&self, instance_id: &str) -> bool {
        match self.existing_slot(instance_id) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Stops and removes sessions whose pump has died.
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup(&self) -> usize {
        let mut removed = Vec::new();
        for (instance_id, slot) in self.all_slots() {
            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(|s| !s.is_alive()) {
                if let Some(mut session) = current.take() {
                    session.stop().await;
                    tracing::info!(instance_id = %instance_id, "Cleaned up dead console session");
                    removed.push(instance_id);
                }
            }
        }

        for instance_id in &removed {
            self.release_slot(instance_id);
        }
        removed.len()
    }

    /// Starts a background task that periodically cleans up dead sessions.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        registry.cleanup().await;
                    }
                }
            }
        })
    }

    /// Stops every registered session.
    pub async fn stop_all(&self) {
        let mut stopped = Vec::new();
        for (instance_id, slot) in self.all_slots() {
            let mut current = slot.lock().await;
            if let Some(mut session) = current.take() {
                session.stop().await;
            }
            stopped.push(instance_id);
        }

        for instance_id in &stopped {
            self.release_slot(instance_id);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("settings", &self.settings)
            .field("slots", &self.slots.len())
            .finish()
    }
}
