//! Fixtures shared by session and registry tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UnixListener;

use super::console::{ConsoleServices, SessionSettings};
use super::pump::PumpSettings;
use super::queue::DirectedQueue;
use crate::error::{ConsoleError, Result};
use crate::host::FsHost;
use crate::network::{BridgeFactory, NetworkBridge, PortAllocator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Started(String, u16),
    Stopped(String),
}

/// Hands out sequential ports and records what happened to them.
#[derive(Debug)]
pub struct RecordingPorts {
    next: AtomicU16,
    allocated: Mutex<Vec<u16>>,
    released: Mutex<Vec<u16>>,
}

impl RecordingPorts {
    fn new() -> Self {
        Self {
            next: AtomicU16::new(20000),
            allocated: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Ports currently held.
    pub fn allocated(&self) -> Vec<u16> {
        self.allocated.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<u16> {
        self.released.lock().unwrap().clone()
    }
}

impl PortAllocator for RecordingPorts {
    fn allocate_port(&self, _host: &str) -> Result<u16> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        self.allocated.lock().unwrap().push(port);
        Ok(port)
    }

    fn release_port(&self, _host: &str, port: u16) {
        self.allocated.lock().unwrap().retain(|p| *p != port);
        self.released.lock().unwrap().push(port);
    }
}

#[derive(Debug, Default)]
pub struct RecordingBridges {
    events: Arc<Mutex<Vec<BridgeEvent>>>,
    fail_start: Arc<AtomicBool>,
}

struct RecordingBridge {
    instance_id: String,
    events: Arc<Mutex<Vec<BridgeEvent>>>,
    fail_start: Arc<AtomicBool>,
}

impl NetworkBridge for RecordingBridge {
    fn start<'a>(
        &'a mut self,
        _host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ConsoleError::Bridge("refused".to_string()));
            }
            self.events
                .lock()
                .unwrap()
                .push(BridgeEvent::Started(self.instance_id.clone(), port));
            Ok(())
        })
    }

    fn stop<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap()
                .push(BridgeEvent::Stopped(self.instance_id.clone()));
        })
    }
}

impl BridgeFactory for RecordingBridges {
    fn create(
        &self,
        instance_id: &str,
        _inbound: Arc<DirectedQueue>,
        _outbound: Arc<DirectedQueue>,
    ) -> Box<dyn NetworkBridge> {
        Box::new(RecordingBridge {
            instance_id: instance_id.to_string(),
            events: Arc::clone(&self.events),
            fail_start: Arc::clone(&self.fail_start),
        })
    }
}

/// A scratch host: instance and endpoint directories under a temp dir.
pub struct TestHost {
    _temp_dir: TempDir,
    pub fs: Arc<FsHost>,
    pub ports: Arc<RecordingPorts>,
    pub bridges: Arc<RecordingBridges>,
}

impl TestHost {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let instances = temp_dir.path().join("instances");
        let endpoints = temp_dir.path().join("endpoints");
        std::fs::create_dir_all(&instances).unwrap();
        std::fs::create_dir_all(&endpoints).unwrap();

        Self {
            fs: Arc::new(FsHost::new(instances, endpoints)),
            _temp_dir: temp_dir,
            ports: Arc::new(RecordingPorts::new()),
            bridges: Arc::new(RecordingBridges::default()),
        }
    }

    pub fn services(&self) -> ConsoleServices {
        ConsoleServices {
            host: self.fs.clone(),
            paths: self.fs.clone(),
            ports: self.ports.clone(),
            bridges: self.bridges.clone(),
        }
    }

    pub fn settings(&self, remote_enabled: bool) -> SessionSettings {
        SessionSettings {
            remote_enabled,
            proxy_address: "127.0.0.1".to_string(),
            pump: PumpSettings {
                max_log_size: 1024,
                connect_timeout: Duration::from_millis(300),
            },
        }
    }

    /// Creates the instance directory and a listening serial endpoint.
    pub fn add_instance(&self, instance_id: &str) -> UnixListener {
        std::fs::create_dir_all(self.fs.instance_dir(instance_id)).unwrap();
        UnixListener::bind(self.fs.endpoint_path(instance_id)).unwrap()
    }

    /// Creates a stale endpoint socket: listed and resolvable, but nobody
    /// accepts on it.
    pub fn add_dead_endpoint(&self, instance_id: &str) {
        std::fs::create_dir_all(self.fs.instance_dir(instance_id)).unwrap();
        let listener =
            std::os::unix::net::UnixListener::bind(self.fs.endpoint_path(instance_id)).unwrap();
        drop(listener);
    }

    pub fn fail_bridge_start(&self) {
        self.bridges.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn bridge_events(&self) -> Vec<BridgeEvent> {
        self.bridges.events.lock().unwrap().clone()
    }
}
