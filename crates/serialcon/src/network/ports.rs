//! Listen port allocation for network bridges.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Mutex;

use crate::error::{ConsoleError, Result};

/// Hands out listen ports for console bridges.
pub trait PortAllocator: Send + Sync {
    /// Reserves a free port on `host`.
    fn allocate_port(&self, host: &str) -> Result<u16>;

    /// Returns a port reserved by [`allocate_port`](Self::allocate_port).
    fn release_port(&self, host: &str, port: u16);
}

/// Allocates ports from an inclusive range.
///
/// A port is never handed out twice for the same host while allocated.
/// Ports that cannot currently be bound are skipped.
#[derive(Debug)]
pub struct RangePortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashSet<(String, u16)>>,
}

impl RangePortAllocator {
    /// Creates an allocator for the inclusive range `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the inclusive port range.
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Number of ports currently reserved across all hosts.
    pub fn allocated_count(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate_port(&self, host: &str) -> Result<u16> {
        let ip: IpAddr = host.parse().map_err(|_| ConsoleError::PortAllocation {
            host: host.to_string(),
            reason: "not an IP address".to_string(),
        })?;

        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.start..=self.end {
            let key = (host.to_string(), port);
            if allocated.contains(&key) {
                continue;
            }
            if TcpListener::bind(SocketAddr::new(ip, port)).is_ok() {
                allocated.insert(key);
                tracing::debug!(host = %host, port, "Allocated console port");
                return Ok(port);
            }
        }

        Err(ConsoleError::PortAllocation {
            host: host.to_string(),
            reason: format!("no free port in {}:{}", self.start, self.end),
        })
    }

    fn release_port(&self, host: &str, port: u16) {
        let removed = self
            .allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(host.to_string(), port));
        if removed {
            tracing::debug!(host = %host, port, "Released console port");
        }
    }
}
