//! Network side of a console session.
//!
//! A [`NetworkBridge`] terminates the remote transport and exchanges bytes
//! with the session's two queues:
//! - it drains the outbound queue (VM output) toward the remote client
//! - it feeds the inbound queue (client keystrokes) toward the VM
//!
//! [`TcpBridge`] is a raw TCP implementation. [`RangePortAllocator`] hands
//! out its listen ports.

pub mod ports;
pub mod tcp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::session::DirectedQueue;

/// A remote console transport bound to one session's queues.
pub trait NetworkBridge: Send + Sync {
    /// Starts listening on `host:port` and serving clients.
    fn start<'a>(
        &'a mut self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Stops serving, disconnects any client and clears the attached flags.
    fn stop<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Builds a bridge for a session.
pub trait BridgeFactory: Send + Sync {
    /// `inbound` carries client → VM bytes, `outbound` VM → client bytes.
    fn create(
        &self,
        instance_id: &str,
        inbound: Arc<DirectedQueue>,
        outbound: Arc<DirectedQueue>,
    ) -> Box<dyn NetworkBridge>;
}

// Re-export key types
pub use ports::{PortAllocator, RangePortAllocator};
pub use tcp::{TcpBridge, TcpBridgeFactory};
