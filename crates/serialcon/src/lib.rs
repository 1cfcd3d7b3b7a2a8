//! # serialcon
//!
//! Serial console redirection for virtual machines on a compute host.
//!
//! ## Overview
//!
//! Every running VM exposes its virtual serial port as a local Unix socket.
//! For each VM the daemon keeps one console session that:
//!
//! - copies everything the VM prints into a size-bounded, rotating log
//! - optionally exposes the console to a remote client over TCP
//! - forwards the client's keystrokes to the VM only while a client is
//!   actually connected
//!
//! ## Architecture
//!
//! ```text
//!   remote client ──► NetworkBridge ──► inbound queue ──► StreamPump ──► serial endpoint
//!   remote client ◄── NetworkBridge ◄── outbound queue ◄── StreamPump ◄── serial endpoint
//!                                                             │
//!                                                             └──► console.log (+ .1)
//! ```
//!
//! A [`ConsoleSession`] composes one pump and one bridge; the
//! [`SessionRegistry`] keeps at most one session per instance.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serialcon::{Config, ConsoleDaemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut daemon = ConsoleDaemon::new(config)?;
//!     daemon.start().await?;
//!
//!     daemon.shutdown_token().cancelled().await;
//!     daemon.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`error`]: Console error type
//! - [`host`]: Instance enumeration and path layout
//! - [`session`]: Queues, stream pump, sessions and registry
//! - [`network`]: Network bridges and port allocation
//! - [`ipc`]: Control socket protocol, server and client
//! - [`orchestrator`]: Daemon wiring

pub mod config;
pub mod error;
pub mod host;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod session;

// Re-export config types for convenience
pub use config::Config;

pub use error::{ConsoleError, Result};

pub use host::{ConsoleLogPaths, FsHost, HostInspector, InstanceId, InstancePaths};

// Re-export session types for convenience
pub use session::{
    ConsoleInfo, ConsoleServices, ConsoleSession, DirectedQueue, SessionRegistry,
    SessionSettings, SessionSummary, StreamPump,
};

// Re-export network types for convenience
pub use network::{
    BridgeFactory, NetworkBridge, PortAllocator, RangePortAllocator, TcpBridge, TcpBridgeFactory,
};

pub use orchestrator::{ConsoleDaemon, DaemonState};
