//! Console session management.
//!
//! This module provides the serial stream pump and the per-instance session
//! lifecycle. Sessions are started, stopped and queried through the
//! [`SessionRegistry`].

pub mod console;
pub mod endpoint;
pub mod log;
pub mod pump;
pub mod queue;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use console::{ConsoleInfo, ConsoleServices, ConsoleSession, SessionSettings};
pub use log::{read_transcript, ConsoleLog};
pub use pump::{PumpSettings, PumpState, StreamPump};
pub use queue::DirectedQueue;
pub use registry::{SessionRegistry, SessionSummary};
