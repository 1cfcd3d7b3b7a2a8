//! Host collaborators consumed by the console subsystem.
//!
//! The console core never enumerates VMs or computes paths itself. It asks
//! a [`HostInspector`] which instances are running and where their serial
//! endpoints live, and an [`InstancePaths`] where logs and instance
//! directories are. [`FsHost`] implements both for a host where the
//! hypervisor exposes each serial port as a Unix socket.

pub mod fs;

use std::io;
use std::path::{Path, PathBuf};

pub use fs::FsHost;

/// Identity of a VM instance.
pub type InstanceId = String;

/// Address of a VM's local serial endpoint (a Unix socket path).
pub type EndpointName = PathBuf;

/// Suffix appended to the active log path to name the rotated generation.
pub const ROTATED_LOG_SUFFIX: &str = ".1";

/// The active console log and its single rotated predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLogPaths {
    /// File currently being appended to.
    pub active: PathBuf,
    /// Previous generation, replaced on every rotation.
    pub rotated: PathBuf,
}

impl ConsoleLogPaths {
    /// Derives the rotated path by appending [`ROTATED_LOG_SUFFIX`].
    pub fn for_active(active: impl Into<PathBuf>) -> Self {
        let active = active.into();
        let mut rotated = active.clone().into_os_string();
        rotated.push(ROTATED_LOG_SUFFIX);
        Self {
            active,
            rotated: PathBuf::from(rotated),
        }
    }

    /// Both paths, oldest generation first.
    pub fn oldest_first(&self) -> [&Path; 2] {
        [&self.rotated, &self.active]
    }
}

/// VM enumeration and endpoint resolution.
pub trait HostInspector: Send + Sync {
    /// Returns the serial endpoint of the instance, or `None` if it has none.
    fn resolve_console_endpoint(&self, instance_id: &str) -> Option<EndpointName>;

    /// Lists instances currently running on this host.
    fn list_running_instances(&self) -> io::Result<Vec<InstanceId>>;
}

/// Filesystem layout of instances.
pub trait InstancePaths: Send + Sync {
    /// Returns the console log paths of the instance.
    fn console_log_paths(&self, instance_id: &str) -> ConsoleLogPaths;

    /// Returns whether the instance directory exists on disk.
    fn instance_dir_exists(&self, instance_id: &str) -> bool;
}

/// Returns whether `instance_id` is usable as a single path component.
pub fn is_valid_instance_id(instance_id: &str) -> bool {
    !instance_id.is_empty()
        && instance_id != "."
        && instance_id != ".."
        && !instance_id.contains(['/', '\\', '\0'])
}
