//! Filesystem-backed host collaborators.
//!
//! Layout:
//! - `<endpoint_dir>/<instance>.sock`: serial endpoint created by the hypervisor
//! - `<instances_dir>/<instance>/`: instance directory
//! - `<instances_dir>/<instance>/console.log[.1]`: console transcript

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{is_valid_instance_id, ConsoleLogPaths, EndpointName, HostInspector, InstanceId, InstancePaths};
use crate::config::HostConfig;

/// Extension of serial endpoint sockets in the endpoint directory.
const ENDPOINT_EXTENSION: &str = "sock";

/// Console log file name inside an instance directory.
const CONSOLE_LOG_NAME: &str = "console.log";

/// Host collaborators reading the local filesystem.
#[derive(Debug, Clone)]
pub struct FsHost {
    instances_dir: PathBuf,
    endpoint_dir: PathBuf,
}

impl FsHost {
    /// Creates a host rooted at the given directories.
    pub fn new(instances_dir: impl Into<PathBuf>, endpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            instances_dir: instances_dir.into(),
            endpoint_dir: endpoint_dir.into(),
        }
    }

    /// Creates a host from the `[host]` section.
    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(&config.instances_dir, &config.endpoint_dir)
    }

    /// Directory of the given instance.
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir.join(instance_id)
    }

    /// Path where the hypervisor exposes the instance's serial port.
    pub fn endpoint_path(&self, instance_id: &str) -> PathBuf {
        self.endpoint_dir
            .join(format!("{}.{}", instance_id, ENDPOINT_EXTENSION))
    }
}

impl HostInspector for FsHost {
    fn resolve_console_endpoint(&self, instance_id: &str) -> Option<EndpointName> {
        if !is_valid_instance_id(instance_id) {
            return None;
        }
        let path = self.endpoint_path(instance_id);
        fs::symlink_metadata(&path).ok().map(|_| path)
    }

    fn list_running_instances(&self) -> io::Result<Vec<InstanceId>> {
        let entries = match fs::read_dir(&self.endpoint_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !is_endpoint_socket(&entry.path(), &entry.file_type()?) {
                continue;
            }
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                instances.push(stem.to_string());
            }
        }
        instances.sort();
        Ok(instances)
    }
}

impl InstancePaths for FsHost {
    fn console_log_paths(&self, instance_id: &str) -> ConsoleLogPaths {
        ConsoleLogPaths::for_active(self.instance_dir(instance_id).join(CONSOLE_LOG_NAME))
    }

    fn instance_dir_exists(&self, instance_id: &str) -> bool {
        is_valid_instance_id(instance_id) && self.instance_dir(instance_id).is_dir()
    }
}

#[cfg(unix)]
fn is_endpoint_socket(path: &Path, file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;

    file_type.is_socket() && path.extension().is_some_and(|ext| ext == ENDPOINT_EXTENSION)
}

#[cfg(not(unix))]
fn is_endpoint_socket(path: &Path, _file_type: &fs::FileType) -> bool {
    path.extension().is_some_and(|ext| ext == ENDPOINT_EXTENSION)
}
