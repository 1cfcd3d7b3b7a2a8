//! Control channel between the `serialcon` CLI and the daemon.
//!
//! Requests and responses are single JSON objects terminated by a newline,
//! exchanged over a Unix domain socket.
//!
//! ## Socket Path
//!
//! - Configured: `[daemon] socket_path`
//! - Otherwise: `$XDG_RUNTIME_DIR/serialcon/control.sock`
//! - Fallback: `/tmp/serialcon-$UID/control.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use serialcon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     let info = client.console_info("instance-00000001").await?;
//!     println!("console at {}:{}", info.host, info.port);
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{decode_output, IpcRequest, IpcResponse};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Socket file name inside the runtime directory.
const SOCKET_NAME: &str = "control.sock";

/// Default path of the daemon's control socket.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("serialcon").join(SOCKET_NAME)
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/serialcon-{}", uid)).join(SOCKET_NAME)
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/serialcon-unsupported").join(SOCKET_NAME)
}
