//! End-to-end integration tests for serialcon.
//!
//! These tests verify complete flows work correctly:
//! - Console traffic between a VM endpoint and a TCP client
//! - Console transcript capture
//! - Daemon startup, control requests and shutdown

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serialcon::config::Config;
use serialcon::ipc::IpcClient;
use serialcon::network::{RangePortAllocator, TcpBridgeFactory};
use serialcon::orchestrator::{ConsoleDaemon, DaemonState};
use serialcon::session::{ConsoleServices, PumpSettings, SessionRegistry, SessionSettings};
use serialcon::FsHost;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::time::{sleep, timeout};

const STEP: Duration = Duration::from_secs(5);

/// Create a test configuration with a temporary directory.
fn create_test_config(remote: bool, ports: &str) -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.socket_path = Some(temp_dir.path().join("control.sock"));
    config.host.instances_dir = temp_dir.path().join("instances");
    config.host.endpoint_dir = temp_dir.path().join("endpoints");
    config.console.enabled = remote;
    config.console.port_range = ports.to_string();
    config.console.endpoint_connect_timeout_secs = 2;
    (config, temp_dir)
}

/// Pretend to be a running VM: instance directory plus a listening serial endpoint.
fn add_instance(config: &Config, instance_id: &str) -> UnixListener {
    std::fs::create_dir_all(config.host.instances_dir.join(instance_id)).unwrap();
    std::fs::create_dir_all(&config.host.endpoint_dir).unwrap();
    UnixListener::bind(config.host.endpoint_dir.join(format!("{}.sock", instance_id))).unwrap()
}

fn create_registry(config: &Config, first_port: u16) -> SessionRegistry {
    let host = Arc::new(FsHost::from_config(&config.host));
    let services = ConsoleServices {
        host: host.clone(),
        paths: host,
        ports: Arc::new(RangePortAllocator::new(first_port, first_port + 99)),
        bridges: Arc::new(TcpBridgeFactory),
    };
    let settings = SessionSettings {
        remote_enabled: config.console.enabled,
        proxy_address: "127.0.0.1".to_string(),
        pump: PumpSettings {
            max_log_size: 1024,
            connect_timeout: Duration::from_secs(2),
        },
    };
    SessionRegistry::new(services, settings)
}

async fn read_exact_within(stream: &mut (impl AsyncReadExt + Unpin), len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(STEP, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Polls the console log until it holds `expected`.
async fn wait_for_log(path: &Path, expected: &[u8]) {
    timeout(STEP, async {
        loop {
            if std::fs::read(path).map(|d| d == expected).unwrap_or(false) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// Console Traffic Tests
// =============================================================================

#[tokio::test]
async fn test_remote_console_round_trip() {
    let (config, _temp_dir) = create_test_config(true, "44100:44199");
    let endpoint = add_instance(&config, "vm1");
    let registry = create_registry(&config, 44100);

    registry.start("vm1").await.unwrap();
    let (mut vm, _) = timeout(STEP, endpoint.accept()).await.unwrap().unwrap();

    let info = registry.query_console_info("vm1").await.unwrap();
    assert_eq!(info.host, "127.0.0.1");
    let mut client = TcpStream::connect((info.host.as_str(), info.port))
        .await
        .unwrap();

    // Keystrokes only reach the VM once the client is attached, so seeing
    // them proves the bridge is serving this client.
    client.write_all(b"root\n").await.unwrap();
    assert_eq!(read_exact_within(&mut vm, 5).await, b"root\n");

    vm.write_all(b"login:").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 6).await, b"login:");

    let log = config.host.instances_dir.join("vm1").join("console.log");
    wait_for_log(&log, b"login:").await;
    assert_eq!(registry.read_console_output("vm1").await.unwrap(), b"login:");

    registry.stop("vm1").await;
    assert!(!registry.contains("vm1").await);

    // Both ends are released.
    let mut buf = [0u8; 1];
    assert_eq!(timeout(STEP, vm.read(&mut buf)).await.unwrap().unwrap(), 0);
    assert!(TcpStream::connect((info.host.as_str(), info.port)).await.is_err());
}

#[tokio::test]
async fn test_local_only_console_captures_output() {
    let (config, _temp_dir) = create_test_config(false, "44200:44299");
    let endpoint = add_instance(&config, "vm1");
    let registry = create_registry(&config, 44200);

    registry.start("vm1").await.unwrap();
    let (mut vm, _) = timeout(STEP, endpoint.accept()).await.unwrap().unwrap();

    assert!(registry.query_console_info("vm1").await.is_err());

    vm.write_all(b"Booting kernel\n").await.unwrap();
    let log = config.host.instances_dir.join("vm1").join("console.log");
    wait_for_log(&log, b"Booting kernel\n").await;

    registry.stop_all().await;
    assert_eq!(registry.count().await, 0);

    // The transcript outlives the session.
    assert_eq!(
        registry.read_console_output("vm1").await.unwrap(),
        b"Booting kernel\n"
    );
}

#[tokio::test]
async fn test_transcript_spans_rotation() {
    let (config, _temp_dir) = create_test_config(false, "44300:44399");
    let endpoint = add_instance(&config, "vm1");
    let registry = create_registry(&config, 44300);

    registry.start("vm1").await.unwrap();
    let (mut vm, _) = timeout(STEP, endpoint.accept()).await.unwrap().unwrap();

    let log = config.host.instances_dir.join("vm1").join("console.log");
    let first = vec![b'a'; 1024];
    vm.write_all(&first).await.unwrap();
    wait_for_log(&log, &first).await;

    // The next write finds the log full and rotates it first.
    vm.write_all(b"tail").await.unwrap();
    wait_for_log(&log, b"tail").await;

    let mut expected = first.clone();
    expected.extend_from_slice(b"tail");
    assert_eq!(registry.read_console_output("vm1").await.unwrap(), expected);

    registry.stop_all().await;
}

#[tokio::test]
async fn test_missing_endpoint_fails_start() {
    let (config, _temp_dir) = create_test_config(false, "44400:44499");
    let registry = create_registry(&config, 44400);

    let err = registry.start("vm-missing").await.unwrap_err();
    assert!(err.to_string().contains("vm-missing"));
    assert!(!registry.contains("vm-missing").await);
}

// =============================================================================
// Daemon Tests
// =============================================================================

#[tokio::test]
async fn test_daemon_state_starts_stopped() {
    let (config, _temp_dir) = create_test_config(false, "44500:44599");

    let daemon = ConsoleDaemon::new(config).unwrap();

    assert_eq!(daemon.state().await, DaemonState::Stopped);
}

#[tokio::test]
async fn test_daemon_stop_when_already_stopped() {
    let (config, _temp_dir) = create_test_config(false, "44500:44599");

    let daemon = ConsoleDaemon::new(config).unwrap();

    // Stop should succeed even when already stopped
    assert!(daemon.stop().await.is_ok());
}

#[tokio::test]
async fn test_daemon_serves_consoles_over_control_socket() {
    let (config, _temp_dir) = create_test_config(true, "44600:44699");
    let endpoint = add_instance(&config, "vm1");
    let socket_path = config.daemon.control_socket();

    let mut daemon = ConsoleDaemon::new(config.clone()).unwrap();
    daemon.start().await.unwrap();
    assert_eq!(daemon.state().await, DaemonState::Running);

    // Running instances are picked up on startup.
    let (mut vm, _) = timeout(STEP, endpoint.accept()).await.unwrap().unwrap();

    let mut client = IpcClient::connect(&socket_path).await.unwrap();
    assert!(client.ping().await.unwrap());

    let consoles = client.list_consoles().await.unwrap();
    assert_eq!(consoles.len(), 1);
    assert_eq!(consoles[0].instance_id, "vm1");
    assert!(consoles[0].alive);

    let info = client.console_info("vm1").await.unwrap();
    assert!((44600..=44699).contains(&info.port));

    vm.write_all(b"login:").await.unwrap();
    let log = config.host.instances_dir.join("vm1").join("console.log");
    wait_for_log(&log, b"login:").await;
    assert_eq!(client.console_output("vm1").await.unwrap(), b"login:");

    client.stop_console("vm1").await.unwrap();
    let err = client.console_info("vm1").await.unwrap_err();
    assert!(err.to_string().contains("unavailable"));

    // Start again through the control socket.
    client.start_console("vm1").await.unwrap();
    let (_vm, _) = timeout(STEP, endpoint.accept()).await.unwrap().unwrap();
    assert!(client.console_info("vm1").await.is_ok());

    client.shutdown().await.unwrap();
    timeout(STEP, daemon.shutdown_token().cancelled())
        .await
        .unwrap();

    daemon.stop().await.unwrap();
    assert_eq!(daemon.state().await, DaemonState::Stopped);
    assert!(!socket_path.exists());
    assert!(UnixStream::connect(&socket_path).await.is_err());
}

#[tokio::test]
async fn test_daemon_rejects_unknown_instance() {
    let (config, _temp_dir) = create_test_config(false, "44700:44799");
    let socket_path = config.daemon.control_socket();

    let mut daemon = ConsoleDaemon::new(config).unwrap();
    daemon.start().await.unwrap();

    let mut client = IpcClient::connect(&socket_path).await.unwrap();
    let err = client.start_console("vm-unknown").await.unwrap_err();
    assert!(err.to_string().contains("vm-unknown"));
    assert!(client.list_consoles().await.unwrap().is_empty());

    daemon.stop().await.unwrap();
}
