//! serialcon
//!
//! Serial console redirection daemon and its control CLI.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serialcon::config::Config;
use serialcon::ipc::{IpcClient, IpcResponse};
use serialcon::orchestrator::ConsoleDaemon;
use serialcon::session::SessionSummary;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Timeout for reaching the control socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// serialcon - per-VM serial console redirection.
#[derive(Parser, Debug)]
#[command(name = "serialcon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the console daemon in the foreground
    Serve,

    /// Start the console session of an instance
    Start {
        /// Instance identifier
        instance_id: String,
    },

    /// Stop the console session of an instance
    Stop {
        /// Instance identifier
        instance_id: String,
    },

    /// Show where the remote console of an instance can be reached
    Info {
        /// Instance identifier
        instance_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the console transcript of an instance
    Output {
        /// Instance identifier
        instance_id: String,

        /// Write the transcript to a file instead of stdout
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List console sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show daemon status
    Status,

    /// Ask the running daemon to stop
    Shutdown {
        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = init_tracing(&cli, &config)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Start { instance_id } => {
            let mut client = connect(&config).await?;
            // Starting may wait for the serial endpoint to appear.
            client.set_timeout(config.console.endpoint_connect_timeout() + CONNECT_TIMEOUT);
            client
                .start_console(&instance_id)
                .await
                .with_context(|| format!("Failed to start console for {}", instance_id))?;
            println!("Console session for {} is running", instance_id);
        }
        Commands::Stop { instance_id } => {
            let mut client = connect(&config).await?;
            client
                .stop_console(&instance_id)
                .await
                .with_context(|| format!("Failed to stop console for {}", instance_id))?;
            println!("Console session for {} stopped", instance_id);
        }
        Commands::Info { instance_id, json } => {
            let mut client = connect(&config).await?;
            let info = client.console_info(&instance_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}:{}", info.host, info.port);
            }
        }
        Commands::Output {
            instance_id,
            output,
        } => {
            let mut client = connect(&config).await?;
            let data = client
                .console_output(&instance_id)
                .await
                .with_context(|| format!("Failed to read console output of {}", instance_id))?;
            match output {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::List { json } => {
            let mut client = connect(&config).await?;
            let consoles = client.list_consoles().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&consoles)?);
            } else {
                print_consoles_table(&consoles);
            }
        }
        Commands::Status => {
            let mut client = connect(&config).await?;
            match client.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    console_count,
                    remote_enabled,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopped" }
                    );
                    println!("  Uptime:   {}", format_duration(uptime_secs));
                    println!("  Consoles: {}", console_count);
                    println!(
                        "  Remote:   {}",
                        if remote_enabled { "enabled" } else { "disabled" }
                    );
                }
                IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
                _ => anyhow::bail!("Unexpected response from daemon"),
            }
        }
        Commands::Shutdown { timeout } => shutdown_daemon(&config, timeout).await?,
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// Logs go to stderr; when `log_dir` is configured they are also written to a
/// daily rolling file. The returned guard flushes that file on drop.
fn init_tracing(cli: &Cli, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "serialcon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

/// Runs the daemon until a signal or a Shutdown request arrives.
async fn serve(config: Config) -> anyhow::Result<()> {
    let socket_path = config.daemon.control_socket();

    // Check for an existing daemon before touching the socket
    if let Ok(mut client) = IpcClient::connect_with_timeout(&socket_path, CONNECT_TIMEOUT).await {
        if client.ping().await.unwrap_or(false) {
            eprintln!("Error: Daemon already running");
            eprintln!();
            eprintln!("To stop the existing daemon, run:");
            eprintln!("  serialcon shutdown");
            std::process::exit(1);
        }
    }

    let mut daemon = ConsoleDaemon::new(config)?;
    daemon.start().await?;
    tracing::info!(socket = %daemon.socket_path().display(), "serialcon daemon running");

    let shutdown = daemon.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested over control socket");
        }
    }

    daemon.stop().await?;
    tracing::info!("serialcon daemon stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let mut client = IpcClient::connect_with_timeout(&config.daemon.control_socket(), CONNECT_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot connect to daemon: {}", e))?;
    client.set_timeout(Duration::from_secs(30));
    Ok(client)
}

/// Sends Shutdown and waits for the control socket to disappear.
async fn shutdown_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.daemon.control_socket();
    let mut client = IpcClient::connect_with_timeout(&socket_path, CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;

    match client.shutdown().await? {
        IpcResponse::ShuttingDown => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            println!("Daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("Daemon did not exit within {} seconds", timeout_secs)
}

fn print_consoles_table(consoles: &[SessionSummary]) {
    if consoles.is_empty() {
        println!("No console sessions.");
        return;
    }

    let id_width = consoles
        .iter()
        .map(|c| c.instance_id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_width$}  {:<6}  {}",
        "INSTANCE",
        "STATE",
        "REMOTE",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 30));

    for console in consoles {
        let state = if console.alive { "alive" } else { "dead" };
        let remote = console
            .console
            .as_ref()
            .map(|info| format!("{}:{}", info.host, info.port))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:<6}  {}",
            console.instance_id,
            state,
            remote,
            id_width = id_width
        );
    }
}

/// Format a duration in seconds as a human-readable string.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
