//! Termhub
//!
//! Operator front end for the session registry.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use termhub::config::{default_config_path, Config};
use termhub::session::{CreateOptions, SessionManager, SessionRegistry, Subscription};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Termhub - supervised PTY sessions.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
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
    /// Start a managed shell and attach this terminal to it
    Run {
        /// Working directory for the shell (defaults to home)
        #[arg(long)]
        cwd: Option<String>,

        /// Shell to run instead of the resolved one
        #[arg(long)]
        shell: Option<String>,

        /// Arguments passed to --shell
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let attached = matches!(cli.command, Commands::Run { .. });
    let log_guard = init_tracing(&config, cli.verbose, attached)?;
    tracing::debug!("Using config file: {:?}", config_path);

    let code = match cli.command {
        Commands::Run { cwd, shell, args } => run_attached(&config, cwd, shell, args).await?,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            0
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
            0
        }
    };

    drop(log_guard);
    std::process::exit(code);
}

/// Initializes tracing. An attached terminal is in raw mode, so logs go to a
/// file in the data directory instead of stderr.
fn init_tracing(config: &Config, verbose: bool, to_file: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.daemon.log_level.as_str() };
    let filter = EnvFilter::new(level);

    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let dir = &config.daemon.data_dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "termhub.log"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Puts the terminal in raw mode for as long as it lives.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Runs one session attached to this terminal and returns its exit code.
async fn run_attached(
    config: &Config,
    cwd: Option<String>,
    shell: Option<String>,
    args: Vec<String>,
) -> Result<i32> {
    if shell.is_none() && !args.is_empty() {
        anyhow::bail!("Shell arguments require --shell");
    }

    let registry = SessionRegistry::new(config);
    let (cols, rows) =
        crossterm::terminal::size().unwrap_or((config.session.cols, config.session.rows));

    let info = registry
        .create(CreateOptions {
            cwd,
            shell,
            args: (!args.is_empty()).then_some(args),
            cols: Some(cols),
            rows: Some(rows),
            env: Vec::new(),
        })
        .await
        .context("Failed to create session")?;

    tracing::info!(session_id = %info.id, cwd = %info.cwd.display(), "Attached to session");
    let health = registry.health();
    tracing::info!(
        active = health.active_session_count,
        max = health.max_sessions,
        utilization = health.utilization,
        "Registry health"
    );

    let _raw = RawModeGuard::enable()?;

    let output = attach_output(&registry, &info.id, write_stdout);

    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let id = info.id.clone();
    let exit = registry.on_exit(move |session_id, status| {
        if session_id == id {
            let _ = exit_tx.send(status.exit_code);
        }
    });

    spawn_input_thread(registry.clone(), info.id.clone())?;

    #[cfg(unix)]
    {
        let registry = registry.clone();
        let id = info.id.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_resizes(registry, id).await {
                tracing::warn!(error = %e, "Resize forwarding stopped");
            }
        });
    }

    let code = tokio::select! {
        status = exit_rx.recv() => status.map(|c| c as i32).unwrap_or(1),
        result = terminate_signal() => {
            result?;
            tracing::info!("Termination signal received, shutting down");
            1
        }
    };

    output.unsubscribe();
    exit.unsubscribe();
    registry.shutdown();
    Ok(code)
}

/// Replays the session's scrollback into `sink` and forwards live output
/// after it.
///
/// The subscription is registered before the snapshot is taken, so output
/// produced in between is never lost.
fn attach_output<F>(registry: &SessionRegistry, session_id: &str, sink: F) -> Subscription
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    let sink = Arc::new(sink);
    let live = Arc::clone(&sink);
    let id = session_id.to_string();
    let subscription = registry.on_data(move |session_id, data| {
        if session_id == id {
            live(data);
        }
    });

    if let Some(scrollback) = registry.take_scrollback_for_reconnect(session_id) {
        sink(&scrollback);
    }
    subscription
}

fn write_stdout(data: &[u8]) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(data);
    let _ = stdout.flush();
}

/// Copies stdin into the session until either side closes.
fn spawn_input_thread(registry: SessionRegistry, session_id: String) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !registry.write(&session_id, &buffer[..n]) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "Stdin closed");
                        break;
                    }
                }
            }
        })
        .context("Failed to start stdin thread")?;
    Ok(())
}

#[cfg(unix)]
async fn forward_resizes(registry: SessionRegistry, session_id: String) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch =
        signal(SignalKind::window_change()).context("Failed to register SIGWINCH handler")?;
    while winch.recv().await.is_some() {
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            if !registry.resize(&session_id, cols, rows, true) {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sighup.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
