//! CLI entrypoint and subcommand orchestration.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};
use proto::GatewayId;
use store::GatewayRecord;

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use gateway::{AmqpConnector, BrokerManager, StatusLogicFactory};
#[cfg(not(test))]
use store::SqliteDirectory;
#[cfg(not(test))]
use tokio_util::sync::CancellationToken;
#[cfg(not(test))]
use tracing::{error, info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for the iot-cloud service.
#[derive(Parser)]
#[command(name = "iot-cloud")]
#[command(about = "IoT cloud gateway session supervisor", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.iot-cloud/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands available in the application.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the gateway supervisor (default when no subcommand is given)
    Start,

    /// Manage the gateway registry
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },

    /// Print the resolved configuration (password masked)
    Config,
}

/// `gateway` sub-subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum GatewayCommands {
    /// Register a gateway so its messages are processed
    Add {
        /// Gateway id as used in its queue names (`<id>.in` / `<id>.out`)
        id: String,

        /// Human readable name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List registered gateways
    List,
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Start => "start",
            Commands::Gateway { .. } => "gateway",
            Commands::Config => "config",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Start);

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&cli.log_level, cli.debug);

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = command.label(),
            log_level = %cli.log_level,
            "========== iot-cloud session start =========="
        );
    }

    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });

    match command {
        Commands::Start => cmd_start(config).await,
        Commands::Gateway { command } => match command {
            GatewayCommands::Add { id, name } => cmd_gateway_add(config, id, name).await,
            GatewayCommands::List => cmd_gateway_list(config).await,
        },
        Commands::Config => cmd_config(&config),
    }
}

/// Console layer filtered by `RUST_LOG` or `--log-level`; with `--debug`
/// also a daily-rolling debug file under `~/.iot-cloud/logs/`.
#[cfg(not(test))]
fn init_tracing(
    log_level: &str,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if !debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = std::path::PathBuf::from(home)
        .join(".iot-cloud")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_target(false).with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug,lapin=info,sqlx=info"));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

#[cfg(not(test))]
/// Runs the supervisor until SIGINT/SIGTERM or until the broker drops the
/// event subscription.
async fn cmd_start(config: Config) -> anyhow::Result<()> {
    info!(server_id = %config.server.id, "Starting iot-cloud supervisor");

    let pid_file = daemon::PidFile::new(daemon::PidFile::default_path());
    if let Some(pid) = pid_file.running_instance().await? {
        anyhow::bail!("iot-cloud is already running (pid {pid})");
    }

    let directory = Arc::new(SqliteDirectory::open(&config.database.url).await?);
    let manager = Arc::new(BrokerManager::new(
        config.broker_settings(),
        Arc::new(AmqpConnector),
        directory,
        Arc::new(StatusLogicFactory),
        config.session_config(),
    ));

    manager.open().await?;
    if let Err(e) = manager.init_event_monitor().await {
        let _ = manager.shutdown().await;
        return Err(e.into());
    }

    pid_file.write().await?;
    info!(server_id = %manager.server_id(), "Supervisor running");

    let cancel = CancellationToken::new();
    let mut event_loop = tokio::spawn({
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        async move { manager.run_event_loop(cancel).await }
    });

    let finished = tokio::select! {
        result = &mut event_loop => Some(result),
        _ = daemon::wait_for_shutdown() => None,
    };
    let loop_result = match finished {
        Some(result) => result,
        None => {
            info!("Shutdown signal received");
            cancel.cancel();
            event_loop.await
        }
    };
    match loop_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Event loop failed: {e}"),
        Err(e) => error!("Event loop task failed: {e}"),
    }

    let shutdown = manager.shutdown().await;
    pid_file.remove().await;
    shutdown?;
    info!("iot-cloud stopped");
    Ok(())
}

#[cfg(not(test))]
async fn cmd_gateway_add(config: Config, id: String, name: Option<String>) -> anyhow::Result<()> {
    let gateway = parse_gateway_id(&id)?;
    let directory = SqliteDirectory::open(&config.database.url).await?;
    directory
        .register_gateway(&gateway, name.as_deref())
        .await?;
    println!("Registered gateway {gateway}");
    Ok(())
}

#[cfg(not(test))]
async fn cmd_gateway_list(config: Config) -> anyhow::Result<()> {
    let directory = SqliteDirectory::open(&config.database.url).await?;
    let gateways = directory.list_gateways().await?;
    if gateways.is_empty() {
        println!("No gateways registered.");
        return Ok(());
    }
    for gateway in &gateways {
        println!("{}", format_gateway_row(gateway));
    }
    Ok(())
}

#[cfg(not(test))]
fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_display_toml()?);
    Ok(())
}

/// Gateway ids become queue name prefixes, so they cannot contain `.`.
fn parse_gateway_id(raw: &str) -> anyhow::Result<GatewayId> {
    let id = raw.trim();
    if id.is_empty() || id.contains('.') {
        anyhow::bail!("invalid gateway id {id:?}: must be non-empty and contain no '.'");
    }
    Ok(GatewayId::from(id))
}

/// One aligned line of `gateway list` output.
fn format_gateway_row(gateway: &GatewayRecord) -> String {
    format!(
        "{:<24} {:<4} {:<24} {}",
        gateway.gateway_id.as_str(),
        gateway.status.as_str(),
        gateway.name.as_deref().unwrap_or("-"),
        gateway.updated_at.format("%Y-%m-%d %H:%M:%S")
    )
}
