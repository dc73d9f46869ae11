//! Command-line interface for panelwire alarm panels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use panelwire_binding::{AlarmCommand, AlarmPanel, AppConfig, ChannelUpdate, SessionManager};
use panelwire_commands::Connection;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Status refresh used by `watch` when none is configured, in minutes.
const WATCH_REFRESH_MINUTES: u64 = 5;

/// Control a polled alarm panel service.
#[derive(Parser, Debug)]
#[command(name = "panelwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print channel updates as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Read the alarm state.
    Status,
    /// Arm the alarm.
    Arm {
        /// Arming mode.
        #[arg(value_enum)]
        mode: ArmMode,
    },
    /// Disarm the alarm.
    Disarm,
    /// Read installation details.
    Installation,
    /// Print state changes until interrupted.
    Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ArmMode {
    All,
    Night,
    Day,
    Perimeter,
}

impl ArmMode {
    fn command(self) -> AlarmCommand {
        match self {
            ArmMode::All => AlarmCommand::ArmedAll,
            ArmMode::Night => AlarmCommand::ArmedNight,
            ArmMode::Day => AlarmCommand::ArmedDay,
            ArmMode::Perimeter => AlarmCommand::ArmedPerimeter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    if matches!(args.command, Command::Watch) && config.alarm.refresh == 0 {
        config.alarm.refresh = WATCH_REFRESH_MINUTES;
    }

    let connection = Connection::http(&config.connection).context("creating HTTP transport")?;
    let session = SessionManager::new(config.session.clone());
    session.attach(&connection);
    let panel = AlarmPanel::new(config.alarm.clone());
    panel.attach(&connection);

    let result = match args.command {
        Command::Status => run_once(&connection, &panel, AlarmCommand::Status, args.json).await,
        Command::Arm { mode } => run_once(&connection, &panel, mode.command(), args.json).await,
        Command::Disarm => run_once(&connection, &panel, AlarmCommand::Disarmed, args.json).await,
        Command::Installation => {
            run_once(&connection, &panel, AlarmCommand::Installation, args.json).await
        }
        Command::Watch => watch(&connection, &panel, &config, args.json).await,
    };

    if let Err(e) = session.logout().await {
        warn!(error = %e, "Logout failed");
    }
    panel.detach();
    session.detach();
    connection.close();

    result
}

fn init_tracing(verbose: bool) {
    let json_logging = std::env::var("PANELWIRE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "warn,panelwire={level},panelwire_commands={level},panelwire_binding={level}"
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_once(
    connection: &Arc<Connection>,
    panel: &Arc<AlarmPanel>,
    command: AlarmCommand,
    json: bool,
) -> Result<()> {
    let mut updates = panel.subscribe();
    let response = connection
        .post(command.as_command())
        .await
        .with_context(|| format!("{} failed", command.as_command().name()))?;

    while let Ok(update) = updates.try_recv() {
        print_update(&update, json);
    }
    if !response.success() {
        let message = response.message().unwrap_or_default();
        anyhow::bail!("service answered {}: {}", response.result()?, message);
    }
    Ok(())
}

async fn watch(
    connection: &Arc<Connection>,
    panel: &Arc<AlarmPanel>,
    config: &AppConfig,
    json: bool,
) -> Result<()> {
    let mut updates = panel.subscribe();
    connection.open(&config.connection);
    connection.schedule(AlarmCommand::Status.as_command())?;
    info!(refresh_minutes = config.alarm.refresh, "Watching alarm state");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => print_update(&update, json),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped channel updates"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

fn print_update(update: &ChannelUpdate, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "channel": update.channel.as_str(),
                "value": update.value,
            })
        );
    } else {
        println!("{:<18} {}", update.channel.as_str(), update.value);
    }
}
