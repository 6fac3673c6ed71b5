mod bot;
mod console;

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    clap::{Parser, Subcommand},
    neuron_common::{
        CapabilitySet,
        events::{DispatchEvent, EventBus, EventHandler, EventKind},
    },
    neuron_config::NeuronConfig,
    neuron_metrics::{MetricsRecorderConfig, init_metrics},
    tokio::sync::mpsc,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::console::{ConsoleIdentity, ConsoleOutbound, LineParser, pump_stdin};

#[derive(Parser)]
#[command(name = "neuron", about = "neuron - chat command and dialog dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/neuron/).
    #[arg(long, global = true, env = "NEURON_CONFIG")]
    config: Option<PathBuf>,

    /// Channel id for console lines without a `#room` prefix.
    #[arg(long, default_value = "console")]
    channel: String,

    /// Author id for console lines without a `name:` prefix.
    #[arg(long, default_value = "you", env = "USER")]
    user: String,

    /// Capability granted to every console author (repeatable).
    #[arg(long = "grant", value_name = "CAPABILITY")]
    grants: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo bot on stdin/stdout (default).
    Console,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Validate the configuration and list diagnostics.
    Check,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Console replies go to stdout; keep logs on stderr.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<NeuronConfig> {
    match &cli.config {
        Some(path) => Ok(neuron_config::load_config(path)?),
        None => Ok(neuron_config::discover_and_load()),
    }
}

/// Logs every dispatch event at info level.
struct EventLogger;

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    fn events(&self) -> &[EventKind] {
        &[
            EventKind::MessageRateLimited,
            EventKind::CommandExecuted,
            EventKind::CommandDenied,
            EventKind::CommandFailed,
            EventKind::MiddlewareFailed,
            EventKind::DialogCompleted,
            EventKind::DialogCancelled,
        ]
    }

    async fn handle(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        info!(event = %serde_json::to_string(event)?, "dispatch event");
        Ok(())
    }
}

async fn run_console(cli: &Cli, config: NeuronConfig) -> anyhow::Result<()> {
    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: vec![("service".into(), "neuron".into())],
    })?;

    let mut events = EventBus::new();
    events.register(Arc::new(EventLogger));
    let grants: CapabilitySet = cli.grants.iter().cloned().collect();
    let dispatcher = bot::build_bot(config, Arc::new(ConsoleOutbound::new()), grants, events)?;

    let parser = LineParser::new(ConsoleIdentity {
        channel_id: cli.channel.clone(),
        author_id: cli.user.clone(),
    });
    let (tx, rx) = mpsc::channel(64);
    let input = async {
        tokio::select! {
            result = pump_stdin(parser, tx) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                Ok(())
            },
        }
    };

    let (input, ()) = tokio::join!(input, dispatcher.serve(rx));
    if let Err(e) = input {
        warn!(error = %e, "console input failed");
    }

    for (name, value) in dispatcher.stats_snapshot() {
        info!(%name, value, "dispatch stats");
    }
    let rendered = metrics.render();
    if !rendered.is_empty() {
        eprintln!("{rendered}");
    }
    Ok(())
}

fn handle_config(action: ConfigAction, cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    match action {
        ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
        ConfigAction::Check => {
            let report = neuron_config::validate(&config);
            if report.diagnostics.is_empty() {
                println!("config ok");
            }
            for diag in &report.diagnostics {
                println!("[{}] {}: {}", diag.severity, diag.path, diag.message);
            }
            if report.has_errors() {
                anyhow::bail!("config has errors");
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mut cli = Cli::parse();

    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "neuron starting");

    match cli.command.take() {
        None | Some(Commands::Console) => {
            let config = load_config(&cli)?;
            run_console(&cli, config).await
        },
        Some(Commands::Config { action }) => handle_config(action, &cli),
    }
}
