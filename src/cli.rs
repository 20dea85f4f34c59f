//! Thin CLI surface for the orchestrator core.
//!
//! The terminal UI proper is an external collaborator (SPEC_FULL §1); this
//! binary exists only to exercise the coordination substrate — load a plan,
//! run the scheduling loop until shutdown, or inspect current state. Styled
//! on the teacher's `clap::Parser` derive (`Cli` + `Commands` enum, one
//! struct variant per subcommand) (`examples/divmain-janus/src/cli.rs`).

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use owo_colors::OwoColorize;
use parking_lot::RwLock;

use crate::config::Config;
use crate::config::watcher::ConfigWatcher;
use crate::events::{EventBus, LogLevel, OrchEvent};
use crate::orchestrator::Orchestrator;
use crate::shutdown;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Local agent orchestrator: schedules coding-agent subprocesses against a ticket plan")]
#[command(version)]
pub struct Cli {
    /// Project root containing the plan file and config (default: current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the plan and run the scheduling loop until interrupted
    Run,

    /// Print a one-shot ticket status summary
    Status,

    /// Print the effective layered configuration as JSON
    Config,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

impl Cli {
    pub async fn run(self) -> crate::Result<ExitCode> {
        let root = self
            .root
            .unwrap_or_else(|| std::env::current_dir().expect("current directory must be readable"));

        match self.command {
            Commands::Run => run_session(&root).await,
            Commands::Status => print_status(&root),
            Commands::Config => print_config(&root),
            Commands::Completions { shell } => {
                generate_completions(shell);
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "orch", &mut io::stdout());
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Print every `log:entry` event to stderr, colored by level, as they are
/// published — the minimal "UI" this binary provides over the bus.
fn install_log_printer(bus: &EventBus) {
    bus.subscribe("log:entry", |event| {
        if let OrchEvent::LogEntry { level, message, .. } = event {
            match level {
                LogLevel::Debug => eprintln!("{}", message.dimmed()),
                LogLevel::Info => eprintln!("{}", message),
                LogLevel::Warn => eprintln!("{}", message.yellow()),
                LogLevel::Error => eprintln!("{}", message.red().bold()),
            }
        }
    });
}

async fn run_session(root: &PathBuf) -> crate::Result<ExitCode> {
    let (config, issues) = Config::load_with_details(root, &std::env::vars().collect())?;
    init_tracing(&config.log_level);

    let event_bus = Arc::new(EventBus::new());
    install_log_printer(&event_bus);
    for issue in &issues {
        event_bus.publish(OrchEvent::warn(format!(
            "config override from {} ignored: {}",
            issue.source, issue.detail
        )));
    }

    let watcher = ConfigWatcher::start(root, config, Arc::clone(&event_bus))?;
    let config_handle: Arc<RwLock<Config>> = watcher.handle();

    let orchestrator = Orchestrator::new(root.clone(), Arc::clone(&config_handle), Arc::clone(&event_bus));
    orchestrator.start()?;

    shutdown::wait_for_signal().await;

    let plan_path = root.join(&config_handle.read().plan_file);
    let tickets = crate::plan::PlanStore::new(plan_path, Arc::clone(&event_bus))
        .load()
        .map(|s| s.tickets)
        .unwrap_or_default();
    let summary = shutdown::shutdown(&orchestrator, &event_bus, &tickets).await;

    Ok(if summary.exit_code() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_status(root: &PathBuf) -> crate::Result<ExitCode> {
    let config = Config::load(root)?;
    let plan_path = root.join(&config.plan_file);
    let event_bus = Arc::new(EventBus::new());
    let store = crate::plan::PlanStore::new(plan_path, event_bus);
    let snapshot = store.load()?;

    println!("{} tickets across {} epics", snapshot.tickets.len(), snapshot.epics.len());
    for ticket in &snapshot.tickets {
        println!(
            "  {:<8} {:<12} {:<5} {}",
            ticket.id, ticket.status, ticket.priority, ticket.title
        );
    }

    Ok(ExitCode::SUCCESS)
}

fn print_config(root: &PathBuf) -> crate::Result<ExitCode> {
    let config = Config::load(root)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}
