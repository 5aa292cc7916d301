//! tmux-orchestrator - command line entry point
//!
//! Each invocation is short-lived: it loads configuration, performs one
//! operation against the shared state directory and exits.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tmux_orchestrator::monitor::DEFAULT_CAPTURE_LINES;
use tmux_orchestrator::{Config, Error, Messenger, Monitor, Scheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tmux-orchestrator")]
#[command(version)]
#[command(about = "Validated, rate-limited deferred reminders and commands for tmux agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule a note to fire after a delay
    Schedule {
        /// Delay in minutes
        #[arg(allow_negative_numbers = true)]
        minutes: i64,
        /// Reminder text
        note: String,
        /// file, log or display
        #[arg(default_value = "file")]
        kind: String,
        /// Also type the note into this session:window when it fires
        #[arg(long)]
        target: Option<String>,
    },
    /// Fire one task now (invoked by queued jobs)
    Fire { id: String },
    /// Fire every due task held by the polling backend
    RunDue,
    /// List scheduled tasks
    List,
    /// Cancel a scheduled task
    Cancel { id: String },
    /// Remove tasks that expired without firing
    ClearExpired,
    /// Type a message into a window and press Enter
    Send { target: String, message: String },
    /// Type a whitelisted command into a window and press Enter
    Command { target: String, command: String },
    /// Drop audit records older than the retention horizon
    SweepLogs,
    /// List sessions and their windows
    Sessions,
    /// Print recent output of a window
    Capture {
        target: String,
        /// Number of lines, capped by MAX_LINES_CAPTURE
        #[arg(long, default_value_t = DEFAULT_CAPTURE_LINES)]
        lines: usize,
    },
    /// Show layout details and recent output of a window
    Window {
        target: String,
        #[arg(long, default_value_t = DEFAULT_CAPTURE_LINES)]
        lines: usize,
    },
    /// Find windows whose name contains a string
    Find { name: String },
    /// Report every window with its recent output
    #[command(alias = "snapshot")]
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tmux_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match runtime.block_on(run(cli.command)) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(wait) = e.retry_after() {
                eprintln!("Retry in {} seconds.", wait.as_secs());
            }
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

async fn run(command: Commands) -> Result<(), Error> {
    let config = Arc::new(Config::load()?);
    tracing::debug!(home = %config.home.display(), backend = config.backend.as_str(), "Loaded configuration");

    match command {
        Commands::Schedule {
            minutes,
            note,
            kind,
            target,
        } => {
            let scheduler = Scheduler::from_config(config);
            let task = scheduler
                .schedule(minutes, &note, &kind, target.as_deref())
                .await?;
            println!("Scheduled {} ({}) for {}", task.id(), task.kind(), task.due_at_human());
            if let Some(job) = task.backend_ref() {
                println!("Job: {}", job);
            }
        }
        Commands::Fire { id } => {
            if !Scheduler::from_config(config).fire(&id).await? {
                println!("No task {} (already fired or cancelled)", id);
            }
        }
        Commands::RunDue => {
            let summary = Scheduler::from_config(config).run_due().await?;
            println!("Fired {} task(s), {} failed", summary.fired, summary.failed);
        }
        Commands::List => {
            let tasks = Scheduler::from_config(config).list().await?;
            if tasks.is_empty() {
                println!("No scheduled tasks");
            }
            for (backend, task) in tasks {
                println!(
                    "{}  {}  {:<7}  {:<4}  {}  {}",
                    task.id(),
                    task.due_at_human(),
                    task.kind().as_str(),
                    backend.as_str(),
                    task.target().unwrap_or("-"),
                    task.note()
                );
            }
        }
        Commands::Cancel { id } => {
            if Scheduler::from_config(config).cancel(&id).await? {
                println!("Cancelled {}", id);
            } else {
                println!("No task {}", id);
            }
        }
        Commands::ClearExpired => {
            let removed = Scheduler::from_config(config).clear_expired().await?;
            println!("Removed {} expired task(s)", removed);
        }
        Commands::Send { target, message } => {
            let target = Messenger::from_config(&config)
                .send_message(&target, &message)
                .await?;
            println!("Sent to {}", target);
        }
        Commands::Command { target, command } => {
            let target = Messenger::from_config(&config)
                .send_command(&target, &command)
                .await?;
            println!("Sent command to {}", target);
        }
        Commands::SweepLogs => {
            let removed = Scheduler::from_config(config).sweep_logs().await?;
            println!("Removed {} audit record(s)", removed);
        }
        Commands::Sessions => {
            let sessions = Monitor::from_config(&config).sessions().await?;
            if sessions.is_empty() {
                println!("No tmux sessions");
            }
            for session in sessions {
                println!(
                    "{}{}",
                    session.name,
                    if session.attached { " (attached)" } else { "" }
                );
                for window in session.windows {
                    println!(
                        "  {}  {}{}",
                        window.target(),
                        window.name,
                        if window.active { " *" } else { "" }
                    );
                }
            }
        }
        Commands::Capture { target, lines } => {
            let content = Monitor::from_config(&config).capture(&target, lines).await?;
            println!("{}", content.trim_end());
        }
        Commands::Window { target, lines } => {
            let details = Monitor::from_config(&config).window(&target, lines).await?;
            println!("Window: {} ({})", details.target, details.info.name);
            println!("Active: {}", details.info.active);
            println!("Panes: {}", details.info.panes);
            println!("Layout: {}", details.info.layout);
            println!("{}", details.content.trim_end());
        }
        Commands::Find { name } => {
            let windows = Monitor::from_config(&config).find_windows(&name).await?;
            if windows.is_empty() {
                println!("No window matching '{}'", name);
            }
            for window in windows {
                println!("{}  {}", window.target(), window.name);
            }
        }
        Commands::Status { json } => {
            let report = Monitor::from_config(&config).status().await?;
            if json {
                let text = serde_json::to_string_pretty(&report)
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                println!("{}", text);
            } else {
                print!("{}", report.render());
            }
        }
    }
    Ok(())
}
