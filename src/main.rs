mod approval;
mod bridge;
mod config;
mod executor;
mod i18n;
mod logging;
mod storage;
mod store_manager;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use approval::{PENDING_PREFIX, RESPONSE_PREFIX};
use bridge::{Bridge, DaemonSettings};
use config::Config;
use i18n::I18n;
use storage::{CommandResponse, PendingApproval, ResponseStatus};
use store_manager::{file_name, Mailbox, MailboxError, MailboxStore};

#[derive(Parser)]
#[command(name = "mailbridge", version)]
#[command(about = "Run chat-submitted commands through a file mailbox, with approval for dangerous ones")]
struct Cli {
    /// Mailbox directory (overrides the config file and MAILBRIDGE_COMM_DIR)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the mailbox and execute commands until interrupted
    Run,
    /// Queue a command for the executor
    Submit {
        /// Command to execute (wrap commands with pipes in quotes)
        #[arg(required = true)]
        command: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        user_name: Option<String>,
        #[arg(long)]
        channel_id: Option<String>,
    },
    /// List commands waiting for approval
    Pending,
    /// Approve a pending command
    Approve {
        /// Pending file name, e.g. pending_20250101_120000_000001.json
        pending: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        user_name: Option<String>,
    },
    /// Reject a pending command
    Reject {
        /// Pending file name, e.g. pending_20250101_120000_000001.json
        pending: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        user_name: Option<String>,
    },
    /// Print undelivered responses and remove them
    Responses {
        /// Leave the response files in place
        #[arg(long)]
        keep: bool,
        /// Deliver only the oldest response
        #[arg(long)]
        one: bool,
    },
    /// Show how many files each mailbox directory holds
    Status,
    /// Remove mailbox files older than the configured age
    Cleanup {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let mut config = Config::new()?;
    if let Some(dir) = cli.base_dir {
        config.mailbox.base_dir = dir;
    }
    let i18n = I18n::new(&config.get_effective_language());

    match cli.command {
        Commands::Run => run(&config, i18n),
        Commands::Submit {
            command,
            user_id,
            user_name,
            channel_id,
        } => {
            let store = open_store(&config)?;
            let user_name = user_name.unwrap_or_else(local_user);
            let user_id = user_id.unwrap_or_else(|| user_name.clone());
            let name = bridge::submit(&store, &command, &user_id, &user_name, channel_id.as_deref())
                .context("failed to queue command")?;
            println!("{}", i18n.t_format("submitted", &[&name]).green());
            if executor::classify(&command).is_dangerous() {
                println!("{}", i18n.t("submit_needs_approval").yellow());
            }
            Ok(())
        }
        Commands::Pending => list_pending(&open_store(&config)?, &i18n),
        Commands::Approve {
            pending,
            user_id,
            user_name,
        } => decide(&config, &i18n, &pending, true, user_id, user_name),
        Commands::Reject {
            pending,
            user_id,
            user_name,
        } => decide(&config, &i18n, &pending, false, user_id, user_name),
        Commands::Responses { keep, one } => {
            let store = open_store(&config)?;
            if one {
                next_response(&store, &i18n, keep)
            } else {
                drain_responses(&store, &i18n, keep)
            }
        }
        Commands::Status => {
            let store = open_store(&config)?;
            let counts = store.counts()?;
            println!(
                "{}",
                i18n.t_format("status_title", &[&store.base_dir().display().to_string()]).bold()
            );
            println!("  {}: {}", i18n.t("status_commands").yellow(), counts.commands.to_string().green());
            println!("  {}: {}", i18n.t("status_responses").yellow(), counts.responses.to_string().green());
            println!("  {}: {}", i18n.t("status_pending").yellow(), counts.pending.to_string().green());
            Ok(())
        }
        Commands::Cleanup { max_age_hours } => {
            let store = open_store(&config)?;
            let max_age = max_age_hours
                .map(config::hours)
                .unwrap_or_else(|| config.mailbox.max_age());
            let removed = store.cleanup(max_age);
            println!("{}", i18n.t_format("cleaned_files", &[&removed.to_string()]));
            Ok(())
        }
    }
}

fn run(config: &Config, i18n: I18n) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let started = i18n.t_format("daemon_started", &[&config.mailbox.base_dir.display().to_string()]);
    let stopped = i18n.t("daemon_stopped");
    let bridge = Arc::new(Bridge::from_config(config, i18n)?);

    println!("{}", started.green().bold());
    bridge::run_daemon(bridge, &DaemonSettings::from_config(config), running)?;
    println!("{}", stopped.yellow());
    Ok(())
}

fn open_store(config: &Config) -> Result<MailboxStore> {
    MailboxStore::new(&config.mailbox.base_dir)
        .with_context(|| format!("cannot open mailbox at {}", config.mailbox.base_dir.display()))
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}

fn decide(
    config: &Config,
    i18n: &I18n,
    pending: &str,
    approval: bool,
    user_id: Option<String>,
    user_name: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    let pending_file = if pending.ends_with(".json") {
        pending.to_string()
    } else {
        format!("{}.json", pending)
    };
    let user_name = user_name.unwrap_or_else(local_user);
    let user_id = user_id.unwrap_or_else(|| user_name.clone());

    match bridge::decide(&store, &pending_file, approval, &user_id, &user_name) {
        Ok(path) => {
            println!("{}", i18n.t_format("signal_written", &[&file_name(&path)]).green());
            Ok(())
        }
        Err(MailboxError::Read { .. }) => {
            println!("{}", i18n.t_format("pending_missing", &[&pending_file]).red());
            Ok(())
        }
        Err(e) => Err(e).context("failed to record decision"),
    }
}

fn list_pending(store: &MailboxStore, i18n: &I18n) -> Result<()> {
    let paths = store.list(Mailbox::Pending, PENDING_PREFIX)?;
    if paths.is_empty() {
        println!("{}", i18n.t("no_pending"));
        return Ok(());
    }

    for path in paths {
        let pending: PendingApproval = match store.read(&path) {
            Ok(p) => p,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable pending file");
                continue;
            }
        };
        let when = store_manager::parse_id(&pending.timestamp)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| pending.timestamp.clone());
        println!("{} {}", file_name(&path).yellow().bold(), when.dimmed());
        println!("  {}", pending.command.cyan());
        println!("  {}", i18n.t_format("requested_by", &[&pending.user_name]).dimmed());
    }
    Ok(())
}

fn drain_responses(store: &MailboxStore, i18n: &I18n, keep: bool) -> Result<()> {
    let paths = store.list(Mailbox::Responses, RESPONSE_PREFIX)?;
    if paths.is_empty() {
        println!("{}", i18n.t("no_responses"));
        return Ok(());
    }

    for path in paths {
        match store.read::<CommandResponse>(&path) {
            Ok(response) => print_response(&path, &response),
            Err(e @ MailboxError::Corrupt { .. }) => {
                warn!(file = %path.display(), error = %e, "deleting corrupt response");
                store.delete(&path);
                continue;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable response");
                continue;
            }
        }
        if !keep {
            store.delete(&path);
        }
    }
    Ok(())
}

fn next_response(store: &MailboxStore, i18n: &I18n, keep: bool) -> Result<()> {
    match store.oldest::<CommandResponse>(Mailbox::Responses, RESPONSE_PREFIX) {
        Ok(Some((path, response))) => {
            print_response(&path, &response);
            if !keep {
                store.delete(&path);
            }
        }
        Ok(None) => println!("{}", i18n.t("no_responses")),
        Err(MailboxError::Corrupt { path, source }) => {
            warn!(file = %path.display(), error = %source, "deleting corrupt response");
            store.delete(&path);
        }
        Err(e) => return Err(e).context("failed to read responses"),
    }
    Ok(())
}

fn print_response(path: &Path, response: &CommandResponse) {
    let status = match response.status {
        ResponseStatus::Success => response.status.as_str().green().bold(),
        ResponseStatus::Error => response.status.as_str().red().bold(),
        ResponseStatus::Cancelled => response.status.as_str().yellow().bold(),
    };
    println!("[{}] {}", status, file_name(path).dimmed());
    println!("{}", response.message);
    if let Some(error) = response.extra.get("error").and_then(|v| v.as_str()) {
        println!("{}", error.red());
    }
    println!();
}
