use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use timebank::config::{self, TimeBankConfig};
use timebank::ledger::{BalanceUpdate, EntryMetadata, TransactionType};
use timebank::{storage, TimeBankCore};

/// Screen Time Bank
///
/// Manages per-user banks of earnable screen time: an auditable ledger,
/// time-boxed unlock sessions, and replay of transactions recorded offline.
#[derive(Parser, Debug)]
#[command(name = "timebank")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Where to write the config (defaults to the platform config dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Create a time bank for a new user
    Enroll {
        /// User identifier
        user: String,
    },
    /// Grant time to a user
    Grant {
        user: String,

        /// Minutes to grant
        #[arg(long)]
        minutes: u32,

        /// Who is granting the time
        #[arg(long)]
        by: String,

        /// Optional reason shown in the audit trail
        #[arg(long)]
        reason: Option<String>,
    },
    /// Credit time for a completed task
    CompleteTask {
        user: String,

        /// Task identifier
        #[arg(long)]
        task_id: String,

        /// Task title for the audit trail
        #[arg(long)]
        title: Option<String>,

        /// Minutes the task is worth
        #[arg(long)]
        minutes: u32,
    },
    /// Apply a signed administrative correction
    Adjust {
        user: String,

        /// Signed seconds to apply
        #[arg(long, allow_hyphen_values = true)]
        seconds: i64,

        /// Why the correction is needed
        #[arg(long)]
        reason: String,

        /// Administrator applying the correction
        #[arg(long)]
        by: String,
    },
    /// Spend balance to unlock the device for a bounded time
    Unlock {
        user: String,

        /// Session length in minutes
        #[arg(long)]
        minutes: u32,

        /// Device being unlocked
        #[arg(long)]
        device: Option<String>,
    },
    /// Cancel an active session (no refund)
    Cancel {
        /// Session identifier
        session_id: String,
    },
    /// Expire active sessions past their end time
    Expire,
    /// Show a user's balance, sessions, and queue state
    Status { user: String },
    /// Show a user's ledger history
    History {
        user: String,

        /// Show only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Replay a user's pending offline transactions
    Replay { user: String },
    /// Re-open failed offline entries for another replay pass
    RetryFailed { user: String },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    // `init` runs before a config exists
    if let Commands::Init { output, force } = &args.command {
        return cmd_init(output.clone(), *force);
    }

    let config = load_or_default_config(args.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(args.command, config))
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Load the config from the given path, the default location, or defaults
fn load_or_default_config(path: Option<&std::path::Path>) -> Result<TimeBankConfig> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default_path = storage::default_config_path();
            if default_path.exists() {
                config::load_config(&default_path)
            } else {
                Ok(TimeBankConfig::default())
            }
        }
    }
}

fn cmd_init(output: Option<PathBuf>, force: bool) -> Result<()> {
    let output_path = output.unwrap_or_else(storage::default_config_path);

    if output_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            output_path.display()
        );
    }

    storage::atomic_write(&output_path, config::EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))?;

    println!("✓ Created configuration file: {}", output_path.display());
    println!("\nEdit this file to adjust lock timeouts, session bounds, and retry policy.");
    println!("Then enroll a user: timebank enroll <user>");

    Ok(())
}

async fn dispatch(command: Commands, config: TimeBankConfig) -> Result<()> {
    let core = TimeBankCore::open(config)?;

    match command {
        Commands::Init { .. } => unreachable!("handled before config load"),
        Commands::Enroll { user } => {
            core.enroll(&user).await?;
            println!("✓ Enrolled user '{}' with an empty time bank", user);
        }
        Commands::Grant {
            user,
            minutes,
            by,
            reason,
        } => {
            let outcome = core
                .apply_delta(BalanceUpdate {
                    user_id: user.clone(),
                    seconds_delta: i64::from(minutes) * 60,
                    transaction_type: Some(TransactionType::Earn),
                    description: format!("Granted {minutes} minutes by {by}"),
                    metadata: EntryMetadata::ParentGrant {
                        granted_by: by,
                        reason,
                    },
                    actor_id: user.clone(),
                })
                .await?;
            println!(
                "✓ Granted {} minutes to '{}' (balance: {})",
                minutes,
                user,
                format_seconds(outcome.new_balance_seconds)
            );
        }
        Commands::CompleteTask {
            user,
            task_id,
            title,
            minutes,
        } => {
            let outcome = core
                .apply_delta(BalanceUpdate {
                    user_id: user.clone(),
                    seconds_delta: i64::from(minutes) * 60,
                    transaction_type: Some(TransactionType::Earn),
                    description: format!("Completed task {task_id}"),
                    metadata: EntryMetadata::TaskCompletion {
                        task_id,
                        task_title: title,
                    },
                    actor_id: user.clone(),
                })
                .await?;
            println!(
                "✓ Credited {} minutes to '{}' (balance: {})",
                minutes,
                user,
                format_seconds(outcome.new_balance_seconds)
            );
        }
        Commands::Adjust {
            user,
            seconds,
            reason,
            by,
        } => {
            let outcome = core
                .apply_delta(BalanceUpdate {
                    user_id: user.clone(),
                    seconds_delta: seconds,
                    transaction_type: Some(TransactionType::Adjustment),
                    description: format!("Adjustment: {reason}"),
                    metadata: EntryMetadata::AdminAdjustment { reason },
                    actor_id: by,
                })
                .await?;
            println!(
                "✓ Applied {:+}s adjustment to '{}' (balance: {})",
                seconds,
                user,
                format_seconds(outcome.new_balance_seconds)
            );
        }
        Commands::Unlock {
            user,
            minutes,
            device,
        } => {
            let receipt = core.start_session(&user, minutes, device).await?;
            println!("✓ Unlocked for {} minutes", minutes);
            println!("  Session:   {}", receipt.session_id);
            println!("  Ends at:   {}", receipt.ends_at.format("%Y-%m-%d %H:%M:%S %Z"));
            println!("  Balance:   {}", format_seconds(receipt.new_balance_seconds));
        }
        Commands::Cancel { session_id } => {
            core.cancel_session(&session_id).await?;
            println!("✓ Cancelled session {} (remaining time forfeited)", session_id);
        }
        Commands::Expire => {
            let count = core.expire_sessions(Utc::now()).await?;
            println!("✓ Expired {} session(s)", count);
        }
        Commands::Status { user } => {
            cmd_status(&core, &user).await?;
        }
        Commands::History { user, limit } => {
            cmd_history(&core, &user, limit).await?;
        }
        Commands::Replay { user } => {
            let summary = core.process_pending(&user).await?;
            println!(
                "✓ Replayed offline queue for '{}': {} processed, {} failed",
                user, summary.processed_count, summary.failed_count
            );
            if summary.failed_count > 0 {
                println!("  Inspect failures with: timebank status {}", user);
            }
        }
        Commands::RetryFailed { user } => {
            let reopened = core.retry_failed(&user).await?;
            println!("✓ Re-opened {} failed entries for '{}'", reopened, user);
            if reopened > 0 {
                println!("  Apply them with: timebank replay {}", user);
            }
        }
    }

    Ok(())
}

async fn cmd_status(core: &TimeBankCore, user: &str) -> Result<()> {
    let bank = core.balance(user).await?;

    println!("Time Bank Status: {}", user);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Balance:          {}", format_seconds(bank.current_balance_seconds));
    println!("Lifetime earned:  {}", format_seconds(bank.lifetime_earned_seconds));
    println!("Lifetime spent:   {}", format_seconds(bank.lifetime_spent_seconds));
    println!("Updated:          {}", bank.updated_at.format("%Y-%m-%d %H:%M:%S %Z"));

    let sessions = core.sessions_for_user(user).await?;
    let active: Vec<_> = sessions
        .iter()
        .filter(|s| s.status == timebank::SessionStatus::Active)
        .collect();
    println!();
    println!("Sessions: {} total, {} active", sessions.len(), active.len());
    for session in active {
        println!(
            "  {} until {} ({})",
            session.id,
            session.ends_at.format("%H:%M:%S"),
            session.device_identifier.as_deref().unwrap_or("unknown device")
        );
    }

    let queue = core.offline_entries(user).await?;
    let pending = queue.iter().filter(|e| e.processed_at.is_none()).count();
    let failed = queue
        .iter()
        .filter(|e| e.processed_at.is_some() && e.error_message.is_some())
        .count();
    println!();
    println!(
        "Offline queue: {} total, {} pending, {} failed",
        queue.len(),
        pending,
        failed
    );
    for entry in queue.iter().filter(|e| e.error_message.is_some()) {
        println!(
            "  {} {:+}s: {}",
            entry.id,
            entry.seconds_delta,
            entry.error_message.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

async fn cmd_history(core: &TimeBankCore, user: &str, limit: Option<usize>) -> Result<()> {
    let entries = core.history(user).await?;

    let shown: Vec<_> = match limit {
        Some(n) if entries.len() > n => entries[entries.len() - n..].to_vec(),
        _ => entries,
    };

    println!("Ledger History: {}", user);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for entry in &shown {
        println!(
            "{}  {:+6}s  {:>8}  {}  (balance {})",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.seconds_delta,
            entry.source().to_string(),
            entry.description,
            format_seconds(entry.balance_after_seconds)
        );
    }
    if shown.is_empty() {
        println!("(no entries)");
    }

    Ok(())
}

/// Format a seconds count for display
fn format_seconds(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let secs = seconds.abs();
    if secs < 60 {
        format!("{}{}s", sign, secs)
    } else if secs < 3600 {
        format!("{}{}m {}s", sign, secs / 60, secs % 60)
    } else {
        format!("{}{}h {}m", sign, secs / 3600, (secs % 3600) / 60)
    }
}
