// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Nurture - durable message sequences driven by user and meeting events.
//!
//! This is the binary entry point: `serve` runs the engine, every other
//! subcommand is a one-shot admin operation that prints JSON on stdout.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod admin;
mod serve;
mod status;

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use nurture_config::NurtureConfig;
use nurture_core::{Channel, NurtureError, TriggerType};

/// Nurture - durable message sequences driven by user and meeting events.
#[derive(Parser, Debug)]
#[command(name = "nurture", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the XDG hierarchy.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run delivery workers and the maintenance loop until SIGINT/SIGTERM.
    Serve,
    /// Offer a trigger event to every matching sequence.
    Trigger {
        #[arg(long)]
        user: String,
        /// Trigger type, e.g. `new_user` or `meeting_missed`.
        #[arg(long = "type", value_name = "TRIGGER_TYPE")]
        trigger_type: TriggerType,
        /// JSON object evaluated by trigger conditions.
        #[arg(long)]
        payload: Option<serde_json::Value>,
        /// When the event happened (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Enqueue a one-off message outside any sequence.
    Enqueue {
        #[arg(long)]
        user: String,
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "chat")]
        channel: Channel,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        /// Earliest delivery time (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Manage users.
    #[command(subcommand)]
    User(UserCommand),
    /// Manage meetings.
    #[command(subcommand)]
    Meeting(MeetingCommand),
    /// Correlate a JSON array of participant records with a meeting.
    Correlate {
        meeting_id: String,
        /// Participant records file, or `-` for stdin.
        records: PathBuf,
    },
    /// Re-run correlation with the participant records already stored.
    Recorrelate { meeting_id: String },
    /// Confirm which user an unmatched participant is, then re-correlate.
    Resolve {
        meeting_id: String,
        participant_key: String,
        user_id: String,
    },
    /// Opt a user out of one sequence type, or of everything.
    OptOut {
        user_id: String,
        #[arg(long)]
        sequence_type: Option<String>,
    },
    /// Lift an opt-out.
    OptIn {
        user_id: String,
        #[arg(long)]
        sequence_type: Option<String>,
    },
    /// Pause a running sequence instance.
    Pause { instance_id: i64 },
    /// Resume a paused instance or reopen a failed one.
    Resume { instance_id: i64 },
    /// Cancel an active sequence instance.
    Cancel { instance_id: i64 },
    /// Put a failed message back in the queue.
    Requeue { message_id: i64 },
    /// Show a user's instances, messages and preferences.
    Status { user_id: String },
    /// Show daily delivery metrics.
    Metrics {
        /// Day to show (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Recompute today's rows from the queue first.
        #[arg(long)]
        refresh: bool,
    },
    /// Delete rows past their retention window.
    Sweep,
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Register or update a user.
    Add {
        user_id: String,
        /// Address on the delivery channel.
        #[arg(long)]
        channel_user_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Email domain the user has proven ownership of.
        #[arg(long)]
        verified_domain: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MeetingCommand {
    /// Register or update a meeting.
    Add {
        meeting_id: String,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long)]
        title: Option<String>,
        /// Invited user id; repeat for each invitee.
        #[arg(long = "invitee")]
        invitees: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => nurture_config::load_and_validate_path(path),
        None => nurture_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            nurture_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    init_tracing(&config.engine.log_level);

    if let Err(e) = run(cli.command, config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: NurtureConfig) -> Result<(), NurtureError> {
    if let Commands::Serve = command {
        return serve::run_serve(config).await;
    }
    if let Commands::Config = command {
        return admin::print_config(&config);
    }

    let admin = admin::Admin::open(&config).await?;
    let now = Utc::now();
    let result = match command {
        Commands::Trigger {
            user,
            trigger_type,
            payload,
            at,
        } => {
            admin
                .trigger(user, trigger_type, payload, at.unwrap_or(now))
                .await
        }
        Commands::Enqueue {
            user,
            content,
            channel,
            priority,
            at,
        } => {
            admin
                .enqueue(&user, &content, channel, priority, at.unwrap_or(now), now)
                .await
        }
        Commands::User(UserCommand::Add {
            user_id,
            channel_user_id,
            name,
            email,
            verified_domain,
            timezone,
        }) => {
            let user = admin::NewUser {
                user_id,
                channel_user_id,
                display_name: name,
                email,
                verified_domain,
                timezone,
            };
            admin.add_user(user, now).await
        }
        Commands::Meeting(MeetingCommand::Add {
            meeting_id,
            start,
            end,
            title,
            invitees,
        }) => {
            admin
                .add_meeting(meeting_id, title, start, end, invitees)
                .await
        }
        Commands::Correlate {
            meeting_id,
            records,
        } => admin.correlate(&meeting_id, &records, now).await,
        Commands::Recorrelate { meeting_id } => admin.recorrelate(&meeting_id, now).await,
        Commands::Resolve {
            meeting_id,
            participant_key,
            user_id,
        } => {
            admin
                .resolve(&meeting_id, &participant_key, &user_id, now)
                .await
        }
        Commands::OptOut {
            user_id,
            sequence_type,
        } => admin.opt_out(&user_id, sequence_type.as_deref(), now).await,
        Commands::OptIn {
            user_id,
            sequence_type,
        } => admin.opt_in(&user_id, sequence_type.as_deref(), now).await,
        Commands::Pause { instance_id } => admin.pause(instance_id, now).await,
        Commands::Resume { instance_id } => admin.resume(instance_id, now).await,
        Commands::Cancel { instance_id } => admin.cancel(instance_id, now).await,
        Commands::Requeue { message_id } => admin.requeue(message_id, now).await,
        Commands::Status { user_id } => status::run_status(admin.storage(), &user_id).await,
        Commands::Metrics { date, refresh } => admin.metrics(date, refresh, now).await,
        Commands::Sweep => admin.sweep(now).await,
        Commands::Serve | Commands::Config => Ok(()),
    };

    admin.close().await?;
    result
}

/// Log to stderr so stdout stays machine-readable.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nurture={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}
