use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use board_core::config::{
    load_board_config_or_default, save_board_config, BoardConfig, ConfigError,
};
use board_core::status::ThreadStatus;
use board_core::types::{ChatId, ThreadId, UserId};
use board_core::validation::{Validate, ValidationLevel};
use board_notify::{BroadcastHub, ChangeDispatcher};
use boardd::{
    daemon_tick, run_until_shutdown, BoardService, NewThread, ServiceError, TransitionRequest,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "threadboard")]
#[command(version, about = "Thread lifecycle board and queue daemon")]
struct Cli {
    /// Board config file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = ".board/config.toml")]
    config: PathBuf,

    /// Overrides `storage.sqlite_path` from the config.
    #[arg(long, global = true)]
    sqlite_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config if missing and create the database schema
    Init,
    CreateThread(CreateThreadArgs),
    AddChat {
        #[arg(long)]
        user: String,
        #[arg(long)]
        thread: String,
        #[arg(long, default_value = "queued")]
        status: ThreadStatus,
    },
    /// Guarded status change of one attempt
    Transition(TransitionArgs),
    Archive(FlagArgs),
    Backlog(FlagArgs),
    /// Promote waiting attempts for a user
    Dequeue {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "1")]
        slots: usize,
    },
    /// Print the board projection as JSON
    Board {
        #[arg(long)]
        user: String,
        #[arg(long)]
        archived: bool,
    },
    /// Run the queue daemon
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Args)]
struct CreateThreadArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    repo: String,
    #[arg(long, default_value = "draft")]
    status: ThreadStatus,
    #[arg(long)]
    pr_number: Option<u64>,
    #[arg(long)]
    automation_id: Option<String>,
    #[arg(long)]
    backlog: bool,
    /// Start the thread with a chat instead of a legacy row
    #[arg(long)]
    chat: bool,
}

#[derive(Args)]
struct TransitionArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    thread: String,
    /// Omit for legacy threads
    #[arg(long)]
    chat: Option<String>,
    #[arg(long)]
    from: ThreadStatus,
    #[arg(long)]
    to: ThreadStatus,
    /// RFC 3339 timestamp, only kept for rate-limited targets
    #[arg(long)]
    reattempt_at: Option<DateTime<Utc>>,
}

#[derive(Args)]
struct FlagArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    thread: String,
    /// Clear the flag instead of setting it
    #[arg(long)]
    undo: bool,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("failed to register signal handler: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize output as json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("threadboard failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    let cli = Cli::parse();
    let mut config = load_board_config_or_default(&cli.config)?;
    if let Some(path) = &cli.sqlite_path {
        config.storage.sqlite_path = path.clone();
    }
    init_tracing(&config);
    validate_config(&config)?;

    match cli.command {
        Command::Init => run_init(&cli.config, &config),
        Command::CreateThread(args) => run_create_thread(&config, args),
        Command::AddChat {
            user,
            thread,
            status,
        } => {
            let service = open_service(&config)?;
            let chat = service.add_chat(
                &UserId::new(user),
                &ThreadId::new(thread),
                status,
                Utc::now(),
            )?;
            print_json(&chat)
        }
        Command::Transition(args) => run_transition(&config, args),
        Command::Archive(args) => {
            let service = open_service(&config)?;
            let changed = service.set_archived(
                &UserId::new(args.user),
                &ThreadId::new(args.thread),
                !args.undo,
                Utc::now(),
            )?;
            print_json(&serde_json::json!({ "changed": changed }))
        }
        Command::Backlog(args) => {
            let service = open_service(&config)?;
            let changed = service.set_backlog(
                &UserId::new(args.user),
                &ThreadId::new(args.thread),
                !args.undo,
                Utc::now(),
            )?;
            print_json(&serde_json::json!({ "changed": changed }))
        }
        Command::Dequeue { user, slots } => {
            let service = open_service(&config)?;
            let promoted = service.drain_queue(&UserId::new(user), Utc::now(), slots)?;
            print_json(&promoted)
        }
        Command::Board { user, archived } => {
            let service = open_service(&config)?;
            let board = service.board(&UserId::new(user), archived, |_| None)?;
            print_json(&board)
        }
        Command::Run { once } => run_daemon(&config, once),
    }
}

fn init_tracing(config: &BoardConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn validate_config(config: &BoardConfig) -> Result<(), MainError> {
    let issues = config.validate();
    for issue in issues.iter().filter(|i| i.level == ValidationLevel::Warning) {
        warn!(code = issue.code, "{}", issue.message);
    }
    let errors = issues
        .iter()
        .filter(|i| i.level == ValidationLevel::Error)
        .map(|i| format!("{}: {}", i.code, i.message))
        .collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MainError::InvalidConfig(format!(
            "invalid board config: {}",
            errors.join("; ")
        )))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), MainError> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|source| MainError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })
}

fn open_service(config: &BoardConfig) -> Result<BoardService, MainError> {
    ensure_parent_dir(&config.storage.sqlite_path)?;
    let hub = BroadcastHub::new(config.notify.channel_capacity);
    let publisher = ChangeDispatcher::from_config(&config.notify, &hub);
    Ok(BoardService::open(config, publisher)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), MainError> {
    let body =
        serde_json::to_string_pretty(value).map_err(|source| MainError::Serialize { source })?;
    println!("{body}");
    Ok(())
}

fn run_init(config_path: &Path, config: &BoardConfig) -> Result<(), MainError> {
    if !config_path.exists() {
        save_board_config(config_path, config)?;
        info!(path = %config_path.display(), "wrote default config");
    }
    open_service(config)?;
    info!(sqlite = %config.storage.sqlite_path.display(), "database ready");
    Ok(())
}

fn run_create_thread(config: &BoardConfig, args: CreateThreadArgs) -> Result<(), MainError> {
    let service = open_service(config)?;
    let mut new = NewThread::new(UserId::new(args.user), args.repo, args.status);
    new.pr_number = args.pr_number;
    new.automation_id = args.automation_id;
    new.is_backlog = args.backlog;
    new.with_chat = args.chat;
    let created = service.create_thread(new, Utc::now())?;
    print_json(&created)
}

fn run_transition(config: &BoardConfig, args: TransitionArgs) -> Result<(), MainError> {
    let service = open_service(config)?;
    let mut request = TransitionRequest::new(
        UserId::new(args.user),
        ThreadId::new(args.thread),
        args.chat.map(ChatId::new),
        args.from,
        args.to,
    );
    if let Some(at) = args.reattempt_at {
        request = request.with_reattempt_at(at);
    }
    let outcome = service.transition(&request, Utc::now())?;
    print_json(&serde_json::json!({
        "applied": outcome.applied,
        "combined_status": outcome.combined_status,
    }))
}

fn run_daemon(config: &BoardConfig, once: bool) -> Result<(), MainError> {
    let service = open_service(config)?;
    info!(
        sqlite = %config.storage.sqlite_path.display(),
        max_concurrent_tasks = config.limits.max_concurrent_tasks,
        "threadboard daemon bootstrapped"
    );

    if once {
        let summary = daemon_tick(&service, Utc::now())?;
        info!(
            users = summary.users_scanned,
            promoted = summary.promoted.len(),
            errors = summary.errors,
            pruned = summary.pruned_sandbox_creations,
            "single tick finished (--once)"
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|source| MainError::Signal { source })?;
    }

    info!("threadboard running; press Ctrl+C to stop");
    let interval = Duration::from_secs(config.daemon.tick_interval_secs);
    run_until_shutdown(&service, interval, &shutdown)?;
    Ok(())
}
