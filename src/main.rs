// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vigil-agent - standalone background monitor.
//!
//! Runs outside any foreground context and enforces the session envelope
//! against the shared file store: a tab that was killed, frozen, or never
//! reopened still gets its session expired, its peers told, and its
//! persisted state cleaned up.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use vigil::background::{AgentMessage, BackgroundMonitor, LogWake};
use vigil::security::load_lockout;
use vigil::store::KEY_SESSION_SNAPSHOT;
use vigil::{EngineConfig, FileStore, KeyValueStore, SessionSnapshot};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

use colors::*;

#[derive(Parser)]
#[command(name = "vigil-agent", version = VERSION, about = "Session envelope enforcement outside the foreground")]
struct Cli {
    /// Store directory shared with the foreground contexts
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Verbose log output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor until interrupted
    Run {
        /// JSON config file; defaults apply for anything omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the persisted session and lockout state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let dir = cli.store_dir.unwrap_or_else(FileStore::default_dir);
    let store = Arc::new(
        FileStore::open(&dir).with_context(|| format!("opening store at {}", dir.display()))?,
    );

    match cli.command {
        Command::Run { config } => run(store, config).await,
        Command::Status => status(store.as_ref()),
    }
}

async fn run(store: Arc<FileStore>, config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => EngineConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    println!("{BOLD}{CYAN}vigil-agent {VERSION}{RESET}");
    println!("{DIM}poll interval: {}ms{RESET}", config.poll_interval_ms);

    let monitor = BackgroundMonitor::new(
        store as Arc<dyn KeyValueStore>,
        Arc::new(LogWake),
        config.poll_interval(),
    );
    // the sender stays alive until shutdown; dropping it lets run() drain out
    let (tx, rx) = mpsc::unbounded_channel::<AgentMessage>();
    let task = tokio::spawn(monitor.run(rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    println!("\n{YELLOW}shutting down{RESET}");
    drop(tx);
    task.await.context("joining monitor task")?;
    Ok(())
}

fn status(store: &FileStore) -> Result<()> {
    match store.get(KEY_SESSION_SNAPSHOT)? {
        Some(raw) => {
            let snapshot: SessionSnapshot =
                serde_json::from_str(&raw).context("decoding session snapshot")?;
            let age = Utc::now() - snapshot.start_time;
            println!("{BOLD}session{RESET}    {GREEN}{}{RESET}", snapshot.session_id);
            println!("user       {}", snapshot.user_id);
            println!("started    {}", snapshot.start_time.to_rfc3339());
            println!(
                "age        {}m of {}m max",
                age.num_minutes(),
                snapshot.max_duration_ms / 60_000
            );
            println!("last seen  {}", snapshot.last_activity.to_rfc3339());
        }
        None => println!("{DIM}no persisted session{RESET}"),
    }

    match load_lockout(store)? {
        Some(record) if record.end_time > Utc::now() => {
            println!(
                "{BOLD}lockout{RESET}    {RED}until {} ({}){RESET}",
                record.end_time.to_rfc3339(),
                record.reason
            );
        }
        _ => println!("{BOLD}lockout{RESET}    {GREEN}none{RESET}"),
    }
    Ok(())
}
