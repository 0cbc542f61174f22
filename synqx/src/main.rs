//! `SynqX`: offline-tolerant terminal chat client.
//!
//! Reads lines from stdin and sends them to the configured peer through the
//! send queue. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/synqx/config.toml`).
//!
//! ```bash
//! # Local demo against an in-process mailbox
//! cargo run --bin synqx -- --user alice --peer bob
//!
//! # Against a running mailbox service
//! cargo run --bin synqx -- --mailbox-url ws://127.0.0.1:9400/ws \
//!     --user alice --peer bob
//! ```
//!
//! Commands: `/status`, `/history [n]`, `/retry <id>`, `/cancel <id>`,
//! `/delete <key> [all]`, `/clear`, `/backup on|off`, `/check`,
//! `/offline`, `/online`, `/quit`.

use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use synqx_proto::message::{MessageBody, StoredMessage, Timestamp, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use synqx::client::SynqxClient;
use synqx::clock::SystemClock;
use synqx::config::{CliArgs, ClientConfig, ConfigError};
use synqx::connection::MailboxConnectivity;
use synqx::event::{ChatEvent, Direction};
use synqx::mailbox::Mailbox;
use synqx::mailbox::memory::MemoryMailbox;
use synqx::mailbox::remote::RemoteMailbox;
use synqx::queue::QueuedId;
use synqx::router::DeleteTarget;
use synqx::storage::persistence::{FilePersistence, MemoryPersistence, Persistence};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // CLI args > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they do not interleave with the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let (me, peer) = match participants(&config) {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("Error: {e} (use --user and --peer)");
            std::process::exit(2);
        }
    };

    tracing::info!(user = %me, peer = %peer, "synqx starting");

    match config.mailbox_url.as_deref() {
        Some(url) => match RemoteMailbox::connect(url).await {
            Ok(mailbox) => {
                println!("Connected to mailbox at {url}");
                with_persistence(mailbox, me, peer, &config).await?;
            }
            Err(e) => {
                println!("Could not reach mailbox at {url}, running locally ({e})");
                with_persistence(MemoryMailbox::new(), me, peer, &config).await?;
            }
        },
        None => {
            println!("No mailbox configured, running locally");
            with_persistence(MemoryMailbox::new(), me, peer, &config).await?;
        }
    }

    tracing::info!("synqx exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("synqx.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn participants(config: &ClientConfig) -> Result<(UserId, UserId), ConfigError> {
    let me = config.require_user()?;
    let peer = config
        .peer_id
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or(ConfigError::Missing("peer_id"))?;
    Ok((UserId::new(me), UserId::new(peer)))
}

/// Picks file-backed storage when a data directory is available.
async fn with_persistence<M: Mailbox>(
    mailbox: M,
    me: UserId,
    peer: UserId,
    config: &ClientConfig,
) -> io::Result<()> {
    if let Some(dir) = &config.data_dir {
        match FilePersistence::open(dir) {
            Ok(persistence) => return run(mailbox, persistence, me, peer, config).await,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "falling back to in-memory storage");
            }
        }
    }
    run(mailbox, MemoryPersistence::new(), me, peer, config).await
}

/// Main loop: stdin lines in, chat events out.
async fn run<M: Mailbox, P: Persistence>(
    mailbox: M,
    persistence: P,
    me: UserId,
    peer: UserId,
    config: &ClientConfig,
) -> io::Result<()> {
    let mailbox = Arc::new(mailbox);
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&mailbox), true));
    let (client, mut events) = SynqxClient::start(
        me,
        mailbox,
        Arc::new(persistence),
        Arc::clone(&source),
        Arc::new(SystemClock),
        config.client_options(),
    )
    .await;

    let fmt = config.timestamp_format.as_str();
    for message in client.open_conversation(&peer).await {
        print_message(&message, client.me(), fmt);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(command) = line.strip_prefix('/') {
                    if !run_command(command, &client, &source, &peer, fmt).await {
                        break;
                    }
                } else {
                    match MessageBody::text(line) {
                        Ok(body) => {
                            client.enqueue(peer.clone(), body);
                        }
                        Err(e) => println!("!! {e}"),
                    }
                }
            }
            Some(event) = events.recv() => print_event(&event, client.me(), fmt),
        }
    }

    drain_events(&mut events, client.me(), fmt);
    client.close_conversation(&peer);
    client.shutdown().await;
    Ok(())
}

/// Executes one slash command. Returns `false` to quit.
async fn run_command<M: Mailbox, P: Persistence>(
    command: &str,
    client: &SynqxClient<M, P, MailboxConnectivity<M>, SystemClock>,
    source: &MailboxConnectivity<M>,
    peer: &UserId,
    fmt: &str,
) -> bool {
    let mut parts = command.split_whitespace();
    match (parts.next().unwrap_or_default(), parts.next()) {
        ("quit" | "q", _) => return false,
        ("status", _) => {
            let snapshot = client.get_connection_quality();
            println!(
                "-- {} ({}), {} pending, {} failed",
                snapshot.quality,
                if snapshot.is_online { "online" } else { "offline" },
                snapshot.pending_count,
                client.queue().failed().len()
            );
            for item in client.queue().pending() {
                println!("   {} {} {}", item.id, item.status, item.message.body.preview());
            }
            for item in client.queue().failed() {
                println!("   {} failed {}", item.id, item.message.body.preview());
            }
        }
        ("history", limit) => {
            let limit = limit.and_then(|n| n.parse().ok()).unwrap_or(20);
            for message in client.get_history(peer, limit).await {
                print_message(&message, client.me(), fmt);
            }
        }
        ("retry", Some(id)) => {
            if !client.retry_message(&QueuedId::new(id)) {
                println!("!! no failed message {id}");
            }
        }
        ("cancel", Some(id)) => {
            if !client.cancel(&QueuedId::new(id)) {
                println!("!! cannot cancel {id}");
            }
        }
        ("delete", Some(key)) => {
            let for_everyone = parts.next() == Some("all");
            match client
                .delete_message(peer, DeleteTarget::Key(key.to_string()), for_everyone)
                .await
            {
                Ok(removed) => println!("-- removed {removed} entries"),
                Err(e) => println!("!! delete failed: {e}"),
            }
        }
        ("clear", _) => {
            if let Err(e) = client.clear_conversation(peer).await {
                println!("!! clear failed: {e}");
            }
        }
        ("backup", Some(flag @ ("on" | "off"))) => {
            if let Err(e) = client.set_backup_enabled(flag == "on").await {
                println!("!! could not change backup: {e}");
            }
        }
        ("check", _) => {
            let state = client.check_connectivity().await;
            println!("-- {} ({})", state.quality, if state.online { "online" } else { "offline" });
        }
        ("offline", _) => source.set_online(false),
        ("online", _) => source.set_online(true),
        (other, _) => println!("!! unknown command /{other}"),
    }
    true
}

fn drain_events(events: &mut mpsc::Receiver<ChatEvent>, me: &UserId, fmt: &str) {
    while let Ok(event) = events.try_recv() {
        print_event(&event, me, fmt);
    }
}

fn print_event(event: &ChatEvent, me: &UserId, fmt: &str) {
    match event {
        ChatEvent::MessageRendered { message, direction } => {
            let marker = match direction {
                Direction::Sent => ">",
                Direction::Received => "<",
            };
            println!("{marker} {}", render(message, me, fmt));
        }
        ChatEvent::StatusChanged { timestamp, status } => {
            println!("   [{}] {status}", format_time(*timestamp, fmt));
        }
        ChatEvent::ConnectionChanged(state) => {
            println!(
                "-- connection {} ({})",
                state.quality,
                if state.online { "online" } else { "offline" }
            );
        }
    }
}

fn print_message(message: &StoredMessage, me: &UserId, fmt: &str) {
    println!("  {}", render(message, me, fmt));
}

fn render(message: &StoredMessage, me: &UserId, fmt: &str) -> String {
    let who = if &message.sender_id == me {
        "you"
    } else {
        message
            .sender_name
            .as_deref()
            .unwrap_or_else(|| message.sender_id.as_str())
    };
    let tick = if message.delivered { " ✓" } else { "" };
    format!(
        "[{}] {who}: {}{tick}",
        format_time(message.timestamp, fmt),
        message.body.preview()
    )
}

/// Formats `timestamp` in local time, falling back to raw millis when the
/// format string is invalid.
fn format_time(timestamp: Timestamp, fmt: &str) -> String {
    let Ok(millis) = i64::try_from(timestamp.as_millis()) else {
        return timestamp.as_millis().to_string();
    };
    let Some(utc) = chrono::DateTime::from_timestamp_millis(millis) else {
        return millis.to_string();
    };
    let local = utc.with_timezone(&chrono::Local);
    let mut out = String::new();
    if write!(out, "{}", local.format(fmt)).is_err() {
        return millis.to_string();
    }
    out
}
