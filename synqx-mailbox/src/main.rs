//! `SynqX` mailbox service.
//!
//! An axum WebSocket server holding pending inboxes, permanent histories and
//! user settings for `SynqX` clients.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9400
//! cargo run --bin synqx-mailbox
//!
//! # Run on custom address
//! cargo run --bin synqx-mailbox -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;
use synqx_mailbox::config::{MailboxCliArgs, MailboxConfig};
use synqx_mailbox::server::{self, ServerState};

#[tokio::main]
async fn main() {
    let cli = MailboxCliArgs::parse();

    let config = match MailboxConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_inbox_size = config.store.max_inbox_size,
        event_capacity = config.store.event_capacity,
        lag_policy = ?config.lag_policy,
        "starting synqx mailbox service"
    );

    let state = Arc::new(ServerState::from_config(&config));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "mailbox service listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "mailbox server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start mailbox service");
            std::process::exit(1);
        }
    }
}
