//! Stash server - transient file stash over HTTP
//!
//! Clients upload files as multipart parts and get back one id per file.
//! Fetching `/stash/{id}` streams the file back; depending on
//! configuration the file is removed after that first fetch, and in any
//! case once it is older than the configured maximum age.

mod body;
mod config;
mod content_type;
mod error;
mod server;
mod types;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::server::{start_server, ServerState, SharedState};
use file_stash::Stash;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("stash_server=info".parse()?)
        .add_directive("file_stash=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting stash server...");

    let config = ServerConfig::from_env()?;
    info!("Port: {}", config.port);
    info!("Stash dir: {:?}", config.stash.stash_dir);
    info!("Max item age: {} ms", config.stash.max_item_age.as_millis());
    info!("Sweep interval: {} ms", config.stash.sweep_interval.as_millis());
    info!("Delete after access: {}", config.stash.delete_after_access);

    let stash = Stash::open(config.stash.clone()).await?;
    let sweeper = stash.sweeper().spawn();

    let state: SharedState = Arc::new(ServerState::new(stash));

    // Serve until ctrl-c
    let served = start_server(state, config.port)
        .await
        .map_err(ServerError::from);

    sweeper.shutdown().await;
    info!("Stash server stopped");
    served
}
