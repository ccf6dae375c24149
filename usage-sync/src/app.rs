use crate::api::{UsageFetcher, build_http_client};
use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::display::status_lines;
use crate::events::platform::start_power_listener;
use crate::history::HistoryStore;
use crate::keychain::{KeyringStore, SecretStore};
use crate::network::{probe_address, start_network_listener};
use crate::polling::{EngineHandle, EngineTiming, SyncEngine};
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operator commands read from stdin, one per line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "r" | "refresh" => Some(Command::Refresh),
            "q" | "quit" => Some(Command::Quit),
            _ => None,
        }
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Optional overrides from a .env file in the working directory
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    info!(config = ?config, "Configuration loaded");

    let client = build_http_client()?;
    let store: Arc<dyn SecretStore> = Arc::new(KeyringStore::new());
    let credentials = Arc::new(CredentialProvider::for_current_user(
        store,
        config.keychain_service.clone(),
        client.clone(),
        config.token_url.clone(),
    ));
    let fetcher = Arc::new(UsageFetcher::new(client, config.usage_url.clone(), credentials));

    let history = HistoryStore::load(config.history_path.clone()).await;
    let (engine, handle, mut updates) = SyncEngine::new(fetcher, EngineTiming::from(&config), history);

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(cancel_token.clone()));

    forward_system_events(handle.clone());
    match probe_address(&config.usage_url) {
        Some(address) => forward_network_events(handle.clone(), address),
        None => warn!(url = %config.usage_url, "Cannot derive probe address, network monitoring disabled"),
    }
    spawn_command_reader(handle, cancel_token.clone());
    spawn_ctrl_c_handler(cancel_token.clone());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let update = updates.borrow_and_update().clone();
                if update.in_flight {
                    continue;
                }
                for line in status_lines(&update, Utc::now()) {
                    info!(target: "usage_sync::status", "{line}");
                }
            }
        }
    }

    cancel_token.cancel();
    if let Err(e) = engine_task.await {
        error!(error = %e, "Sync engine task failed");
    }

    info!("Graceful shutdown complete");
    Ok(())
}

fn forward_system_events(handle: EngineHandle) {
    let mut events = start_power_listener();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "System event received");
            if !handle.system_event(event) {
                break;
            }
        }
    });
}

fn forward_network_events(handle: EngineHandle, probe_address: String) {
    let mut events = start_network_listener(probe_address);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !handle.network_changed(event) {
                break;
            }
        }
    });
}

fn spawn_command_reader(handle: EngineHandle, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("Commands: r/refresh = refresh now, q/quit = exit");

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                // stdin closed: keep running until Ctrl-C
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read command");
                    break;
                }
            };

            match Command::parse(&line) {
                Some(Command::Refresh) => {
                    handle.refresh_now();
                }
                Some(Command::Quit) => {
                    info!("Quit requested");
                    cancel_token.cancel();
                    break;
                }
                None if line.trim().is_empty() => {}
                None => warn!(input = %line.trim(), "Unknown command"),
            }
        }
    });
}

fn spawn_ctrl_c_handler(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, initiating graceful shutdown");
                cancel_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}
