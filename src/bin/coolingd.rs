// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! coolingd: runs the cooling loop over simulated sensors and fans, and
//! accepts commands from clients over a Unix domain socket.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use thermal_cooling_sim::clock::SystemClock;
use thermal_cooling_sim::config::{self, Config};
use thermal_cooling_sim::protocol::{self, Request, Response};
use thermal_cooling_sim::service::CoolingService;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "coolingd", about = "Simulated cooling control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the socket path.
    #[arg(short, long)]
    socket: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let loaded = config::load_config(&config_path);
    let log_level = loaded
        .as_ref()
        .map(|c| c.daemon.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let cfg = loaded.unwrap_or_else(|e| {
        log::warn!("Could not load config: {e}, using defaults");
        Config::default()
    });

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| cfg.daemon.socket_path.clone());

    let service = Arc::new(
        CoolingService::new(&cfg, Arc::new(SystemClock)).context("Invalid configuration")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = service.spawn(&shutdown_rx);

    // Clean up old socket file
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {socket_path}"))?;

    // Make socket accessible to non-root users
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(&socket_path, perms)?;
    }

    log::info!("Listening on {socket_path}");

    // Signal handler
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    // Accept client connections
    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_client(stream, service.clone(), shutdown_rx.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                log::info!("Daemon shutting down");
                break;
            }
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Background task failed: {e}");
        }
    }

    // Cleanup socket
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {e}");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

// ---------------------------------------------------------------------------
// Client connection handler
// ---------------------------------------------------------------------------

async fn handle_client(
    stream: UnixStream,
    service: Arc<CoolingService>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => return,
        };
        let Ok(Some(line)) = line else {
            break; // Client disconnected
        };

        let (response, subscribe) = match protocol::decode::<Request>(&line) {
            Ok(Request::Subscribe) => (service.handle(Request::Subscribe), true),
            Ok(req) => (service.handle(req), false),
            Err(e) => (Response::invalid_request(format!("Invalid request: {e}")), false),
        };

        // Subscribe before acknowledging so no event slips between the two.
        let events = subscribe.then(|| service.subscribe());

        if send(&mut writer, &response).await.is_err() {
            break;
        }
        if let Some(events) = events {
            stream_events(&mut writer, events, shutdown).await;
            break;
        }
    }
}

async fn stream_events(
    writer: &mut OwnedWriteHalf,
    mut events: broadcast::Receiver<thermal_cooling_sim::bus::BusEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("Client subscribed to events");
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => return,
        };
        match event {
            Ok(event) => {
                if send(writer, &Response::Event { event }).await.is_err() {
                    return; // Client disconnected
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Subscriber lagged, dropped {skipped} event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let encoded = match protocol::encode(response) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to encode response: {e}");
            return Ok(());
        }
    };
    writer.write_all(encoded.as_bytes()).await
}
