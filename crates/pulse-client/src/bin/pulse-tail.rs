//! Prints live telemetry envelopes from a Pulse server, one JSON per line.
//!
//! Usage: `pulse-tail [base-url] [subject-id ...]`
//!
//! Defaults to `http://127.0.0.1:3000` and subject 1. `PULSE_LOG_LEVEL`
//! controls diagnostics on stderr.

use pulse_client::{ClientConfig, ClientEvent, HttpCatchUp, ReconnectingClient};
use tracing_subscriber::EnvFilter;

fn ws_url_for(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}/ws", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}/ws", rest)
    } else {
        format!("ws://{}/ws", trimmed)
    }
}

#[tokio::main]
async fn main() {
    let level = std::env::var("PULSE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let base_url = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:3000".to_string());
    let mut subjects: Vec<i64> = Vec::new();
    for arg in args {
        match arg.parse() {
            Ok(id) if id > 0 => subjects.push(id),
            _ => {
                eprintln!("ignoring invalid subject id: {}", arg);
            }
        }
    }
    if subjects.is_empty() {
        subjects.push(1);
    }

    let config = ClientConfig::new(ws_url_for(&base_url), subjects);
    tracing::info!(url = %config.ws_url, subjects = ?config.subjects, "starting pulse-tail");

    let (handle, mut events) = ReconnectingClient::spawn(config, HttpCatchUp::new(&base_url));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let origin = match &event {
                    ClientEvent::CatchUp(_) => "catch-up",
                    ClientEvent::Live(_) => "live",
                };
                let record_id = event.envelope().data.id();
                match serde_json::to_string(event.envelope()) {
                    Ok(line) => {
                        tracing::debug!(origin, record_id, "envelope received");
                        println!("{}", line);
                    }
                    Err(e) => tracing::warn!(origin, record_id, "failed to encode envelope: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, stopping");
                break;
            }
        }
    }

    handle.stop().await;
}
