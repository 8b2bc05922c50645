//! Sentience daemon: hosts the core, answers stdin lines and runs the background cycles.
//!
//! Each input line is one user turn; the outcome is printed to stdout as a JSON line.
//! Cycle reports (reflections, dreams, outreach) are printed the same way. Ctrl-C or
//! end of input shuts the core down and persists its state.

use std::sync::Arc;

use sentience_core::{
    ChatCompletionsClient, InferenceService, MockInference, SentienceConfig, SentienceCore, SentienceError,
    SledStore, SystemClock,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[sentience-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "sentience daemon stopped");
        std::process::exit(1);
    }
}

fn inference_service(config: &SentienceConfig) -> Arc<dyn InferenceService> {
    match config.llm_mode.as_str() {
        "openai" => Arc::new(
            ChatCompletionsClient::new(&config.inference.base_url)
                .with_model(&config.inference.model)
                .with_api_key(config.inference.resolved_api_key()),
        ),
        _ => Arc::new(MockInference::echo()),
    }
}

async fn run() -> Result<(), SentienceError> {
    let config = SentienceConfig::load()?;
    let store_path = config.sled_path();
    let store = Arc::new(SledStore::open_path(&store_path)?);
    let service = inference_service(&config);

    tracing::info!(
        app = %config.app_name,
        session = %config.session_id,
        store = %store_path.display(),
        llm_mode = %config.llm_mode,
        "Sentience daemon starting"
    );

    let core = SentienceCore::new(config, store, service, Arc::new(SystemClock::new()))?;
    core.boot()?;
    core.start_scheduler()?;

    let mut reports = core.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => match core.submit_input(&text).await {
                        Ok(outcome) => print_json(&outcome),
                        Err(e) => tracing::warn!(error = %e, "turn failed"),
                    },
                    Ok(None) => {
                        tracing::info!("input closed; shutting down");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed; shutting down");
                        break;
                    }
                }
            }
            report = reports.recv() => {
                match report {
                    Ok(report) => print_json(&report),
                    Err(RecvError::Lagged(missed)) => tracing::debug!(missed, "cycle reports dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    core.shutdown().await
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "could not encode output"),
    }
}
