use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use stream_relay::config::RelayConfig;
use stream_relay::openai::OpenAiProvider;
use stream_relay::relay::Relay;
use stream_relay::server::{self, AppState};
use stream_relay::tokens::TiktokenRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse::<Level>().ok())
                .unwrap_or(Level::INFO),
        )
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting stream relay");
    info!("Listening on: {}", config.bind_addr);
    info!("Relaying to: {}", config.upstream.base_url);
    info!("Model config:");
    info!("  Default model: {}", config.settings.catalog.default_model);
    info!("  Supported models: {}", config.settings.catalog.supported.join(", "));
    info!("  CORS origin: {:?}", config.settings.cors_origin);
    info!("  Frame buffer: {}", config.settings.frame_buffer);

    // Tokenizers for every supported model, so a bad model list fails here
    let tokenizers = Arc::new(TiktokenRegistry::new());
    if let Err(e) = tokenizers.preload(&config.settings.catalog.supported) {
        error!("❌ {}", e);
        return ExitCode::FAILURE;
    }

    let provider = match OpenAiProvider::new(&config.upstream) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            error!("❌ Failed to build provider client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let relay = Relay::new(provider, tokenizers, config.settings.frame_buffer);
    let state = AppState::new(relay, config.settings.clone(), shutdown.clone());
    let app = server::router(state);

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("❌ Failed to bind to {}: {}", config.bind_addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Stream relay is ready");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("🛑 Shutdown requested, cancelling live sessions"),
                Err(e) => {
                    error!("❌ Failed to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
            }
            shutdown.cancel();
        })
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
