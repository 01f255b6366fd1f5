//! Frontdoor: an extensible HTTP front-end.
//!
//! This is the application entry point. It initializes tracing, loads configuration
//! from a TOML file, registers the built-in middleware stages and routes, and runs
//! the server until a shutdown signal arrives or the server fails.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use frontdoor::config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use frontdoor::http::shutdown::wait_for_signal;
use frontdoor::middleware::{
    Headers, HtmlErrorHandler, ParallelRequests, Recovery, RequestLogger, Www,
};
use frontdoor::routes::Health;
use frontdoor::{Registry, Server};

/// Frontdoor: an extensible HTTP front-end
#[derive(Parser, Debug)]
#[command(name = "frontdoor", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "frontdoor=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, &config.logging);

    tracing::info!(config = %args.config, "Loaded configuration");

    let registry = Arc::new(build_registry(&config)?);
    let server = Server::new(config.http, registry);
    let mut errors = server.serve();

    let mut failed = false;
    tokio::select! {
        _ = wait_for_signal() => {}
        Some(e) = errors.recv() => {
            tracing::error!(error = %e, "Server error");
            failed = true;
        }
    }

    server.stop();

    // The channel closes once the server has fully stopped.
    while let Some(e) = errors.recv().await {
        tracing::error!(error = %e, "Server error");
        failed = true;
    }

    if failed {
        return Err("server stopped with errors".into());
    }
    Ok(())
}

fn init_tracing(filter: &str, logging: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(EnvFilter::new(filter));
    if logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Register every built-in stage. Which of them run, and in what order, is
/// decided by `http.middleware`.
fn build_registry(config: &AppConfig) -> Result<Registry, Box<dyn std::error::Error>> {
    let registry = Registry::new();

    registry.add_middleware(Recovery::new(HtmlErrorHandler));
    registry.add_middleware(RequestLogger::new());
    registry.add_middleware(Www::new());
    registry.try_add_middleware(Headers::from_config(&config.http))?;
    registry.try_add_middleware(ParallelRequests::from_config(&config.http))?;

    registry.add_handler(Health::new());

    Ok(registry)
}
