// src/main.rs

//! # Toil Main Entry Point
//!
//! Loads configuration, initializes logging, and launches the hub, the change
//! watcher, and the web server, then opens the served URL in a browser.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use toil::config::AppConfig;
use toil::error::Error;
use toil::hub::Hub;
use toil::web::AppState;
use toil::{browser, watcher, web, BANNER};

/// The main entry point for the Toil application.
///
/// 1. Loads the application configuration from CLI, file, and environment.
/// 2. Initializes the tracing subscriber for logging.
/// 3. Validates the serve root.
/// 4. Spawns the hub, the watcher, and the web server.
/// 5. Prints the URL and opens it in a browser.
/// 6. Runs until Ctrl-C or until a core task fails.
#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing subscriber for logging with environment filter and max level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed");

    tracing::debug!("Toil starting with configuration: {:?}", app_config);

    if !app_config.root.is_dir() {
        tracing::error!("{}", Error::RootNotDirectory(app_config.root.clone()));
        std::process::exit(1);
    }

    let hub = Hub::spawn();

    let watcher_config = Arc::clone(&app_config);
    let watcher_hub = hub.clone();
    let mut watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher::run_watcher(watcher_config, watcher_hub).await {
            tracing::error!("Watcher exited with error: {}", e);
        }
    });

    let listener = match web::bind(&app_config).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let url = web::browse_url(listener.local_addr()?);

    let web_state = AppState::new(hub, app_config.root.clone());
    let mut web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(listener, web_state).await {
            tracing::error!("Web server exited with error: {}", e);
        }
    });

    println!("{}", BANNER);
    println!("{}", url);

    if app_config.open_browser {
        if let Err(e) = browser::open(&url) {
            tracing::warn!("Failed to open browser automatically: {}", e);
        }
    }

    // No graceful drain: open sockets die with the process.
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Ctrl-C received, shutting down."),
            Err(err) => tracing::error!("Failed to listen for Ctrl-C signal: {}", err),
        },
        _ = &mut web_task => {
            tracing::error!("Web server stopped unexpectedly.");
            std::process::exit(1);
        }
        _ = &mut watcher_task => {
            tracing::error!("Watcher stopped unexpectedly.");
            std::process::exit(1);
        }
    }

    Ok(())
}
