// src/config.rs
use crate::error::Result;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:3456";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Directory to serve and watch (defaults to the current directory)
    #[clap(help = "Directory to serve and watch (defaults to the current directory)")]
    pub root: Option<PathBuf>,

    /// HTTP address to listen on (e.g., "127.0.0.1:3456")
    #[clap(
        short,
        long,
        value_parser,
        help = "HTTP address to listen on (e.g., \"127.0.0.1:3456\")"
    )]
    pub addr: Option<String>,

    /// Path to a configuration file (e.g., toil.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., toil.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Do not open a browser window on startup
    #[clap(long, help = "Do not open a browser window on startup")]
    pub no_browser: bool,

    /// How often to scan the tree for changes, in milliseconds
    #[clap(
        long,
        value_parser,
        help = "How often to scan the tree for changes, in milliseconds"
    )]
    pub poll_interval_ms: Option<u64>,

    /// Minimum spacing between two reloads, in milliseconds
    #[clap(
        long,
        value_parser,
        help = "Minimum spacing between two reloads, in milliseconds"
    )]
    pub debounce_ms: Option<u64>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Directory to serve
    pub root: Option<PathBuf>,
    /// Listen address
    pub addr: Option<String>,
    /// Open a browser on startup
    pub open_browser: Option<bool>,
    /// Poll period in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// Reload spacing in milliseconds
    pub debounce_ms: Option<u64>,
    /// Log level
    pub log_level: Option<String>,
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory served over HTTP and polled for changes
    pub root: PathBuf,
    /// HTTP listen address
    pub addr: String,
    /// Whether to open a browser tab on startup
    pub open_browser: bool,
    /// Period between two change scans
    pub poll_interval: Duration,
    /// Minimum spacing between two reload broadcasts
    pub debounce: Duration,
    /// Log level
    pub log_level: String,
}

impl AppConfig {
    /// Loads the application configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merges already-parsed CLI arguments over `toil.toml`, `TOIL_*` variables, and defaults.
    pub fn from_cli(cli_args: CliArgs) -> Result<Self> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("toil.toml"));

        // Default log level from environment variable TOIL_LOG_LEVEL, then "info"
        let default_log_level =
            std::env::var("TOIL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fig = Figment::new()
            .merge(Serialized::defaults(FileConfig {
                root: Some(PathBuf::from(".")),
                addr: Some(DEFAULT_ADDR.to_string()),
                open_browser: Some(true),
                poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
                debounce_ms: Some(0),
                log_level: Some(default_log_level.clone()),
            }))
            .merge(Toml::file(config_file_path).nested())
            .merge(
                Env::prefixed("TOIL_")
                    .map(|key| key.as_str().replace("__", ".").into())
                    .global(),
            ); // TOIL_ADDR, TOIL_DEBOUNCE_MS etc. beat the file

        // CLI flags take precedence over everything else, but only when given.
        let mut final_fig = fig;
        if let Some(root) = cli_args.root {
            final_fig = final_fig.merge(Serialized::global("root", root));
        }
        if let Some(addr) = cli_args.addr {
            final_fig = final_fig.merge(Serialized::global("addr", addr));
        }
        if cli_args.no_browser {
            final_fig = final_fig.merge(Serialized::global("open_browser", false));
        }
        if let Some(ms) = cli_args.poll_interval_ms {
            final_fig = final_fig.merge(Serialized::global("poll_interval_ms", ms));
        }
        if let Some(ms) = cli_args.debounce_ms {
            final_fig = final_fig.merge(Serialized::global("debounce_ms", ms));
        }
        if let Some(level) = cli_args.log_level {
            final_fig = final_fig.merge(Serialized::global("log_level", level));
        }

        let merged_config: FileConfig = final_fig.select("toil").extract()?;

        Ok(AppConfig {
            root: merged_config.root.unwrap_or_else(|| PathBuf::from(".")),
            addr: merged_config
                .addr
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            open_browser: merged_config.open_browser.unwrap_or(true),
            poll_interval: Duration::from_millis(
                merged_config
                    .poll_interval_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            debounce: Duration::from_millis(merged_config.debounce_ms.unwrap_or(0)),
            log_level: merged_config.log_level.unwrap_or(default_log_level),
        })
    }
}
