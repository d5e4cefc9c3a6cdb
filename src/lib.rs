// src/lib.rs

#![doc = r#"
# Toil

Toil serves a directory of static files over HTTP and reloads every open
browser tab whenever a file under that directory changes.

## Modules

- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`hub`]: The single owner of all live push connections and the reload broadcaster.
- [`connection`]: The per-connection inbound and outbound pumps.
- [`watcher`]: Polling change detection over the served tree.
- [`web`]: Static file serving, reload-script injection, and the push endpoint.
- [`message`]: The pushed payload.
- [`browser`]: Opening the served URL in a browser.
- [`error`]: Library error types.
"#]

pub mod browser;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod watcher;
pub mod web;

/// Banner printed on startup.
pub const BANNER: &str = concat!("Toil v", env!("CARGO_PKG_VERSION"));
