// src/browser.rs
use std::io;
use std::process::Command;

/// Name of the program that opens URLs on this platform.
pub fn opener() -> &'static str {
    if cfg!(target_os = "windows") {
        "explorer"
    } else if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

/// Opens `url` in the user's default browser without waiting for it.
pub fn open(url: &str) -> io::Result<()> {
    Command::new(opener()).arg(url).spawn().map(|_| ())
}
