//! Drivemirror.
//!
//! Drivemirror is a web service mirroring a Google Drive. It lists folders, searches files and
//! streams downloads with support for byte ranges, spreading the load over a pool of credentials
//! and rotating them when their quota runs out.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

#[cfg(test)]
mod testutils;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
