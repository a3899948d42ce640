//! Switchboard Client -- library crate for the multi-dispatcher client.
//!
//! Re-exports the runtime modules so integration tests and the binary can
//! reach the connection, pool, manager loop and dispatcher types.

pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod manager_task;
pub mod notice;
pub mod persistence;
pub mod pool;
pub mod quic_transport;
pub mod transport;
pub mod zone_loader;

#[cfg(test)]
pub(crate) mod mock;

use std::path::PathBuf;

pub use client::Client;
pub use config::ClientConfig;
pub use dispatcher::{Disposition, Dispatcher, Request};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
