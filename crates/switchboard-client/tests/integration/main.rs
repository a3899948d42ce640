//! Integration test entry point for switchboard-client.
//!
//! Run with: cargo test --test integration

mod harness;
mod transport;
mod failover;
