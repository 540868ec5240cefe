//! `MarketChat` client synchronization engine.
//!
//! Keeps a locally-optimistic view of marketplace conversations in step with
//! the server's confirmed message stream, across reconnects and failures.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod presentation;
pub mod sync;
pub mod transport;
