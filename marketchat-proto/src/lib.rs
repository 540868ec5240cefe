//! Shared wire definitions for the `MarketChat` REST and socket contracts.

pub mod codec;
pub mod event;
pub mod ids;
pub mod message;
pub mod presence;
pub mod rest;
pub mod typing;
