#![deny(missing_docs)]
//! Linkdrop - a Telegram media relay bot
//!
//! Re-publishes media posted in a private source channel as short,
//! shareable deep links, gated by public-channel membership and per-user
//! rate limits. Link state lives in an in-memory keyed registry with
//! TTL expiry and periodic JSON snapshotting.

/// Telegram bot handlers and dispatch surface
pub mod bot;
/// Configuration management
pub mod config;
/// Ephemeral keyed file registry (core state)
pub mod registry;
/// JSON snapshot persistence with legacy-format upgrade
pub mod snapshot;
