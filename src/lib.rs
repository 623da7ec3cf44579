//! D3 Server Library
//!
//! Connection and session engine for a game-protocol server emulator: an
//! authentication gateway and a game/session server, both speaking a framed
//! binary protocol over TCP.
//!
//! # Features
//!
//! - `admin_api` - HTTP endpoint for health, Prometheus metrics, status, sessions and audit records (enabled by default)

pub mod audit;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod net;
pub mod server;
pub mod session;
pub mod store;

#[cfg(feature = "admin_api")]
pub mod admin;
