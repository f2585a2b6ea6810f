//! # Parley Server
//!
//! WebSocket front end for the Parley presence and relay core.
//!
//! - [`config`] - layered file and environment configuration
//! - [`handlers`] - HTTP routes, the upgrade-time credential check, and the per-connection loop
//! - [`metrics`] - Prometheus instrumentation

pub mod config;
pub mod handlers;
pub mod metrics;
