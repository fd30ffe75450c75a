//! project-proxy - A cold-start reverse proxy for per-project containers
//!
//! This library provides a loopback reverse proxy that:
//! - Routes `/proxy/<slug>/...` to the project's backend on 127.0.0.1
//! - Starts a stopped project container on first request, serving a
//!   self-refreshing holding page while it boots
//! - Records visitor analytics for each proxied request
//! - Exposes a JSON management API for listing, starting, stopping and
//!   tuning projects
//! - Stops containers that have been idle past their timeout

pub mod api;
pub mod config;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod visitors;
pub mod watchdog;
