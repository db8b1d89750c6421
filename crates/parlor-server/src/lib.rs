//! # parlor-server
//!
//! WebSocket front end for the Parlor chat core: configuration, HS256
//! tokens, the `/ws`, `/health` and `/stats` endpoints and Prometheus
//! export.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
