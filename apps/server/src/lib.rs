//! Hemocalc server
//!
//! Blood-loss estimation requests for surgical operations:
//! - per-user drafts that collect operations with haemoglobin measurements
//! - a `Draft → Formed → Completed` lifecycle with logical delete
//! - Nadler-based estimates computed once, at completion, by a moderator
//! - a moderated operation catalog

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod request_context;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
