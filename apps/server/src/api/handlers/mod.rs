//! Request handlers for API endpoints
//!
//! Handlers extract and authorise, call a service, and shape the response.
//! Business rules live in `services`.

pub mod auth;
pub mod items;
pub mod metrics;
pub mod operations;
pub mod requests;
