//! Route tables

pub mod metrics;
pub mod operations;
pub mod requests;
