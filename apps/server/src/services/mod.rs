//! Business logic services

pub mod catalog;
pub mod lifecycle;

pub use catalog::CatalogService;
pub use lifecycle::{resolve_item, Caller, RequestLifecycle};
