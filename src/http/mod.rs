//! HTTP layer: update submission and queries, health, metrics.

pub mod handler;

pub use handler::create_router;
