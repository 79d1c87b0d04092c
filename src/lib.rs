#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod mention;
pub mod model;
pub mod mutation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use engine::{SyncEngine, SyncEvent, Telemetry};
pub use error::{GatewayError, SyncError};
