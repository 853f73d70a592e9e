//! orchestration-service: external service orchestration, metering and
//! compliance auditing for the care platform.
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::{build_router, AppState, Application};
