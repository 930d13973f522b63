//! Classbook API Library
//!
//! This crate contains the HTTP server components for Classbook.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod tts;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
