//! `Armada` Core Library
//!
//! Shared functionality for `Armada` components:
//! - Settings resolution and hierarchy
//! - Tracing/logging initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
