//! # simrelay-core
//!
//! Core types, errors, and utilities for the simrelay simulation relay.
//!
//! This crate provides:
//! - [`RelayError`] - Error type for all simrelay operations
//! - [`logging`] - Tracing setup and log management utilities
//! - [`types`] - Run state, fragments and acknowledgements shared across crates
//! - [`config`] - YAML configuration loading and validation
//!
//! ## Example
//!
//! ```no_run
//! use simrelay_core::{RelayConfig, logging};
//!
//! fn main() -> simrelay_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = RelayConfig::load_or_default(None)?;
//!     tracing::info!(program = %config.worker.program, "configuration ready");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use config::{ArtifactConfig, BusConfig, HttpConfig, RelayConfig, WorkerConfig};
pub use error::{RelayError, Result};
pub use logging::{LogGuard, init_logging};
pub use types::{
    Acknowledgement, ControlCommand, ControlMessage, Fragment, RunConfig, RunId, RunState,
    StatusSnapshot,
};
