//! Shared types for portico

pub mod error;

pub use error::{ErrorReport, PorticoError, Result};
