//! # kiln-common
//!
//! Shared types for the Kiln build pipeline:
//! - Common error type and result alias
//! - Build-environment interpolation

#![warn(missing_docs)]

pub mod error;
pub mod interpolate;

pub use error::{KilnError, KilnResult};
pub use interpolate::{EnvVar, interpolate};
