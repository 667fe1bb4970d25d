//! # strata-common
//!
//! Shared utilities and types for the Strata container engine.
//!
//! This crate provides common functionality used across all Strata crates:
//! - Common error types
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{StrataError, StrataResult};
pub use paths::StrataPaths;
