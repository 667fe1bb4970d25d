//! # strata-oci
//!
//! OCI (Open Container Initiative) runtime specification types for Strata.
//!
//! Only the parts of `config.json` the engine reads or rewrites are modeled:
//! process identity and capabilities, namespaces, seccomp and resources.

#![warn(missing_docs)]

pub mod runtime;

pub use runtime::Spec;
