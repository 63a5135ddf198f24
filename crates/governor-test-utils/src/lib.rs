#![deny(unsafe_code)]

//! Shared test utilities for the Governor workspace.
//!
//! Provides config builders, scripted tools and a fault-injecting engine so
//! that individual crate tests stay concise. Tests capture tracing output
//! with `#[test_log::test]`.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! governor-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod engine;
pub mod tools;
