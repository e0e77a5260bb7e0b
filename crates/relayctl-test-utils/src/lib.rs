#![deny(unsafe_code)]

//! Shared test utilities for the relayctl workspace.
//!
//! Provides a scriptable [`MockTransport`](mock::MockTransport), config
//! builders, and tracing helpers so that individual crate tests stay concise
//! and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! relayctl-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod mock;
pub mod session;
pub mod tracing_setup;
