//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the experiment scheduler workspace.
//!
//! - **Mock Repositories**: in-memory implementations of all repository traits
//! - **Mock Ports**: scriptable transfer poller and credential vault
//! - **Database Test Container**: in-memory SQLite with the schema applied
//! - **Test Data Builders**: tasks, workers and staging operations
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
