#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Creditledger shared types and database plumbing
//!
//! Used by the API server, the billing crate and the background worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{AccountLevel, AccountStatus, BillingCycle, ParseEnumError};
