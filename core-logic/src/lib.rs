//! # Core Logic - Shared Utilities for the Tangle Load Generator
//!
//! This crate provides the pieces shared by the spammer engine and anything that
//! drives it: the data model, typed errors, run metrics, persistence and logging.
//!
//! ## Modules
//!
//! - [`config`] - Node and security level definitions
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Run counters and the summary formulas
//! - [`store`] - SQLite transaction cache and per-run tracking
//! - [`utils`] - Logging setup

pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub(crate) mod utils;

pub use config::{Node, SecurityLevel};
pub use error::{ConfigError, CoreError, DatabaseError, NetworkError, PowError};
pub use metrics::{Summary, Tally};
pub use store::{RunLedger, StoredTransaction, TxStore};

pub use utils::{setup_logger, SPAM_RESULT_TARGET};
