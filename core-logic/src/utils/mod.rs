//! # Utilities Module
//!
//! Internal utility modules for the core-logic crate.

pub(crate) mod logger;

pub use logger::{setup_logger, SPAM_RESULT_TARGET};
