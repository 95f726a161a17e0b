//! Tangle Spammer - load generator for IOTA Tangle networks
//!
//! Continuously builds zero-value bundles, seals them with proof-of-work and
//! broadcasts them through a set of ledger nodes, measuring throughput, error
//! rate and confirmation rate along the way.
//!
//! # Architecture
//!
//! - **[`Spammer`]**: the engine; one run per [`Spammer::start`] call, stopped by
//!   [`Spammer::stop`] or the configured timeout
//! - **[`Worker`]**: per-node tip fetcher and spam worker tasks
//! - **[`TipStrategy`]**: how tips are chosen (node tip selection or non-zero promote)
//! - **[`PowFn`]**: pluggable nonce search, with single and multi-threaded Curl
//! - **[`NodeApi`]**: the remote node, [`HttpNodeApi`] for IRI's JSON API
//! - **[`SpammerCtrl`]**: owns a spammer, swaps node / hash function and fans
//!   metrics out to listeners
//!
//! # Quick Start
//!
//! ```bash
//! # Run against one node until Ctrl+C
//! cargo run -p tangle-spammer -- --node https://nodes.example.org:443 run
//!
//! # Use a config file and persist sent transactions
//! cargo run -p tangle-spammer -- --config config/config.toml --db spam.db run
//!
//! # List hash functions
//! cargo run -p tangle-spammer -- pows
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use core_logic::Node;
//! use tangle_spammer::{best_pow, Spammer, SpammerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SpammerConfig::builder()
//!     .node(Node::new("http://localhost:14265", false))
//!     .destination_address("A".repeat(81))
//!     .tag("LOADTEST")
//!     .build()?;
//!
//! let spammer = Spammer::new(config, best_pow());
//! spammer.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod controller;
pub mod curl;
pub mod metrics;
pub mod node;
pub mod pow;
pub mod spammer;
pub mod strategy;
pub mod ternary;
pub mod transaction;
pub mod worker;

pub use bundle::Transfer;
pub use config::{FileConfig, SpammerConfig, SpammerConfigBuilder};
pub use controller::{CtrlOptions, SpammerCtrl, StatusMsg};
pub use metrics::{Metric, MetricEvent, TxData};
pub use node::{Connector, HttpConnector, HttpNodeApi, NodeApi, NodeInfo, TipHashes};
pub use pow::{available_pow_types, best_pow, pow_by_name, seal_bundle, PowCurl, PowCurlParallel, PowFn};
pub use spammer::Spammer;
pub use strategy::{TipPair, TipStrategy};
pub use transaction::Transaction;
pub use worker::{ShallowTransaction, Worker};
