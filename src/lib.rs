//! chunkwise library crate
//!
//! Exposes the run engine so the binary, benchmarks and tests can drive it
//! without going through CLI startup.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod extract;
pub mod git_ops;
pub mod ledger;
pub mod logging;
pub mod oracle;
pub mod orchestrator;
pub mod reconcile;
pub mod record;
pub mod sizing;
pub mod source;
pub mod util;
