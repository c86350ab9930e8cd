//! Transfer ingestion and TVL reconstruction for monitored contracts.
//!
//! Library modules shared by the `alert-hub` binary and its tests.

pub mod chain;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod store;
pub mod timing;
pub mod transfers;
pub mod tvl;
