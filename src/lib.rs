//! Flow aggregation agent.
//!
//! Receives flow export datagrams, merges records describing the same flow,
//! rolls ephemeral ports up to a wildcard and periodically emits one JSON
//! document per aggregated flow.

pub mod agent;
pub mod aggregator;
pub mod clock;
pub mod config;
pub mod export;
pub mod feeder;
pub mod flow;
pub mod listener;
pub mod payload;
pub mod rollup;
