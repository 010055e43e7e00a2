//! Batch aggregation of computing-job usage records into a lattice of
//! multi-resolution dimensional aggregates.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod driver;
pub mod export;
pub mod lattice;
pub mod metric;
pub mod migrate;
pub mod query;
pub mod record;
pub mod store;
pub mod verify;
