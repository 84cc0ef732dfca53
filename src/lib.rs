//! Catalog image embedding pipeline.
//!
//! Candidate rows are read from Postgres, their images fetched and encoded in
//! batches, and the vectors written to a vector store together with a ledger
//! row per item so the next run skips it.

pub mod batch;
pub mod catalog;
pub mod config;
pub mod encoder;
pub mod fetch;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod shard;
pub mod sink;
pub mod sweep;
pub mod telemetry;
pub mod upload;
pub mod vector_store;

pub mod util {
    pub mod db;
    pub mod env;
}

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{Pipeline, RunState, RunSummary};
