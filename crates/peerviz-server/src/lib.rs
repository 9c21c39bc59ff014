//! peerviz-server: event aggregation and end barrier server.
//!
//! Accepts one TCP connection per participant, decodes the event stream,
//! applies it to the shared [`peerviz_core::GraphModel`], holds `END`
//! requests at the barrier, and publishes periodic snapshots to a renderer.

pub mod config;
pub mod error;
pub mod publisher;
pub mod server;
pub mod sink;

pub use config::ServerConfig;
pub use error::ServerError;
pub use publisher::SnapshotPublisher;
pub use server::{AggregationServer, ExperimentState, ServerHandle};
pub use sink::{JsonLinesSink, LogSink, SnapshotSink};
