//! peerviz-core: wire codec, graph model and end barrier.
//! Everything the aggregation server shares with producers and renderers,
//! with no socket ownership of its own.

pub mod barrier;
pub mod codec;
pub mod error;
pub mod graph;
pub mod snapshot;

pub use barrier::{EndBarrier, EndOutcome};
pub use codec::{END_ACK, Event, EventCodec, NO_GROUP_SENTINEL};
pub use error::{GraphError, ProtocolError};
pub use graph::GraphModel;
pub use snapshot::{EdgeSnapshot, GraphSnapshot, GroupSnapshot, Rgba, VertexSnapshot};
