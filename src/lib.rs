//! # Partition Chain
//!
//! Compact, bit-exact record and replay of long sequences of graph
//! partitions produced by Markov-chain sampling.
//!
//! ## Core Concepts
//!
//! - **Record**: Streams partition states into a line-oriented archive, a
//!   full snapshot first and then per-district arrival deltas
//! - **Replay**: Reconstructs the exact sequence, holding only the current state
//! - **Codec**: The external compressor pipeline an archive passes through
//! - **Graph hash**: Fingerprint guarding against replay on the wrong graph
//! - **History**: Catalog resolving chain identifiers to archives
//!
//! ## Example
//!
//! ```ignore
//! use partition_chain::{record_chain, Graph, PartitionState, RecordConfig, Replay, ReplayConfig};
//! use partition_chain::codec::{CodecMode, ProcessCodec};
//!
//! let graph = Graph::from_edges(4, [(0, 1), (1, 2), (2, 3)]);
//! let states = vec![
//!     PartitionState::new(vec![0, 0, 1, 1])?,
//!     PartitionState::new(vec![1, 0, 1, 1])?,
//! ];
//!
//! // Record into an xz-compressed archive
//! let config = RecordConfig::default();
//! let codec = ProcessCodec::spawn("run.chain", CodecMode::Write, &config.codec)?;
//! record_chain(states, codec, &config)?;
//!
//! // Replay it
//! for state in Replay::open("run.chain", &graph, &ReplayConfig::default())? {
//!     println!("{:?}", state?);
//! }
//! ```

pub mod chain;
pub mod codec;
pub mod convention;
pub mod error;
pub mod graph;
pub mod history;
pub mod types;

// Re-exports
pub use chain::{
    chain_length, record_chain, Record, RecordConfig, Recorder, Replay, ReplayConfig, ReplayState,
};
pub use codec::{Codec, CodecConfig, CodecExit, CodecMode, MemoryCodec, ProcessCodec, SharedBuffer};
pub use convention::{IndexBase, IndexConvention};
pub use error::{ChainError, ErrorKind, Result};
pub use graph::{compute_graph_hash, Graph, GraphHash};
pub use history::{
    ChainFilter, ChainMetadata, HistoryConfig, History, HttpTransport, Transport, UploadConfig,
    Uploader,
};
pub use types::{
    Delta, DistrictId, NodeId, PartitionState, RecordMode, RecordSummary, MAX_DISTRICTS,
};
