//! Recording and replaying partition chains.
//!
//! An archive is a sequence of JSON lines passed through a [`Codec`]. The
//! first line is always a full snapshot of the assignment; in delta mode each
//! later line lists, per district, the nodes that arrived there.
//!
//! [`Codec`]: crate::codec::Codec

pub mod line;
mod record;
mod replay;

pub use record::{record_chain, Record, RecordConfig, Recorder};
pub use replay::{chain_length, Replay, ReplayConfig, ReplayState};
