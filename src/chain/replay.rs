//! Chain replay.

use super::line;
use crate::codec::{Codec, CodecConfig, CodecExit, CodecMode, ProcessCodec};
use crate::convention::IndexConvention;
use crate::error::{ChainError, Result};
use crate::graph::Graph;
use crate::history::{fetch_cached_file, ChainMetadata, Transport};
use crate::types::{DistrictId, PartitionState, RecordMode, MAX_DISTRICTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Replay configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Must match the mode the chain was recorded in.
    pub mode: RecordMode,

    /// Must match the convention the chain was recorded with.
    pub convention: IndexConvention,

    /// Pipeline used to read archives.
    pub codec: CodecConfig,

    /// Where archives fetched from a catalog are cached.
    pub cache_dir: PathBuf,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: RecordMode::default(),
            convention: IndexConvention::default(),
            codec: CodecConfig::default(),
            cache_dir: std::env::temp_dir(),
        }
    }
}

/// Decoder lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayState {
    /// No line read yet; the next line must be a full snapshot.
    AwaitingFirst,
    /// Holding a state; the next line advances it.
    Streaming,
    /// End of stream or failure. Nothing more is yielded.
    Terminated,
}

/// Reconstructs a chain of partition states from a codec.
///
/// Only the current state is held, so memory stays O(nodes) for any chain
/// length.
pub struct Replay<C: Codec> {
    codec: C,
    mode: RecordMode,
    convention: IndexConvention,
    node_count: usize,
    state: ReplayState,
    current: Option<PartitionState>,
    line: Vec<u8>,
    lines_read: u64,
    /// Per-node stamp of the last delta line that moved it.
    moved_on: Vec<u64>,
}

impl Replay<ProcessCodec> {
    /// Replay a local archive through the configured process pipeline.
    pub fn open(path: impl AsRef<Path>, graph: &Graph, config: &ReplayConfig) -> Result<Self> {
        graph.require_dense()?;
        let codec = ProcessCodec::spawn(path, CodecMode::Read, &config.codec)?;
        Self::with_codec(codec, graph, config)
    }

    /// Replay a chain listed in a catalog.
    ///
    /// The graph hash is checked before anything is fetched or read. The
    /// archive is cached as `<identifier>.chain` in `config.cache_dir`; an
    /// identifier that is not a plain file name is rejected.
    pub fn from_metadata(
        graph: &Graph,
        metadata: &ChainMetadata,
        transport: &dyn Transport,
        config: &ReplayConfig,
    ) -> Result<Self> {
        metadata.verify_graph(graph)?;

        let file_name = metadata.archive_file_name()?;
        let url = metadata.archive_url()?;
        std::fs::create_dir_all(&config.cache_dir)?;
        let path = config.cache_dir.join(file_name);
        let outcome = fetch_cached_file(transport, &url, &path)?;
        debug!(identifier = %metadata.identifier, ?outcome, "chain archive ready");

        Self::open(&path, graph, config)
    }
}

impl<C: Codec> Replay<C> {
    pub fn new(codec: C, graph: &Graph, config: &ReplayConfig) -> Result<Self> {
        graph.require_dense()?;
        Self::with_codec(codec, graph, config)
    }

    /// `graph` must already be known to be dense.
    fn with_codec(codec: C, graph: &Graph, config: &ReplayConfig) -> Result<Self> {
        if codec.mode() != CodecMode::Read {
            return Err(ChainError::InvalidState(
                "replay needs a codec opened for reading".into(),
            ));
        }

        Ok(Self {
            codec,
            mode: config.mode,
            convention: config.convention,
            node_count: graph.node_count(),
            state: ReplayState::AwaitingFirst,
            current: None,
            line: Vec::new(),
            lines_read: 0,
            moved_on: Vec::new(),
        })
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Number of records decoded so far.
    pub fn steps(&self) -> u64 {
        self.lines_read
    }

    /// The most recently decoded state.
    pub fn current(&self) -> Option<&PartitionState> {
        self.current.as_ref()
    }

    /// Decode the next record.
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly. After an error
    /// the codec is stopped and every later call returns `Ok(None)`.
    pub fn advance(&mut self) -> Result<Option<&PartitionState>> {
        if self.state == ReplayState::Terminated {
            return Ok(None);
        }

        self.line.clear();
        let read = match self.codec.read_line(&mut self.line) {
            Ok(read) => read,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        if read == 0 {
            self.finish()?;
            return Ok(None);
        }

        self.lines_read += 1;
        if !self.line.ends_with(b"\n") {
            return Err(self.reject("unterminated record at end of stream"));
        }

        match (self.state, self.mode) {
            (ReplayState::AwaitingFirst, _) | (_, RecordMode::Snapshot) => self.read_snapshot()?,
            (_, RecordMode::Delta) => self.read_delta()?,
        }
        self.state = ReplayState::Streaming;
        Ok(self.current.as_ref())
    }

    /// Abandon the replay, killing the codec.
    pub fn terminate(&mut self) -> Result<()> {
        self.state = ReplayState::Terminated;
        self.current = None;
        self.codec.terminate()
    }

    fn read_snapshot(&mut self) -> Result<()> {
        let assignment = match line::parse_snapshot(&self.line, self.convention) {
            Ok(assignment) => assignment,
            Err(reason) => return Err(self.reject(reason)),
        };
        if assignment.len() != self.node_count {
            let reason = format!(
                "snapshot covers {} nodes, graph has {}",
                assignment.len(),
                self.node_count
            );
            return Err(self.reject(reason));
        }
        match PartitionState::new(assignment) {
            Ok(state) => self.current = Some(state),
            Err(e) => return Err(self.reject(e.to_string())),
        }
        Ok(())
    }

    fn read_delta(&mut self) -> Result<()> {
        let arrivals = match line::parse_delta(&self.line, self.convention) {
            Ok(arrivals) => arrivals,
            Err(reason) => return Err(self.reject(reason)),
        };

        if self.moved_on.len() != self.node_count {
            self.moved_on = vec![0; self.node_count];
        }
        let stamp = self.lines_read;
        for (district, nodes) in arrivals.iter().enumerate() {
            if district >= MAX_DISTRICTS && !nodes.is_empty() {
                return Err(self.reject(format!("district position {district} out of range")));
            }
            for &node in nodes {
                if node >= self.node_count {
                    let reason = format!("node {node} is not in the graph ({} nodes)", self.node_count);
                    return Err(self.reject(reason));
                }
                if self.moved_on[node] == stamp {
                    return Err(self.reject(format!("node {node} appears twice in one delta")));
                }
                self.moved_on[node] = stamp;
            }
        }

        let Some(current) = self.current.as_mut() else {
            return Err(self.reject("delta before the first snapshot"));
        };
        for (district, nodes) in arrivals.iter().enumerate() {
            for &node in nodes {
                current.assign(node, district as DistrictId);
            }
        }
        Ok(())
    }

    /// Close the codec after a clean end of stream.
    fn finish(&mut self) -> Result<()> {
        self.state = ReplayState::Terminated;
        self.current = None;
        match self.codec.close() {
            Ok(CodecExit::Success) => {
                debug!(steps = self.lines_read, "replay finished");
                Ok(())
            }
            Ok(CodecExit::Failed { stage, code }) => Err(ChainError::ProcessExit { stage, code }),
            Ok(CodecExit::Terminated) => Err(ChainError::Terminated),
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    fn reject(&mut self, reason: impl Into<String>) -> ChainError {
        let err = ChainError::format(self.lines_read, reason);
        warn!(error = %err, "rejecting chain record");
        self.stop();
        err
    }

    fn stop(&mut self) {
        self.state = ReplayState::Terminated;
        self.current = None;
        if let Err(e) = self.codec.terminate() {
            warn!(error = %e, "failed to terminate codec");
        }
    }
}

impl<C: Codec> Iterator for Replay<C> {
    type Item = Result<PartitionState>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().map(|state| state.cloned()).transpose()
    }
}

/// Count the records in an archive without decoding them.
pub fn chain_length(path: impl AsRef<Path>, config: &ReplayConfig) -> Result<u64> {
    let mut codec = ProcessCodec::spawn(path, CodecMode::Read, &config.codec)?;
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        if codec.read_line(&mut line)? == 0 {
            break;
        }
        count += 1;
    }
    match codec.close()? {
        CodecExit::Success => Ok(count),
        CodecExit::Failed { stage, code } => Err(ChainError::ProcessExit { stage, code }),
        CodecExit::Terminated => Err(ChainError::Terminated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MemoryCodec, SharedBuffer};

    fn replay(records: &str, nodes: usize, mode: RecordMode) -> Replay<MemoryCodec> {
        let config = ReplayConfig {
            mode,
            ..Default::default()
        };
        Replay::new(
            MemoryCodec::reader(SharedBuffer::from_bytes(records)),
            &Graph::with_nodes(nodes),
            &config,
        )
        .unwrap()
    }

    #[test]
    fn test_scenario_delta() {
        let mut replay = replay("[1,1,2,2]\n[[],[0]]\n", 4, RecordMode::Delta);
        assert_eq!(replay.state(), ReplayState::AwaitingFirst);

        let first = replay.advance().unwrap().unwrap().clone();
        assert_eq!(first.to_external(crate::IndexBase::One), vec![1, 1, 2, 2]);
        assert_eq!(replay.state(), ReplayState::Streaming);

        let second = replay.advance().unwrap().unwrap();
        assert_eq!(second.to_external(crate::IndexBase::One), vec![2, 1, 2, 2]);

        assert!(replay.advance().unwrap().is_none());
        assert_eq!(replay.state(), ReplayState::Terminated);
        assert_eq!(replay.steps(), 2);
    }

    #[test]
    fn test_snapshot_mode() {
        let states: Vec<_> = replay("[1,2]\n[2,2]\n[2,1]\n", 2, RecordMode::Snapshot)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states[2].assignment(), &[1, 0]);
    }

    #[test]
    fn test_empty_stream_is_clean_end() {
        let mut replay = replay("", 2, RecordMode::Delta);
        assert!(replay.advance().unwrap().is_none());
        assert_eq!(replay.state(), ReplayState::Terminated);
    }

    #[test]
    fn test_bare_number_is_format_error() {
        let mut replay = replay("[1,2]\n5\n[[],[0]]\n", 2, RecordMode::Delta);
        replay.advance().unwrap();
        let err = replay.advance().unwrap_err();
        assert!(matches!(err, ChainError::Format { line: 2, .. }));
        assert!(replay.advance().unwrap().is_none());
        assert!(replay.next().is_none());
    }

    #[test]
    fn test_snapshot_length_must_match_graph() {
        let mut replay = replay("[1,2,1]\n", 2, RecordMode::Delta);
        assert!(matches!(replay.advance(), Err(ChainError::Format { line: 1, .. })));
    }

    #[test]
    fn test_delta_node_outside_graph() {
        let mut replay = replay("[1,2]\n[[7]]\n", 2, RecordMode::Delta);
        replay.advance().unwrap();
        assert!(matches!(replay.advance(), Err(ChainError::Format { .. })));
    }

    #[test]
    fn test_delta_duplicate_node() {
        let mut replay = replay("[1,2]\n[[0],[0]]\n", 2, RecordMode::Delta);
        replay.advance().unwrap();
        assert!(matches!(replay.advance(), Err(ChainError::Format { .. })));
    }

    #[test]
    fn test_same_node_in_consecutive_deltas() {
        let states: Vec<_> = replay("[1,2]\n[[],[0]]\n[[0],[]]\n", 2, RecordMode::Delta)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(states[1].assignment(), &[1, 1]);
        assert_eq!(states[2].assignment(), &[0, 1]);
    }

    #[test]
    fn test_unterminated_line_is_format_error() {
        let mut replay = replay("[1,2]\n[[],[0]", 2, RecordMode::Delta);
        replay.advance().unwrap();
        assert!(matches!(replay.advance(), Err(ChainError::Format { .. })));
    }

    #[test]
    fn test_failed_codec_exit_surfaces() {
        let codec = MemoryCodec::reader(SharedBuffer::from_bytes("[1]\n")).with_exit(
            CodecExit::Failed {
                stage: "xz".into(),
                code: Some(1),
            },
        );
        let mut replay = Replay::new(codec, &Graph::with_nodes(1), &ReplayConfig::default()).unwrap();
        assert!(replay.advance().unwrap().is_some());
        assert!(matches!(replay.advance(), Err(ChainError::ProcessExit { .. })));
        assert!(replay.advance().unwrap().is_none());
    }

    #[test]
    fn test_sparse_graph_rejected() {
        let mut graph = Graph::new();
        graph.add_node(3);
        let result = Replay::new(
            MemoryCodec::reader(SharedBuffer::new()),
            &graph,
            &ReplayConfig::default(),
        );
        assert!(matches!(result, Err(ChainError::InvalidGraph(_))));
    }
}
