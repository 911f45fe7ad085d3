//! Chain recording.

use super::line;
use crate::codec::{Codec, CodecConfig, CodecExit, CodecMode, ProcessCodec};
use crate::convention::IndexConvention;
use crate::error::{ChainError, Result};
use crate::types::{Delta, PartitionState, RecordMode, RecordSummary};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Recorder configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Delta or snapshot records after the first line.
    pub mode: RecordMode,

    /// Bases for ids in the written records.
    pub convention: IndexConvention,

    /// Pipeline used by [`Recorder::create`].
    pub codec: CodecConfig,
}

/// Writes a chain of partition states into a codec.
///
/// The first state is written as a full snapshot. In delta mode every later
/// state is written as the delta against the state before it.
pub struct Recorder<C: Codec> {
    codec: C,
    mode: RecordMode,
    convention: IndexConvention,
    previous: Option<PartitionState>,
    delta: Delta,
    line: Vec<u8>,
    steps: u64,
    start_timestamp: i64,
    finished: bool,
}

impl Recorder<ProcessCodec> {
    /// Record into an archive file through the configured process pipeline.
    pub fn create(path: impl AsRef<Path>, config: &RecordConfig) -> Result<Self> {
        let codec = ProcessCodec::spawn(path, CodecMode::Write, &config.codec)?;
        Self::new(codec, config)
    }
}

impl<C: Codec> Recorder<C> {
    pub fn new(codec: C, config: &RecordConfig) -> Result<Self> {
        if codec.mode() != CodecMode::Write {
            return Err(ChainError::InvalidState(
                "recorder needs a codec opened for writing".into(),
            ));
        }
        Ok(Self {
            codec,
            mode: config.mode,
            convention: config.convention,
            previous: None,
            delta: Delta::new(),
            line: Vec::new(),
            steps: 0,
            start_timestamp: chrono::Utc::now().timestamp(),
            finished: false,
        })
    }

    /// Number of states written so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Write the next state of the chain.
    pub fn push(&mut self, state: &PartitionState) -> Result<()> {
        if self.finished {
            return Err(ChainError::InvalidState("recorder is already finished".into()));
        }

        self.line.clear();
        match &self.previous {
            None => line::encode_snapshot(state, self.convention, &mut self.line)?,
            Some(previous) => {
                if previous.node_count() != state.node_count() {
                    return Err(ChainError::InvalidState(format!(
                        "step {} has {} nodes, chain started with {}",
                        self.steps,
                        state.node_count(),
                        previous.node_count()
                    )));
                }
                match self.mode {
                    RecordMode::Snapshot => {
                        line::encode_snapshot(state, self.convention, &mut self.line)?
                    }
                    RecordMode::Delta => {
                        self.delta.compute(previous, state)?;
                        line::encode_delta(&self.delta, self.convention, &mut self.line)?
                    }
                }
            }
        }

        if let Err(e) = self.codec.write_line(&self.line) {
            self.abort();
            return Err(e);
        }

        match &mut self.previous {
            Some(previous) => previous.clone_from(state),
            None => self.previous = Some(state.clone()),
        }
        self.steps += 1;
        Ok(())
    }

    /// Close the codec and wait for it to finish writing the archive.
    pub fn finish(mut self) -> Result<RecordSummary> {
        self.close()
    }

    fn close(&mut self) -> Result<RecordSummary> {
        if self.finished {
            return Err(ChainError::InvalidState("recorder is already finished".into()));
        }
        self.finished = true;
        self.previous = None;

        let exit = self.codec.close()?;
        let summary = RecordSummary {
            steps: self.steps,
            start_timestamp: self.start_timestamp,
            end_timestamp: chrono::Utc::now().timestamp(),
        };
        match exit {
            CodecExit::Success => {
                debug!(steps = summary.steps, "chain recorded");
                Ok(summary)
            }
            CodecExit::Failed { stage, code } => Err(ChainError::ProcessExit { stage, code }),
            CodecExit::Terminated => Err(ChainError::Terminated),
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        self.previous = None;
        if let Err(e) = self.codec.terminate() {
            warn!(error = %e, "failed to terminate codec after write error");
        }
    }
}

impl<C: Codec> Drop for Recorder<C> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.close() {
                warn!(error = %e, "unfinished recorder failed to close its codec");
            }
        }
    }
}

/// Records every state pulled through it.
///
/// Each state is written before it is handed back to the caller. Once the
/// source is exhausted the recorder is finished and the summary is kept.
pub struct Record<I, C: Codec> {
    source: I,
    recorder: Option<Recorder<C>>,
    summary: Option<RecordSummary>,
}

impl<I, C> Record<I, C>
where
    I: Iterator<Item = PartitionState>,
    C: Codec,
{
    pub fn new(source: impl IntoIterator<IntoIter = I>, codec: C, config: &RecordConfig) -> Result<Self> {
        Ok(Self {
            source: source.into_iter(),
            recorder: Some(Recorder::new(codec, config)?),
            summary: None,
        })
    }

    /// Pull, record and return the next state; `Ok(None)` once the chain
    /// has ended and the archive is complete.
    pub fn step(&mut self) -> Result<Option<PartitionState>> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(None);
        };

        match self.source.next() {
            Some(state) => {
                if let Err(e) = recorder.push(&state) {
                    self.recorder = None;
                    return Err(e);
                }
                Ok(Some(state))
            }
            None => {
                if let Some(recorder) = self.recorder.take() {
                    self.summary = Some(recorder.finish()?);
                }
                Ok(None)
            }
        }
    }

    /// Summary of the finished recording.
    pub fn summary(&self) -> Option<&RecordSummary> {
        self.summary.as_ref()
    }
}

impl<I, C> Iterator for Record<I, C>
where
    I: Iterator<Item = PartitionState>,
    C: Codec,
{
    type Item = Result<PartitionState>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Record a whole chain and return its summary.
pub fn record_chain<C: Codec>(
    states: impl IntoIterator<Item = PartitionState>,
    codec: C,
    config: &RecordConfig,
) -> Result<RecordSummary> {
    let mut recorder = Recorder::new(codec, config)?;
    for state in states {
        recorder.push(&state)?;
    }
    recorder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MemoryCodec, SharedBuffer};

    fn state(districts: &[u32]) -> PartitionState {
        PartitionState::new(districts.to_vec()).unwrap()
    }

    #[test]
    fn test_first_line_is_snapshot_then_deltas() {
        let buffer = SharedBuffer::new();
        let summary = record_chain(
            vec![state(&[0, 0, 1, 1]), state(&[1, 0, 1, 1]), state(&[1, 0, 1, 1])],
            MemoryCodec::writer(buffer.clone()),
            &RecordConfig::default(),
        )
        .unwrap();

        assert_eq!(summary.steps, 3);
        assert!(summary.end_timestamp >= summary.start_timestamp);
        assert_eq!(buffer.lines(), vec!["[1,1,2,2]", "[[],[0]]", "[[],[]]"]);
    }

    #[test]
    fn test_snapshot_mode() {
        let buffer = SharedBuffer::new();
        let config = RecordConfig {
            mode: RecordMode::Snapshot,
            ..Default::default()
        };
        record_chain(
            vec![state(&[0, 1]), state(&[1, 1])],
            MemoryCodec::writer(buffer.clone()),
            &config,
        )
        .unwrap();
        assert_eq!(buffer.lines(), vec!["[1,2]", "[2,2]"]);
    }

    #[test]
    fn test_node_count_change_rejected() {
        let mut recorder =
            Recorder::new(MemoryCodec::writer(SharedBuffer::new()), &RecordConfig::default())
                .unwrap();
        recorder.push(&state(&[0, 1])).unwrap();
        assert!(matches!(
            recorder.push(&state(&[0, 1, 1])),
            Err(ChainError::InvalidState(_))
        ));
        assert_eq!(recorder.steps(), 1);
    }

    #[test]
    fn test_failed_exit_is_process_error() {
        let codec = MemoryCodec::writer(SharedBuffer::new()).with_exit(CodecExit::Failed {
            stage: "xz".into(),
            code: Some(1),
        });
        let result = record_chain(vec![state(&[0])], codec, &RecordConfig::default());
        assert!(matches!(result, Err(ChainError::ProcessExit { .. })));
    }

    #[test]
    fn test_reader_codec_rejected() {
        let result = Recorder::new(MemoryCodec::reader(SharedBuffer::new()), &RecordConfig::default());
        assert!(matches!(result, Err(ChainError::InvalidState(_))));
    }

    #[test]
    fn test_record_passes_states_through() {
        let buffer = SharedBuffer::new();
        let states = vec![state(&[0, 1]), state(&[1, 1]), state(&[1, 0])];
        let mut record = Record::new(
            states.clone(),
            MemoryCodec::writer(buffer.clone()),
            &RecordConfig::default(),
        )
        .unwrap();

        let mut seen = Vec::new();
        while let Some(state) = record.step().unwrap() {
            assert_eq!(buffer.lines().len(), seen.len() + 1);
            seen.push(state);
        }
        assert_eq!(seen, states);
        assert_eq!(record.summary().unwrap().steps, 3);
        assert!(record.step().unwrap().is_none());
    }

    #[test]
    fn test_drop_closes_codec() {
        let buffer = SharedBuffer::new();
        {
            let mut recorder =
                Recorder::new(MemoryCodec::writer(buffer.clone()), &RecordConfig::default())
                    .unwrap();
            recorder.push(&state(&[0])).unwrap();
        }
        assert_eq!(buffer.lines(), vec!["[1]"]);
    }
}
