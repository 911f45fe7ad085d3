//! Codec backed by a pipeline of external processes.
//!
//! In write mode record lines flow through the stages in order and the last
//! stage writes the archive file. In read mode the archive feeds the stages in
//! reverse order and the last stage's stdout is read back line by line.

use super::{Codec, CodecExit, CodecMode};
use crate::error::{ChainError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use tracing::{debug, warn};

/// Pipe buffer size; large enough that one record line is one write.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One external program in the pipeline, with its arguments per direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    pub write_args: Vec<String>,
    pub read_args: Vec<String>,
}

impl StageCommand {
    pub fn new<S: Into<String>>(
        program: impl Into<String>,
        write_args: impl IntoIterator<Item = S>,
        read_args: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            program: program.into(),
            write_args: write_args.into_iter().map(Into::into).collect(),
            read_args: read_args.into_iter().map(Into::into).collect(),
        }
    }

    /// A program run without arguments in both directions (e.g. `cat`).
    pub fn passthrough(program: impl Into<String>) -> Self {
        Self::new::<String>(program, [], [])
    }

    /// `xz` with `threads` worker threads; `extreme` enables `-e`.
    pub fn xz(threads: usize, extreme: bool) -> Self {
        let threads = threads.max(1).to_string();
        let mut write_args = vec!["-z".to_string(), "-c".into(), "-T".into(), threads.clone()];
        if extreme {
            write_args.push("-e".into());
        }
        let read_args = vec!["-d".to_string(), "-c".into(), "-T".into(), threads];
        Self {
            program: "xz".into(),
            write_args,
            read_args,
        }
    }

    fn args(&self, mode: CodecMode) -> &[String] {
        match mode {
            CodecMode::Write => &self.write_args,
            CodecMode::Read => &self.read_args,
        }
    }
}

/// Codec pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Line-stream codec that receives record lines directly.
    pub line_codec: Option<StageCommand>,

    /// Generic byte compressor between the line codec and the archive.
    pub compressor: Option<StageCommand>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            line_codec: None,
            compressor: Some(StageCommand::xz(default_threads(), true)),
        }
    }
}

impl CodecConfig {
    /// xz with an explicit thread count and effort level.
    pub fn xz(threads: usize, extreme: bool) -> Self {
        Self {
            line_codec: None,
            compressor: Some(StageCommand::xz(threads, extreme)),
        }
    }

    /// Stages in the order data flows through them for `mode`.
    fn stages(&self, mode: CodecMode) -> Vec<&StageCommand> {
        let mut stages: Vec<_> = [self.line_codec.as_ref(), self.compressor.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        if mode == CodecMode::Read {
            stages.reverse();
        }
        stages
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct Stage {
    program: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl Stage {
    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(status)
    }

    fn kill(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        if let Some(status) = self.child.try_wait()? {
            self.status = Some(status);
            return Ok(status);
        }
        // The child may exit between try_wait and kill; wait still reaps it.
        let _ = self.child.kill();
        self.wait()
    }
}

/// Codec running as a pipeline of child processes over an archive file.
///
/// The archive is locked for the codec's lifetime: exclusively when writing,
/// shared when reading. Dropping the codec kills and reaps anything still
/// running.
pub struct ProcessCodec {
    mode: CodecMode,
    path: PathBuf,
    stages: Vec<Stage>,
    writer: Option<BufWriter<ChildStdin>>,
    reader: Option<BufReader<ChildStdout>>,
    archive: Option<File>,
    exit: Option<CodecExit>,
}

impl ProcessCodec {
    /// Start the pipeline for `path` in `mode`.
    pub fn spawn(path: impl AsRef<Path>, mode: CodecMode, config: &CodecConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let commands = config.stages(mode);
        if commands.is_empty() {
            return Err(ChainError::Config(
                "codec pipeline needs at least one stage".into(),
            ));
        }

        let archive = match mode {
            CodecMode::Write => {
                let file = OpenOptions::new().write(true).create(true).open(&path)?;
                file.lock_exclusive()?;
                file.set_len(0)?;
                file
            }
            CodecMode::Read => {
                let file = File::open(&path)?;
                file.lock_shared()?;
                file
            }
        };

        let mut codec = Self {
            mode,
            path,
            stages: Vec::with_capacity(commands.len()),
            writer: None,
            reader: None,
            archive: None,
            exit: None,
        };

        let mut upstream: Option<Stdio> = match mode {
            CodecMode::Write => None,
            CodecMode::Read => Some(Stdio::from(archive.try_clone()?)),
        };
        let last = commands.len() - 1;

        for (i, command) in commands.iter().enumerate() {
            let mut cmd = Command::new(&command.program);
            cmd.args(command.args(mode));
            cmd.stdin(upstream.take().unwrap_or_else(Stdio::piped));
            if i == last && mode == CodecMode::Write {
                cmd.stdout(Stdio::from(archive.try_clone()?));
            } else {
                cmd.stdout(Stdio::piped());
            }
            cmd.stderr(Stdio::inherit());

            // Stages spawned so far are reaped by Drop if this fails.
            let mut child = cmd.spawn().map_err(|source| ChainError::Spawn {
                program: command.program.clone(),
                source,
            })?;

            if i == 0 && mode == CodecMode::Write {
                codec.writer = child
                    .stdin
                    .take()
                    .map(|stdin| BufWriter::with_capacity(PIPE_BUFFER_SIZE, stdin));
            }
            if i < last {
                upstream = child.stdout.take().map(Stdio::from);
            } else if mode == CodecMode::Read {
                codec.reader = child
                    .stdout
                    .take()
                    .map(|stdout| BufReader::with_capacity(PIPE_BUFFER_SIZE, stdout));
            }

            codec.stages.push(Stage {
                program: command.program.clone(),
                child,
                status: None,
            });
        }

        codec.archive = Some(archive);
        debug!(
            path = %codec.path.display(),
            ?mode,
            stages = ?commands.iter().map(|c| c.program.as_str()).collect::<Vec<_>>(),
            "spawned codec pipeline"
        );
        Ok(codec)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exit observed by `close` or `terminate`, if any.
    pub fn exit(&self) -> Option<&CodecExit> {
        self.exit.as_ref()
    }

    fn release_archive(&mut self) {
        if let Some(archive) = self.archive.take() {
            if let Err(e) = FileExt::unlock(&archive) {
                warn!(path = %self.path.display(), error = %e, "failed to unlock archive");
            }
        }
    }
}

impl Codec for ProcessCodec {
    fn mode(&self) -> CodecMode {
        self.mode
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| match self.exit {
            Some(_) => ChainError::Terminated,
            None => ChainError::InvalidState("codec is not open for writing".into()),
        })?;
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let reader = self.reader.as_mut().ok_or_else(|| match self.exit {
            Some(_) => ChainError::Terminated,
            None => ChainError::InvalidState("codec is not open for reading".into()),
        })?;
        Ok(reader.read_until(b'\n', buf)?)
    }

    fn close(&mut self) -> Result<CodecExit> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }

        // Dropping the writer closes the pipe so the first stage sees EOF.
        let flushed = match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        };
        self.reader = None;

        let mut exit = CodecExit::Success;
        let mut wait_error = None;
        for stage in &mut self.stages {
            match stage.wait() {
                Ok(status) if !status.success() && exit.success() => {
                    exit = CodecExit::Failed {
                        stage: stage.program.clone(),
                        code: status.code(),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(stage = %stage.program, error = %e, "failed to wait for codec stage");
                    wait_error.get_or_insert(e);
                }
            }
        }
        self.release_archive();
        self.exit = Some(exit.clone());
        debug!(path = %self.path.display(), ?exit, "codec pipeline closed");

        flushed?;
        if let Some(e) = wait_error {
            return Err(e.into());
        }
        Ok(exit)
    }

    fn terminate(&mut self) -> Result<()> {
        self.writer = None;
        self.reader = None;

        let mut killed = false;
        let mut first_error = None;
        for stage in &mut self.stages {
            if stage.status.is_none() {
                killed = true;
            }
            if let Err(e) = stage.kill() {
                first_error.get_or_insert(e);
            }
        }
        self.release_archive();

        if self.exit.is_none() {
            self.exit = Some(CodecExit::Terminated);
        }
        if killed {
            debug!(path = %self.path.display(), "codec pipeline terminated");
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessCodec {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(path = %self.path.display(), error = %e, "failed to reap codec pipeline");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cat() -> CodecConfig {
        CodecConfig {
            line_codec: None,
            compressor: Some(StageCommand::passthrough("cat")),
        }
    }

    #[test]
    fn test_stage_order() {
        let config = CodecConfig {
            line_codec: Some(StageCommand::new("pcompress", Vec::<String>::new(), vec!["-d".into()])),
            compressor: Some(StageCommand::xz(2, false)),
        };
        let write: Vec<_> = config
            .stages(CodecMode::Write)
            .iter()
            .map(|s| s.program.as_str())
            .collect();
        let read: Vec<_> = config
            .stages(CodecMode::Read)
            .iter()
            .map(|s| s.program.as_str())
            .collect();
        assert_eq!(write, vec!["pcompress", "xz"]);
        assert_eq!(read, vec!["xz", "pcompress"]);
    }

    #[test]
    fn test_xz_args() {
        let xz = StageCommand::xz(4, true);
        assert_eq!(xz.write_args, vec!["-z", "-c", "-T", "4", "-e"]);
        assert_eq!(xz.read_args, vec!["-d", "-c", "-T", "4"]);
        assert!(!StageCommand::xz(0, false).write_args.contains(&"-e".to_string()));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let dir = TempDir::new().unwrap();
        let config = CodecConfig {
            line_codec: None,
            compressor: None,
        };
        let result = ProcessCodec::spawn(dir.path().join("a.chain"), CodecMode::Write, &config);
        assert!(matches!(result, Err(ChainError::Config(_))));
    }

    #[test]
    fn test_write_and_read_through_cat() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.chain");

        let mut writer = ProcessCodec::spawn(&path, CodecMode::Write, &cat()).unwrap();
        writer.write_line(b"[1,1,2,2]").unwrap();
        writer.write_line(b"[[],[0]]").unwrap();
        assert_eq!(writer.close().unwrap(), CodecExit::Success);
        assert_eq!(writer.close().unwrap(), CodecExit::Success);
        writer.terminate().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"[1,1,2,2]\n[[],[0]]\n");

        let mut reader = ProcessCodec::spawn(&path, CodecMode::Read, &cat()).unwrap();
        let mut line = Vec::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, b"[1,1,2,2]\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert_eq!(reader.close().unwrap(), CodecExit::Success);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.chain");
        let mut codec = ProcessCodec::spawn(&path, CodecMode::Write, &cat()).unwrap();
        codec.terminate().unwrap();
        codec.terminate().unwrap();
        assert_eq!(codec.exit(), Some(&CodecExit::Terminated));
        assert!(matches!(codec.write_line(b"[1]"), Err(ChainError::Terminated)));
    }

    #[test]
    fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let config = CodecConfig {
            line_codec: None,
            compressor: Some(StageCommand::passthrough("definitely-not-a-codec-binary")),
        };
        let result = ProcessCodec::spawn(dir.path().join("a.chain"), CodecMode::Write, &config);
        assert!(matches!(result, Err(ChainError::Spawn { .. })));
    }

    #[test]
    fn test_failing_stage_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.chain");
        std::fs::write(&path, b"[1]\n").unwrap();

        let config = CodecConfig {
            line_codec: None,
            compressor: Some(StageCommand::passthrough("false")),
        };
        let mut reader = ProcessCodec::spawn(&path, CodecMode::Read, &config).unwrap();
        let mut line = Vec::new();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert_eq!(
            reader.close().unwrap(),
            CodecExit::Failed {
                stage: "false".into(),
                code: Some(1)
            }
        );
    }
}
