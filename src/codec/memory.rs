//! In-process codec over a shared byte buffer.

use super::{Codec, CodecExit, CodecMode};
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Byte buffer shared between a [`MemoryCodec`] and its owner.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(Mutex::new(bytes.into())))
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Current contents split into lines, without terminators.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Codec that keeps the line stream in memory.
///
/// In write mode lines are appended to the buffer; in read mode lines are
/// served from it in order.
pub struct MemoryCodec {
    mode: CodecMode,
    buffer: SharedBuffer,
    cursor: usize,
    exit: Option<CodecExit>,
    exit_on_close: CodecExit,
}

impl MemoryCodec {
    pub fn writer(buffer: SharedBuffer) -> Self {
        Self::new(CodecMode::Write, buffer)
    }

    pub fn reader(buffer: SharedBuffer) -> Self {
        Self::new(CodecMode::Read, buffer)
    }

    fn new(mode: CodecMode, buffer: SharedBuffer) -> Self {
        Self {
            mode,
            buffer,
            cursor: 0,
            exit: None,
            exit_on_close: CodecExit::Success,
        }
    }

    /// Report `exit` from `close` instead of success.
    pub fn with_exit(mut self, exit: CodecExit) -> Self {
        self.exit_on_close = exit;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.exit.is_some()
    }

    fn ensure_open(&self, expected: CodecMode) -> Result<()> {
        if self.exit.is_some() {
            return Err(ChainError::Terminated);
        }
        if self.mode != expected {
            return Err(ChainError::InvalidState(format!(
                "codec opened for {:?}, not {:?}",
                self.mode, expected
            )));
        }
        Ok(())
    }
}

impl Codec for MemoryCodec {
    fn mode(&self) -> CodecMode {
        self.mode
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.ensure_open(CodecMode::Write)?;
        let mut buffer = self.buffer.0.lock();
        buffer.extend_from_slice(line);
        buffer.push(b'\n');
        Ok(())
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        self.ensure_open(CodecMode::Read)?;
        let buffer = self.buffer.0.lock();
        let rest = &buffer[self.cursor.min(buffer.len())..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |i| i + 1);
        buf.extend_from_slice(&rest[..len]);
        self.cursor += len;
        Ok(len)
    }

    fn close(&mut self) -> Result<CodecExit> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let exit = self.exit_on_close.clone();
        self.exit = Some(exit.clone());
        Ok(exit)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exit.is_none() {
            self.exit = Some(CodecExit::Terminated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_lines() {
        let buffer = SharedBuffer::new();
        let mut writer = MemoryCodec::writer(buffer.clone());
        writer.write_line(b"[1,2]").unwrap();
        writer.write_line(b"[[],[0]]").unwrap();
        assert_eq!(writer.close().unwrap(), CodecExit::Success);
        assert_eq!(buffer.lines(), vec!["[1,2]", "[[],[0]]"]);

        let mut reader = MemoryCodec::reader(buffer);
        let mut line = Vec::new();
        assert_eq!(reader.read_line(&mut line).unwrap(), 6);
        assert_eq!(line, b"[1,2]\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, b"[[],[0]]\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn test_unterminated_tail_is_returned() {
        let mut reader = MemoryCodec::reader(SharedBuffer::from_bytes("[1]\n[2"));
        let mut line = Vec::new();
        reader.read_line(&mut line).unwrap();
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 2);
        assert_eq!(line, b"[2");
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut codec = MemoryCodec::reader(SharedBuffer::new());
        codec.terminate().unwrap();
        codec.terminate().unwrap();
        assert_eq!(codec.close().unwrap(), CodecExit::Terminated);
        assert!(matches!(
            codec.read_line(&mut Vec::new()),
            Err(ChainError::Terminated)
        ));
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let mut codec = MemoryCodec::reader(SharedBuffer::new());
        assert!(matches!(
            codec.write_line(b"[1]"),
            Err(ChainError::InvalidState(_))
        ));
    }
}
