//! Line-stream codecs.
//!
//! A codec sits between the chain encoder/decoder and the archive on disk. The
//! encoder hands it whole record lines; the decoder pulls whole lines back out.
//! What happens to the bytes in between (external compressors, an in-memory
//! buffer) is opaque to the delta logic.

mod memory;
mod process;

pub use memory::{MemoryCodec, SharedBuffer};
pub use process::{CodecConfig, ProcessCodec, StageCommand};

use crate::error::Result;

/// Direction a codec was opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecMode {
    /// Accepts lines and writes the archive.
    Write,
    /// Reads the archive and yields lines.
    Read,
}

/// How a codec finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecExit {
    /// Every stage exited cleanly.
    Success,
    /// A stage exited non-zero (`code` is `None` when killed by a signal).
    Failed { stage: String, code: Option<i32> },
    /// The codec was forcibly terminated.
    Terminated,
}

impl CodecExit {
    pub fn success(&self) -> bool {
        matches!(self, CodecExit::Success)
    }
}

/// A line-oriented compressor/decompressor.
pub trait Codec {
    fn mode(&self) -> CodecMode;

    /// Write one record line. `line` must not contain a newline; the codec
    /// appends the terminator and flushes before returning.
    fn write_line(&mut self, line: &[u8]) -> Result<()>;

    /// Append the next line, including its `\n` if present, to `buf`.
    /// Returns the number of bytes read; `0` means end of stream.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize>;

    /// Flush and close the write side, then wait for the codec to exit.
    ///
    /// Calling `close` again returns the exit already observed.
    fn close(&mut self) -> Result<CodecExit>;

    /// Forcibly stop the codec. Safe to call repeatedly and after `close`.
    fn terminate(&mut self) -> Result<()>;
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    fn mode(&self) -> CodecMode {
        (**self).mode()
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        (**self).write_line(line)
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        (**self).read_line(buf)
    }

    fn close(&mut self) -> Result<CodecExit> {
        (**self).close()
    }

    fn terminate(&mut self) -> Result<()> {
        (**self).terminate()
    }
}
