//! Length-Prefixed Frames
//!
//! The diagnostic channel between the orchestrator and a measured child runs
//! over a pipe pair. Every message is one frame:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | rkyv payload     |
//! +----------------+------------------+
//! ```

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Upper bound for a single frame (4 MB). Event batches are flushed well below this.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Errors raised while sending or receiving frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error on diagnostic channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("channel closed by peer")]
    Closed,
}

impl FrameError {
    /// Whether the peer went away (as opposed to sending garbage).
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameError::Closed)
    }
}

/// Encode `message` and write it as one frame, flushing afterwards.
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let payload =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Encode(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame and decode it into `T`.
///
/// A clean end-of-stream before the length prefix is reported as
/// [`FrameError::Closed`]; a stream that ends inside a payload is an I/O error.
pub fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix) {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(e)
        });
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len == 0 {
        return Err(FrameError::Malformed("zero-length frame".to_string()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = rkyv::AlignedVec::with_capacity(len);
    buf.resize(len, 0);
    reader.read_exact(&mut buf)?;

    let archived =
        rkyv::check_archived_root::<T>(&buf).map_err(|e| FrameError::Decode(e.to_string()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|_| FrameError::Decode("infallible deserializer failed".to_string()))
}

/// Sending half of a frame channel
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a raw writer (pipe end, socket, in-memory buffer).
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(16 * 1024, writer),
        }
    }

    /// Send one message.
    pub fn send<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Receiving half of a frame channel
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a raw reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(16 * 1024, reader),
        }
    }

    /// Block until one message arrives.
    pub fn recv<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.reader)
    }

    /// Bytes already pulled from the underlying reader but not yet decoded.
    ///
    /// Callers that poll the raw descriptor must check this first, since a
    /// buffered frame never wakes `poll`.
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChildMessage, ParentCommand};
    use std::io::Cursor;

    #[test]
    fn test_frames_arrive_in_order() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer.send(&ParentCommand::Proceed).unwrap();
            writer.send(&ChildMessage::Finished { dropped: 3 }).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buffer));
        assert!(matches!(reader.recv::<ParentCommand>().unwrap(), ParentCommand::Proceed));
        assert!(matches!(
            reader.recv::<ChildMessage>().unwrap(),
            ChildMessage::Finished { dropped: 3 }
        ));
        assert!(reader.recv::<ChildMessage>().unwrap_err().is_closed());
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0, 0]));
        let err = reader.recv::<ParentCommand>().unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        let mut reader = FrameReader::new(Cursor::new(len.to_vec()));
        let err = reader.recv::<ParentCommand>().unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let mut bytes = 64u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.recv::<ParentCommand>().unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
