//! Newline framing for the IO board serial channel.
//!
//! Bad lines are yielded as `Err` items rather than stream errors, so a
//! single corrupted line never ends the read side of the link.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{DecodeError, Frame};

pub const MAX_LINE_LENGTH: usize = 256;

/// Splits the byte stream on `\n` and decodes each line into a [`Frame`].
///
/// Wraps a length-limited LinesCodec and adds the line protocol on top.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.lines.max_length()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.lines.decode(src) {
            Ok(Some(line)) => Ok(Some(Frame::decode(&line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::trace!(buffered = src.len(), "Discarding over-long line");
                Ok(Some(Err(DecodeError::LineTooLong(self.max_line_length()))))
            }
            // LinesCodec reports non-UTF-8 lines as InvalidData after consuming them.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Err(DecodeError::InvalidUtf8)))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(bytes = src.len(), "Dropping partial line at end of stream");
                    src.clear();
                    self.lines = LinesCodec::new_with_max_length(self.max_line_length());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = frame.encode();
        tracing::trace!(%line, "Encoding frame");
        self.lines.encode(line, dst).map_err(io::Error::other)
    }
}
