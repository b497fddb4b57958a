use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error as ThisError;
use tokio_util::codec::Encoder;
use tracing::{trace, warn};

use crate::command::Command;
use crate::config::{Config, DEFAULT_MAX_BUFFER_SIZE};
use crate::frame::{self, Frame, CRLF};

#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed reply: {0}")]
    Malformed(frame::Error),
    #[error("buffered reply data ({len} bytes) exceeds limit of {max} bytes")]
    BufferLimitExceeded { len: usize, max: usize },
}

/// Incremental reply parser for one connection.
///
/// Bytes are appended with [`ReplyDecoder::feed`] as they arrive and complete replies are pulled
/// out with [`ReplyDecoder::try_extract`]. A reply is only consumed from the buffer once it has
/// been parsed in full, so a call that reports "no value yet" leaves the buffer untouched and the
/// next call after more bytes arrive starts from the same place.
#[derive(Debug)]
pub struct ReplyDecoder {
    // Bytes received but not yet resolved into a reply.
    buffer: BytesMut,
    strict: bool,
    max_buffer_size: usize,
}

impl ReplyDecoder {
    pub fn new() -> ReplyDecoder {
        ReplyDecoder {
            // Allocate the buffer with 4kb of capacity.
            buffer: BytesMut::with_capacity(4096),
            strict: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    pub fn from_config(config: &Config) -> ReplyDecoder {
        ReplyDecoder::new()
            .strict(config.strict_decoding)
            .max_buffer_size(config.max_buffer_size)
    }

    /// In strict mode a malformed line is reported as an error instead of being skipped.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn max_buffer_size(mut self, max: usize) -> Self {
        self.max_buffer_size = max;
        self
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed by a reply.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partially received reply.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Attempts to take exactly one reply off the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes don't hold a complete reply yet. Meant to be
    /// called in a loop after every [`ReplyDecoder::feed`], one chunk may carry several replies.
    pub fn try_extract(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            if self.buffer.is_empty() {
                return Ok(None);
            }

            // An unfinished reply is parsed again from its first byte on every call, so the cost
            // of a reply split over n chunks grows with n times its size.
            let (result, position) = {
                let mut cursor = Cursor::new(&self.buffer[..]);
                let result = Frame::parse(&mut cursor);
                (result, cursor.position() as usize)
            };

            match result {
                Ok(frame) => {
                    // Remove the parsed frame from the buffer.
                    self.buffer.advance(position);
                    trace!(consumed = position, remaining = self.buffer.len(), "decoded reply");
                    return Ok(Some(frame));
                }
                Err(frame::Error::Incomplete) => {
                    self.check_limit()?;
                    return Ok(None);
                }
                Err(err) if self.strict => return Err(DecodeError::Malformed(err)),
                Err(err) => {
                    if !self.skip_line() {
                        // The offending line isn't terminated yet, wait for the rest of it.
                        self.check_limit()?;
                        return Ok(None);
                    }
                    warn!(error = %err, "skipped malformed reply line");
                }
            }
        }
    }

    /// Fails once more than `max_buffer_size` bytes are held without yielding a reply.
    fn check_limit(&self) -> Result<(), DecodeError> {
        if self.buffer.len() > self.max_buffer_size {
            return Err(DecodeError::BufferLimitExceeded {
                len: self.buffer.len(),
                max: self.max_buffer_size,
            });
        }
        Ok(())
    }

    /// Discards the first line of the buffer. Returns false if no full line is buffered.
    fn skip_line(&mut self) -> bool {
        let line_end = self
            .buffer
            .windows(2)
            .position(|window| window == CRLF);

        match line_end {
            Some(index) => {
                self.buffer.advance(index + CRLF.len());
                true
            }
            None => false,
        }
    }
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes each command as a single inline line.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        command.write_line(dst);
        Ok(())
    }
}
