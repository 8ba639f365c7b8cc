//! Framed codec for the textual payload/terminator protocol.
//!
//! One frame is a payload line followed by a terminator line: the connection
//! separator token with the decimal message kind appended. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, in-memory duplexes).
//!
//! The reader is deliberately lenient: a bare separator line is a
//! non-semantic placeholder, and a terminator whose suffix does not parse as
//! a kind ID is skipped rather than failing the stream. Both cases are noted
//! at debug level so a registry mismatch on the other end stays diagnosable.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One wire unit: serialized payload bytes plus the registry kind ID carried
/// by the terminator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub kind: u32,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, kind: u32) -> Self {
        Self {
            payload: payload.into(),
            kind,
        }
    }
}

/// Line-oriented frame codec bound to one connection's separator token.
pub struct FrameCodec {
    separator: String,
    pending: Option<Bytes>,
}

impl FrameCodec {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            pending: None,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    fn take_line(src: &mut BytesMut) -> Option<Bytes> {
        let newline = src.iter().position(|b| *b == b'\n')?;
        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = Self::take_line(src) {
            if !line.starts_with(self.separator.as_bytes()) {
                // Not a terminator: this line becomes the pending payload. A
                // payload line that never sees a valid terminator is simply
                // replaced by the next one.
                self.pending = Some(line);
                continue;
            }
            let suffix = &line[self.separator.len()..];
            if suffix.is_empty() {
                tracing::trace!("ignoring placeholder separator line");
                continue;
            }
            let kind = std::str::from_utf8(suffix)
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            let Some(kind) = kind else {
                tracing::debug!(
                    suffix = %String::from_utf8_lossy(suffix),
                    "skipping terminator with unparseable kind suffix"
                );
                continue;
            };
            let Some(payload) = self.pending.take() else {
                tracing::debug!(kind, "skipping terminator with no pending payload");
                continue;
            };
            return Ok(Some(Frame { payload, kind }));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() && (!src.is_empty() || self.pending.is_some()) {
            tracing::debug!(
                trailing_bytes = src.len(),
                "discarding unterminated data at end of stream"
            );
            src.clear();
            self.pending = None;
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.contains(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame payload must not contain a newline",
            ));
        }
        let terminator = format!("{}{}", self.separator, frame.kind);
        dst.reserve(frame.payload.len() + terminator.len() + 2);
        dst.extend_from_slice(&frame.payload);
        dst.put_u8(b'\n');
        dst.extend_from_slice(terminator.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
