// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Length-prefixed framing over blocking byte streams.
// Author: Lukas Bower

use std::io::{self, ErrorKind, Read, Write};

use crate::headers::Header;
use crate::DEFAULT_MAX_FRAME_LEN;

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Underlying stream failure.
    #[error("channel io error: {0}")]
    Io(#[from] io::Error),
    /// The stream ended part-way through a frame.
    #[error("truncated frame (expected {expected} bytes, got {received})")]
    Truncated {
        /// Bytes required to complete the frame section.
        expected: usize,
        /// Bytes read before the stream ended.
        received: usize,
    },
    /// The peer declared a frame larger than this channel accepts.
    #[error("frame length {declared} exceeds limit {max}")]
    FrameTooLarge {
        /// Length declared in the prefix.
        declared: u32,
        /// Configured ceiling.
        max: u32,
    },
    /// A local payload does not fit in a single frame.
    #[error("payload of {len} bytes exceeds frame limit {max}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Configured ceiling.
        max: u32,
    },
    /// A control frame did not decode into the expected header.
    #[error("invalid {kind} header: {source}")]
    InvalidHeader {
        /// Header label.
        kind: &'static str,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// The peer closed the connection between frames while more were expected.
    #[error("connection closed while waiting for {0}")]
    UnexpectedEof(&'static str),
    /// A body carried more bytes than its header announced.
    #[error("body overruns declared size {declared} (received {received})")]
    BodyOverrun {
        /// Size announced by the header.
        declared: u64,
        /// Bytes received once the offending frame arrived.
        received: u64,
    },
}

/// Frame reader/writer owning one end of a byte stream.
///
/// Each [`FramedChannel::send`] issues a single buffered write, so frames
/// from one owner never interleave.
#[derive(Debug)]
pub struct FramedChannel<S> {
    stream: S,
    max_frame_len: u32,
}

impl<S> FramedChannel<S> {
    /// Wrap a stream using the default frame ceiling.
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Wrap a stream with an explicit frame ceiling.
    pub fn with_max_frame_len(stream: S, max_frame_len: u32) -> Self {
        Self {
            stream,
            max_frame_len,
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Release the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> FramedChannel<S> {
    /// Write one frame carrying `payload`.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= self.max_frame_len)
            .ok_or(ChannelError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            })?;
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Encode and send a control header.
    pub fn send_header<H: Header>(&mut self, header: &H) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(header).map_err(|source| ChannelError::InvalidHeader {
            kind: H::KIND,
            source,
        })?;
        self.send(&payload)
    }

    /// Send `body` as raw frames of at most `chunk_size` bytes. An empty body
    /// produces no frames.
    pub fn send_body(&mut self, body: &[u8], chunk_size: usize) -> Result<(), ChannelError> {
        for chunk in body.chunks(chunk_size.max(1)) {
            self.send(chunk)?;
        }
        Ok(())
    }
}

impl<S: Read> FramedChannel<S> {
    /// Read the next frame, or `None` when the peer closed the stream cleanly
    /// before a new frame began.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut prefix = [0u8; 4];
        let received = read_full(&mut self.stream, &mut prefix)?;
        if received == 0 {
            return Ok(None);
        }
        if received < prefix.len() {
            return Err(ChannelError::Truncated {
                expected: prefix.len(),
                received,
            });
        }
        let declared = u32::from_be_bytes(prefix);
        if declared > self.max_frame_len {
            return Err(ChannelError::FrameTooLarge {
                declared,
                max: self.max_frame_len,
            });
        }
        let mut payload = vec![0u8; declared as usize];
        let received = read_full(&mut self.stream, &mut payload)?;
        if received < payload.len() {
            return Err(ChannelError::Truncated {
                expected: payload.len(),
                received,
            });
        }
        Ok(Some(payload))
    }

    /// Read the next frame, treating a clean close as an error.
    pub fn expect_frame(&mut self, what: &'static str) -> Result<Vec<u8>, ChannelError> {
        self.receive()?.ok_or(ChannelError::UnexpectedEof(what))
    }

    /// Wait for an acknowledgement frame. Its content is not inspected.
    pub fn receive_ack(&mut self, what: &'static str) -> Result<(), ChannelError> {
        self.expect_frame(what).map(|_| ())
    }

    /// Read and decode a control header.
    pub fn receive_header<H: Header>(&mut self) -> Result<H, ChannelError> {
        let payload = self.expect_frame(H::KIND)?;
        serde_json::from_slice(&payload).map_err(|source| ChannelError::InvalidHeader {
            kind: H::KIND,
            source,
        })
    }

    /// Read raw frames into `sink` until exactly `declared` bytes arrived.
    pub fn receive_body<W: Write>(
        &mut self,
        declared: u64,
        sink: &mut W,
    ) -> Result<u64, ChannelError> {
        let mut received = 0u64;
        while received < declared {
            let chunk = self.expect_frame("body")?;
            received = received.saturating_add(chunk.len() as u64);
            if received > declared {
                return Err(ChannelError::BodyOverrun { declared, received });
            }
            sink.write_all(&chunk)?;
        }
        Ok(received)
    }
}

/// Fill `buf` from `reader`, looping over short reads. Returns the number of
/// bytes read, which is less than `buf.len()` only when the stream ended.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
