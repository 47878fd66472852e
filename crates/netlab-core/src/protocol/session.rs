//! Resumable frame decoder attached 1:1 to a connection.
//!
//! # Why a state machine? (for beginners)
//!
//! A non-blocking `read` returns *whatever happens to be in the kernel buffer*.
//! One read may deliver half a header; the next may deliver the rest of the
//! header, an entire body, and the first three bytes of the following frame.
//! A blocking "read exactly 4 bytes, then read exactly N bytes" loop cannot
//! work here because it would stall the whole event loop.
//!
//! Instead, every connection owns a [`Session`] that remembers *where it got
//! to*.  Bytes are appended as they arrive and [`Session::next_frame`] walks
//! the state machine as far as the buffered bytes allow:
//!
//! ```text
//!            header complete             body complete
//! AwaitingHeader ──────────► AwaitingBody ──────────► FrameReady
//!       ▲                                                 │
//!       └──────────────── frame emitted ──────────────────┘
//! ```
//!
//! Surplus bytes after a frame stay in the buffer and become the start of the
//! next frame.  Nothing is ever re-scanned from the beginning, which is what
//! makes the output independent of how the stream was chunked.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use super::frame::{FrameError, Framing, DEFAULT_MAX_FRAME_LEN, HEADER_LEN, LINE_DELIMITER};

/// Where the decoder currently is inside the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for a complete 4-byte length header.
    AwaitingHeader,
    /// Header consumed; waiting for `len` body bytes.
    AwaitingBody { len: usize },
    /// `len` body bytes are buffered and ready to be split off.
    FrameReady { len: usize },
    /// Line framing: the first `scanned` buffered bytes are known to contain
    /// no delimiter.
    AwaitingDelimiter { scanned: usize },
}

/// Per-connection decoding state: the partial-frame accumulator plus the
/// position of the decoder within the current frame.
#[derive(Debug)]
pub struct Session {
    framing: Framing,
    max_frame_len: usize,
    buffer: BytesMut,
    state: DecodeState,
    frames_decoded: u64,
}

impl Session {
    /// Creates a decoder for `framing` that rejects bodies longer than
    /// `max_frame_len` bytes.
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len,
            buffer: BytesMut::new(),
            state: Self::initial_state(framing),
            frames_decoded: 0,
        }
    }

    /// Length-prefixed decoder with the given limit.
    pub fn length_prefixed(max_frame_len: usize) -> Self {
        Self::new(Framing::LengthPrefixed, max_frame_len)
    }

    /// Newline-delimited decoder with the given limit.
    pub fn line(max_frame_len: usize) -> Self {
        Self::new(Framing::Line, max_frame_len)
    }

    fn initial_state(framing: Framing) -> DecodeState {
        match framing {
            Framing::LengthPrefixed => DecodeState::AwaitingHeader,
            Framing::Line => DecodeState::AwaitingDelimiter { scanned: 0 },
        }
    }

    /// The framing rule this session decodes.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The configured body limit.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Current decoder position.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of bytes buffered but not yet emitted as frames.
    ///
    /// For a length-prefixed session in `AwaitingBody`, the header has already
    /// been consumed and is not counted.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// `true` if bytes of an incomplete frame are held.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, DecodeState::AwaitingBody { .. })
    }

    /// Total frames emitted since creation.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Appends freshly received bytes to the accumulator.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drops everything buffered and returns to the start of a frame.
    ///
    /// Returns the number of bytes thrown away.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.state = Self::initial_state(self.framing);
        dropped
    }

    /// Advances the state machine and returns the next complete frame, if the
    /// buffered bytes contain one.
    ///
    /// Returns `Ok(None)` when more bytes are needed.  After an error the
    /// session keeps returning the same error: the stream is unusable.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FrameTooLarge`] when a header declares a body
    /// longer than the limit, or when an unterminated line grows past it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let declared = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    if declared > self.max_frame_len {
                        // The header stays buffered so every later call
                        // reports the same failure.
                        return Err(FrameError::FrameTooLarge {
                            declared,
                            max: self.max_frame_len,
                        });
                    }
                    self.buffer.advance(HEADER_LEN);
                    self.state = DecodeState::AwaitingBody { len: declared };
                }
                DecodeState::AwaitingBody { len } => {
                    if self.buffer.len() < len {
                        self.buffer.reserve(len - self.buffer.len());
                        return Ok(None);
                    }
                    self.state = DecodeState::FrameReady { len };
                }
                DecodeState::FrameReady { len } => {
                    let frame = self.buffer.split_to(len).freeze();
                    self.state = DecodeState::AwaitingHeader;
                    return Ok(Some(self.emit(frame)));
                }
                DecodeState::AwaitingDelimiter { scanned } => {
                    return self.next_line(scanned);
                }
            }
        }
    }

    fn next_line(&mut self, scanned: usize) -> Result<Option<Bytes>, FrameError> {
        let found = self.buffer[scanned..]
            .iter()
            .position(|&b| b == LINE_DELIMITER)
            .map(|i| scanned + i);

        let Some(end) = found else {
            if self.buffer.len() > self.max_frame_len {
                return Err(FrameError::FrameTooLarge {
                    declared: self.buffer.len(),
                    max: self.max_frame_len,
                });
            }
            self.state = DecodeState::AwaitingDelimiter {
                scanned: self.buffer.len(),
            };
            return Ok(None);
        };

        // A terminated line may still be over the limit if it arrived in one
        // large chunk.
        if end > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                declared: end,
                max: self.max_frame_len,
            });
        }

        let mut line = self.buffer.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        self.state = DecodeState::AwaitingDelimiter { scanned: 0 };
        Ok(Some(self.emit(line.freeze())))
    }

    fn emit(&mut self, frame: Bytes) -> Bytes {
        self.frames_decoded += 1;
        trace!(
            len = frame.len(),
            leftover = self.buffer.len(),
            "frame decoded"
        );
        frame
    }

    /// Appends `bytes` and drains every frame that is now complete.
    ///
    /// # Errors
    ///
    /// Same as [`Session::next_frame`].  Frames completed before the failing
    /// header are discarded with the error; callers that must act on them
    /// should loop over [`Session::next_frame`] instead.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.extend(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Framing::default(), DEFAULT_MAX_FRAME_LEN)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
