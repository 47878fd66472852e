//! Frame encoding rules.
//!
//! Wire format (length-prefixed, the default):
//! ```text
//! [body_len:4][body:N]
//! ```
//! `body_len` is a big-endian `u32`.  There is no version byte and no message
//! type: what the body means is entirely up to the application callback.
//!
//! Wire format (line framing):
//! ```text
//! [body:N]\n
//! ```
//! A trailing `\r` before the `\n` is stripped on decode, so `telnet`/`nc`
//! style clients work unchanged.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a frame body: 1 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Line terminator used by [`Framing::Line`].
pub const LINE_DELIMITER: u8 = b'\n';

/// How a byte stream is cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// 4-byte big-endian length header followed by the body.
    #[default]
    LengthPrefixed,
    /// Body terminated by `\n`.
    Line,
}

impl Framing {
    /// Number of bytes this framing adds to every body.
    pub fn overhead(self) -> usize {
        match self {
            Framing::LengthPrefixed => HEADER_LEN,
            Framing::Line => 1,
        }
    }
}

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The declared (or accumulated) body length exceeds the configured maximum.
    #[error("frame too large: {declared} bytes exceeds the {max} byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    /// A line-framed payload contains the delimiter itself.
    #[error("payload contains the line delimiter at offset {offset}")]
    EmbeddedDelimiter { offset: usize },
}

/// Appends one encoded frame carrying `payload` to `dst`.
///
/// # Errors
///
/// - [`FrameError::FrameTooLarge`] if a length-prefixed payload does not fit
///   in the 32-bit header.
/// - [`FrameError::EmbeddedDelimiter`] if a line-framed payload contains `\n`.
///
/// # Examples
///
/// ```rust
/// use bytes::BytesMut;
/// use netlab_core::{encode_frame, Framing};
///
/// let mut buf = BytesMut::new();
/// encode_frame(Framing::LengthPrefixed, b"hello", &mut buf).unwrap();
/// assert_eq!(&buf[..], b"\x00\x00\x00\x05hello");
/// ```
pub fn encode_frame(framing: Framing, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    match framing {
        Framing::LengthPrefixed => {
            let len = u32::try_from(payload.len()).map_err(|_| FrameError::FrameTooLarge {
                declared: payload.len(),
                max: u32::MAX as usize,
            })?;
            dst.reserve(HEADER_LEN + payload.len());
            dst.put_u32(len);
            dst.put_slice(payload);
        }
        Framing::Line => {
            if let Some(offset) = payload.iter().position(|&b| b == LINE_DELIMITER) {
                return Err(FrameError::EmbeddedDelimiter { offset });
            }
            dst.reserve(payload.len() + 1);
            dst.put_slice(payload);
            dst.put_u8(LINE_DELIMITER);
        }
    }
    Ok(())
}

/// Convenience wrapper around [`encode_frame`] returning a fresh `Vec`.
///
/// # Errors
///
/// Same as [`encode_frame`].
pub fn encode_frame_vec(framing: Framing, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::with_capacity(payload.len() + framing.overhead());
    encode_frame(framing, payload, &mut buf)?;
    Ok(buf.to_vec())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
