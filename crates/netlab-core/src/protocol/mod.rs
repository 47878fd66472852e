//! Protocol module containing the framing rules, the resumable decoder, and
//! the text command protocol.

pub mod command;
pub mod frame;
pub mod session;

pub use command::{Command, CommandError};
pub use frame::{encode_frame, encode_frame_vec, FrameError, Framing, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use session::{DecodeState, Session};
