// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Length-prefixed framing.
//!
//! Every top-level message on a channel is one frame:
//!
//! ```text
//! offset size  field
//! 0      4     payload length = u32 BE (exact, may be 0)
//! 4      N     payload bytes
//! ```
//!
//! For requests the payload starts with the action byte; responses are the
//! bare response payload. A unit response is a zero-length payload, still
//! framed. Readers enforce a payload cap before allocating.

use crate::wire::{Cursor, Wire, WireError};

/// Default payload cap (8 MiB). Channels may configure their own.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Encode one message as a complete frame, length prefix included.
pub fn encode_frame<T: Wire>(msg: &T) -> Vec<u8> {
    let len = msg.encoded_len();
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    msg.write(&mut out);
    out
}

/// Decode a full frame payload, requiring exact consumption.
///
/// # Errors
///
/// Any decode error of `T`, or [`WireError::TrailingBytes`] if the payload
/// is longer than the value it encodes.
pub fn decode_payload<T: Wire>(payload: &[u8]) -> Result<T, WireError> {
    let mut cur = Cursor::new(payload);
    let value = T::read(&mut cur)?;
    cur.finish()?;
    Ok(value)
}

/// Split the next complete frame off an accumulation buffer.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the payload
/// slice and the total number of bytes (prefix included) to drain.
///
/// # Errors
///
/// [`WireError::FrameTooLarge`] when the announced length exceeds
/// `max_payload`; the channel should be closed.
pub fn split_frame(stream: &[u8], max_payload: usize) -> Result<Option<(&[u8], usize)>, WireError> {
    if stream.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([stream[0], stream[1], stream[2], stream[3]]) as usize;
    if len > max_payload {
        return Err(WireError::FrameTooLarge {
            got: len,
            max: max_payload,
        });
    }
    if stream.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((&stream[4..4 + len], 4 + len)))
}
