//! Byte framing for the host ↔ controller protocol.
//!
//! ```text
//! +------+-----+-----------------+----------+
//! | 0xA5 | LEN | PAYLOAD[LEN]    | CHECKSUM |
//! +------+-----+-----------------+----------+
//! ```
//!
//! `LEN` is 1–255 and `CHECKSUM` is the wrapping byte sum of `LEN` and every
//! payload byte.  Payloads are postcard-encoded messages.

use relume_types::RelumeError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Sync byte opening every frame.
pub const START_BYTE: u8 = 0xA5;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

fn checksum(len: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len, |acc, &b| acc.wrapping_add(b))
}

/// Serialise `msg` and wrap it in a frame.
///
/// # Errors
///
/// [`RelumeError::Protocol`] when serialisation fails or the payload does
/// not fit in one frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, RelumeError> {
    let payload = postcard::to_allocvec(msg).map_err(|e| RelumeError::Protocol(format!("encode failed: {e}")))?;
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(RelumeError::Protocol(format!(
            "payload of {} bytes does not fit in a frame",
            payload.len()
        )));
    }
    let len = payload.len() as u8;
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_BYTE);
    frame.push(len);
    frame.extend_from_slice(&payload);
    frame.push(checksum(len, &payload));
    Ok(frame)
}

/// Decode a frame payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RelumeError> {
    postcard::from_bytes(payload).map_err(|e| RelumeError::Protocol(format!("decode failed: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitStart,
    WaitLen,
    Payload { len: u8 },
    WaitChecksum,
}

/// Streaming frame parser.
///
/// Feed bytes one at a time with [`push`][Self::push]; a complete frame with
/// a valid checksum yields its payload.  Anything else is discarded and the
/// parser hunts for the next [`START_BYTE`].
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    buf: Vec<u8>,
    checksum_failures: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: State::WaitStart,
            buf: Vec::with_capacity(MAX_PAYLOAD),
            checksum_failures: 0,
        }
    }

    /// Process a single incoming byte. Returns the payload once a complete,
    /// valid frame has been received.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::WaitStart => {
                if byte == START_BYTE {
                    self.state = State::WaitLen;
                }
            }
            State::WaitLen => {
                if byte == 0 {
                    self.state = State::WaitStart;
                } else {
                    self.buf.clear();
                    self.state = State::Payload { len: byte };
                }
            }
            State::Payload { len } => {
                self.buf.push(byte);
                if self.buf.len() == len as usize {
                    self.state = State::WaitChecksum;
                }
            }
            State::WaitChecksum => {
                self.state = State::WaitStart;
                let len = self.buf.len() as u8;
                if byte == checksum(len, &self.buf) {
                    return Some(std::mem::take(&mut self.buf));
                }
                self.checksum_failures += 1;
            }
        }
        None
    }

    /// Feed a slice, collecting every completed payload.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Frames rejected because of a checksum mismatch.
    pub fn checksum_failures(&self) -> u64 {
        self.checksum_failures
    }
}
