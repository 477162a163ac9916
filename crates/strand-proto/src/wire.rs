// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! CBOR framing helpers for hub traffic.
//!
//! A packet is `len (u32, BE) + CBOR payload`. Decoding is incremental:
//! [`decode_frame`] reports how many bytes it consumed so a connection
//! loop can accumulate reads and drain complete frames (see the hub's
//! per-connection reader).

use serde::{de::DeserializeOwned, Serialize};

/// Frames larger than this are treated as protocol violations.
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024 * 1024;

/// Errors produced by packet framing.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer does not yet hold a complete frame.
    #[error("incomplete frame: need {need} more bytes")]
    Incomplete {
        /// Lower bound on missing bytes (1 when only the length prefix is
        /// short).
        need: usize,
    },
    /// The declared payload length exceeds [`MAX_FRAME_PAYLOAD`].
    #[error("frame payload of {0} bytes exceeds limit")]
    Oversized(usize),
    /// CBOR serialization failed.
    #[error("encode: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    /// CBOR deserialization failed.
    #[error("decode: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

/// Encodes a value into a length-prefixed CBOR packet.
///
/// # Errors
/// [`WireError::Oversized`] when the encoded payload exceeds the frame
/// limit; [`WireError::Encode`] on serialization failure.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body)?;
    if body.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::Oversized(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes one packet from the front of `buf`, returning the value and the
/// bytes consumed.
///
/// # Errors
/// [`WireError::Incomplete`] when more bytes are needed;
/// [`WireError::Oversized`] when the declared length exceeds the frame
/// limit (the connection should be dropped); [`WireError::Decode`] when the
/// payload is not valid CBOR for `T`.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), WireError> {
    if buf.len() < 4 {
        return Err(WireError::Incomplete {
            need: 4 - buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(WireError::Oversized(len));
    }
    if buf.len() < 4 + len {
        return Err(WireError::Incomplete {
            need: 4 + len - buf.len(),
        });
    }
    let value = ciborium::from_reader(&buf[4..4 + len])?;
    Ok((value, 4 + len))
}
