// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The single-buffer envelope every unit on the wire conforms to.
//!
//! A unit is either a Frame (a 32-byte [`FrameHeader`] immediately
//! followed by its payload) or an Event (a UTF-8 JSON object whose first
//! non-whitespace byte is `{`). Both travel through the same ring so sinks
//! see control-plane metadata in strict order with the frames around it
//! (a store sink can record codec extradata before the first dependent
//! keyframe arrives).

use vigil_plugin_abi::{FrameHeader, HEADER_BYTES};

/// A classified view into a unit buffer. Borrows; classification never
/// copies the payload.
#[derive(Debug, PartialEq)]
pub enum Unit<'a> {
    Frame {
        header: FrameHeader,
        payload: &'a [u8],
    },
    Event {
        json: &'a str,
    },
}

/// Classify a unit buffer in O(1) (plus the UTF-8 scan for events).
///
/// The event form is checked first: any valid-UTF-8 buffer whose first
/// non-whitespace byte is `{` is an Event, unconditionally. Otherwise the
/// buffer must be an exact frame (`len == HEADER_BYTES + header.bytes`).
/// Returns `None` for malformed units; the dispatcher counts and drops
/// those, they never reach a sink.
pub fn classify(buf: &[u8]) -> Option<Unit<'_>> {
    if leading_byte_is_brace(buf) {
        let json = std::str::from_utf8(buf).ok()?;
        return Some(Unit::Event { json });
    }

    if buf.len() < HEADER_BYTES {
        return None;
    }
    let raw: &[u8; HEADER_BYTES] = buf[..HEADER_BYTES].try_into().ok()?;
    let header = FrameHeader::from_bytes(raw);
    if buf.len() != HEADER_BYTES + header.bytes as usize {
        return None;
    }
    Some(Unit::Frame {
        header,
        payload: &buf[HEADER_BYTES..],
    })
}

/// Encode a frame unit: header followed by payload, exactly
/// `HEADER_BYTES + payload.len()` bytes. The header's `bytes` field is
/// stamped from the payload length.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut stamped = *header;
    stamped.bytes = payload.len() as u32;
    let mut buf = Vec::with_capacity(HEADER_BYTES + payload.len());
    buf.extend_from_slice(&stamped.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn leading_byte_is_brace(buf: &[u8]) -> bool {
    buf.iter()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |b| *b == b'{')
}
