//! Frame layout shared by log buffers and the wire.
//!
//! Every message is logged in 32-byte-aligned frames:
//!
//! ```text
//! 0        4       5      6       8         12        16       20      24
//! | length | vers  | flags| type  | termOff | session | stream | termId | reserved(8) |
//! ```
//!
//! The (B)egin and (E)nd flag bits mark fragmentation; both set means the
//! message fits in one frame. A reader must load the frame length with
//! acquire ordering before touching the payload; writers release-store the
//! length last.

use crate::buffer::{align_up, AtomicBuffer};
use crate::{Error, Result};

pub const HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;
pub const CURRENT_VERSION: u8 = 0x1;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;
/// On a heartbeat frame: the stream ends at this position.
pub const EOS_FLAG: u8 = 0x20;
/// On a status message: the receiver wants a SETUP frame.
pub const SETUP_FLAG: u8 = 0x80;
/// On an RTT measurement: this is a reply, not a probe.
pub const REPLY_FLAG: u8 = 0x80;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;
pub const HDR_TYPE_NAK: u16 = 0x02;
pub const HDR_TYPE_SM: u16 = 0x03;
pub const HDR_TYPE_ERR: u16 = 0x04;
pub const HDR_TYPE_SETUP: u16 = 0x05;
pub const HDR_TYPE_RTTM: u16 = 0x06;
pub const HDR_TYPE_RES: u16 = 0x07;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_OFFSET: usize = 24;

pub const MAX_MESSAGE_LENGTH_CAP: usize = 16 * 1024 * 1024;

/// `min(termLength / 8, 16 MiB)`.
pub fn compute_max_message_length(term_length: usize) -> usize {
    std::cmp::min(term_length / 8, MAX_MESSAGE_LENGTH_CAP)
}

/// Number of frames and total aligned length needed to carry `length` bytes
/// fragmented at `max_payload` bytes per frame.
pub fn compute_fragmented_length(length: usize, max_payload: usize) -> usize {
    let frames = std::cmp::max(1, length.div_ceil(max_payload));
    let last_payload = length - (frames - 1) * max_payload;
    (frames - 1) * align_up(HEADER_LENGTH + max_payload, FRAME_ALIGNMENT)
        + align_up(HEADER_LENGTH + last_payload, FRAME_ALIGNMENT)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.frame_length.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4]
            .copy_from_slice(&self.term_offset.to_le_bytes());
        buf[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4]
            .copy_from_slice(&self.session_id.to_le_bytes());
        buf[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[TERM_ID_OFFSET..TERM_ID_OFFSET + 4].copy_from_slice(&self.term_id.to_le_bytes());
        buf[RESERVED_OFFSET..RESERVED_OFFSET + 8]
            .copy_from_slice(&self.reserved_value.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(Error::InvalidFrame("header truncated"));
        }
        let read_i32 = |offset: usize| {
            i32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("slice length"))
        };
        let version = bytes[VERSION_OFFSET];
        if version != CURRENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self {
            frame_length: read_i32(LENGTH_OFFSET),
            version,
            flags: bytes[FLAGS_OFFSET],
            frame_type: u16::from_le_bytes(
                bytes[TYPE_OFFSET..TYPE_OFFSET + 2].try_into().expect("slice length"),
            ),
            term_offset: read_i32(TERM_OFFSET_OFFSET),
            session_id: read_i32(SESSION_ID_OFFSET),
            stream_id: read_i32(STREAM_ID_OFFSET),
            term_id: read_i32(TERM_ID_OFFSET),
            reserved_value: i64::from_le_bytes(
                bytes[RESERVED_OFFSET..RESERVED_OFFSET + 8].try_into().expect("slice length"),
            ),
        })
    }
}

pub fn frame_length_volatile(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32_volatile(frame_offset + LENGTH_OFFSET)
}

pub fn frame_length_ordered(buffer: &AtomicBuffer, frame_offset: usize, length: i32) {
    buffer.put_i32_ordered(frame_offset + LENGTH_OFFSET, length);
}

pub fn frame_type(buffer: &AtomicBuffer, frame_offset: usize) -> u16 {
    buffer.get_u16(frame_offset + TYPE_OFFSET)
}

pub fn frame_flags(buffer: &AtomicBuffer, frame_offset: usize) -> u8 {
    buffer.get_u8(frame_offset + FLAGS_OFFSET)
}

pub fn frame_term_id(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + TERM_ID_OFFSET)
}

pub fn is_padding_frame(buffer: &AtomicBuffer, frame_offset: usize) -> bool {
    frame_type(buffer, frame_offset) == HDR_TYPE_PAD
}

/// Writes every header field except the frame length, which the committer
/// release-stores last.
pub fn write_header_without_length(
    buffer: &AtomicBuffer,
    frame_offset: usize,
    frame_type_value: u16,
    flags: u8,
    term_offset: i32,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
) {
    buffer.put_u8(frame_offset + VERSION_OFFSET, CURRENT_VERSION);
    buffer.put_u8(frame_offset + FLAGS_OFFSET, flags);
    buffer.put_u16(frame_offset + TYPE_OFFSET, frame_type_value);
    buffer.put_i32(frame_offset + TERM_OFFSET_OFFSET, term_offset);
    buffer.put_i32(frame_offset + SESSION_ID_OFFSET, session_id);
    buffer.put_i32(frame_offset + STREAM_ID_OFFSET, stream_id);
    buffer.put_i32(frame_offset + TERM_ID_OFFSET, term_id);
    buffer.put_i64(frame_offset + RESERVED_OFFSET, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_preserves_fields() {
        let header = FrameHeader {
            frame_length: 4096,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset: 224,
            session_id: -77,
            stream_id: 1001,
            term_id: 5,
            reserved_value: 0x0123_4567_89AB_CDEF,
        };
        let bytes = header.to_bytes();
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = FrameHeader {
            frame_length: 64,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset: 0,
            session_id: 0,
            stream_id: 0,
            term_id: 0,
            reserved_value: 0,
        }
        .to_bytes();
        bytes[VERSION_OFFSET] = 9;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(Error::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn max_message_length_is_term_bounded() {
        assert_eq!(compute_max_message_length(64 * 1024), 8 * 1024);
        assert_eq!(compute_max_message_length(1024 * 1024 * 1024), MAX_MESSAGE_LENGTH_CAP);
    }

    #[test]
    fn fragmented_length_counts_headers_per_fragment() {
        // 100 bytes at 40-byte payload per fragment: 40 + 40 + 20.
        let length = compute_fragmented_length(100, 40);
        let expected = 2 * align_up(HEADER_LENGTH + 40, FRAME_ALIGNMENT)
            + align_up(HEADER_LENGTH + 20, FRAME_ALIGNMENT);
        assert_eq!(length, expected);
    }

    #[test]
    fn single_frame_message_has_one_header() {
        assert_eq!(
            compute_fragmented_length(16, 1376),
            align_up(HEADER_LENGTH + 16, FRAME_ALIGNMENT)
        );
    }
}
