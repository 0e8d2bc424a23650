//! Wire message codecs for the UDP control plane.
//!
//! Every datagram starts with the common 8-byte prefix of the frame header
//! (length, version, flags, type); DATA and PAD frames reuse the full log
//! buffer header. All fields are little-endian.

use crate::logbuffer::frame::{
    self, CURRENT_VERSION, HDR_TYPE_NAK, HDR_TYPE_RTTM, HDR_TYPE_SETUP, HDR_TYPE_SM,
};
use crate::{Error, Result};

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().expect("slice length"))
}

fn get_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice length"))
}

fn write_prefix(buf: &mut [u8], length: usize, flags: u8, frame_type: u16) {
    put_i32(buf, 0, length as i32);
    buf[4] = CURRENT_VERSION;
    buf[5] = flags;
    buf[6..8].copy_from_slice(&frame_type.to_le_bytes());
}

fn check_frame(buf: &[u8], expected_type: u16, min_length: usize) -> Result<()> {
    if buf.len() < min_length {
        return Err(Error::InvalidFrame("frame truncated"));
    }
    if buf[4] != CURRENT_VERSION {
        return Err(Error::UnsupportedVersion(buf[4]));
    }
    let frame_type = u16::from_le_bytes(buf[6..8].try_into().expect("slice length"));
    if frame_type != expected_type {
        return Err(Error::InvalidFrame("frame type mismatch"));
    }
    Ok(())
}

/// Announces stream geometry to receivers until a status message arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupFrame {
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_length: i32,
    pub mtu_length: i32,
    pub ttl: i32,
}

impl SetupFrame {
    pub const LENGTH: usize = 40;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        write_prefix(buf, Self::LENGTH, 0, HDR_TYPE_SETUP);
        put_i32(buf, 8, self.term_offset);
        put_i32(buf, 12, self.session_id);
        put_i32(buf, 16, self.stream_id);
        put_i32(buf, 20, self.initial_term_id);
        put_i32(buf, 24, self.active_term_id);
        put_i32(buf, 28, self.term_length);
        put_i32(buf, 32, self.mtu_length);
        put_i32(buf, 36, self.ttl);
        Self::LENGTH
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_frame(buf, HDR_TYPE_SETUP, Self::LENGTH)?;
        Ok(Self {
            term_offset: get_i32(buf, 8),
            session_id: get_i32(buf, 12),
            stream_id: get_i32(buf, 16),
            initial_term_id: get_i32(buf, 20),
            active_term_id: get_i32(buf, 24),
            term_length: get_i32(buf, 28),
            mtu_length: get_i32(buf, 32),
            ttl: get_i32(buf, 36),
        })
    }
}

/// Receiver feedback: consumption position and window, per receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
    pub group_tag: Option<i64>,
}

impl StatusMessage {
    pub const BASE_LENGTH: usize = 36;
    pub const LENGTH_WITH_GROUP_TAG: usize = 44;

    pub fn is_setup_eliciting(&self) -> bool {
        self.flags & frame::SETUP_FLAG != 0
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let length = match self.group_tag {
            Some(_) => Self::LENGTH_WITH_GROUP_TAG,
            None => Self::BASE_LENGTH,
        };
        write_prefix(buf, length, self.flags, HDR_TYPE_SM);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.consumption_term_id);
        put_i32(buf, 20, self.consumption_term_offset);
        put_i32(buf, 24, self.receiver_window);
        put_i64(buf, 28, self.receiver_id);
        if let Some(tag) = self.group_tag {
            put_i64(buf, 36, tag);
        }
        length
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_frame(buf, HDR_TYPE_SM, Self::BASE_LENGTH)?;
        let frame_length = get_i32(buf, 0) as usize;
        let group_tag = if frame_length >= Self::LENGTH_WITH_GROUP_TAG
            && buf.len() >= Self::LENGTH_WITH_GROUP_TAG
        {
            Some(get_i64(buf, 36))
        } else {
            None
        };
        Ok(Self {
            flags: buf[5],
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            consumption_term_id: get_i32(buf, 16),
            consumption_term_offset: get_i32(buf, 20),
            receiver_window: get_i32(buf, 24),
            receiver_id: get_i64(buf, 28),
            group_tag,
        })
    }
}

/// Negative acknowledgement of a term range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NakFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl NakFrame {
    pub const LENGTH: usize = 28;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        write_prefix(buf, Self::LENGTH, 0, HDR_TYPE_NAK);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.term_id);
        put_i32(buf, 20, self.term_offset);
        put_i32(buf, 24, self.length);
        Self::LENGTH
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_frame(buf, HDR_TYPE_NAK, Self::LENGTH)?;
        Ok(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            term_id: get_i32(buf, 16),
            term_offset: get_i32(buf, 20),
            length: get_i32(buf, 24),
        })
    }
}

/// Round-trip time probe and reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttMeasurement {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delta_ns: i64,
    pub receiver_id: i64,
}

impl RttMeasurement {
    pub const LENGTH: usize = 40;

    pub fn is_reply(&self) -> bool {
        self.flags & frame::REPLY_FLAG != 0
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        write_prefix(buf, Self::LENGTH, self.flags, HDR_TYPE_RTTM);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i64(buf, 16, self.echo_timestamp_ns);
        put_i64(buf, 24, self.reception_delta_ns);
        put_i64(buf, 32, self.receiver_id);
        Self::LENGTH
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_frame(buf, HDR_TYPE_RTTM, Self::LENGTH)?;
        Ok(Self {
            flags: buf[5],
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            echo_timestamp_ns: get_i64(buf, 16),
            reception_delta_ns: get_i64(buf, 24),
            receiver_id: get_i64(buf, 32),
        })
    }
}

/// Stream-scoped error, e.g. image rejection reported back to the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub error_code: i32,
    pub message: String,
}

impl ErrorFrame {
    pub const BASE_LENGTH: usize = 24;
    pub const MAX_MESSAGE_LENGTH: usize = 1024;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let message = &self.message.as_bytes()
            [..std::cmp::min(self.message.len(), Self::MAX_MESSAGE_LENGTH)];
        let length = Self::BASE_LENGTH + message.len();
        write_prefix(buf, length, 0, frame::HDR_TYPE_ERR);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.error_code);
        put_i32(buf, 20, message.len() as i32);
        buf[Self::BASE_LENGTH..length].copy_from_slice(message);
        length
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_frame(buf, frame::HDR_TYPE_ERR, Self::BASE_LENGTH)?;
        let message_length = get_i32(buf, 20) as usize;
        if message_length > Self::MAX_MESSAGE_LENGTH
            || buf.len() < Self::BASE_LENGTH + message_length
        {
            return Err(Error::InvalidFrame("error message truncated"));
        }
        Ok(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            error_code: get_i32(buf, 16),
            message: String::from_utf8_lossy(
                &buf[Self::BASE_LENGTH..Self::BASE_LENGTH + message_length],
            )
            .into_owned(),
        })
    }
}
