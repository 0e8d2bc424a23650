//! Loss report: cumulative record of gaps observed per stream.
//!
//! Entries live in a shared buffer readable by tooling while the receiver
//! appends. One entry per `(session, stream, channel, source)`; repeat
//! observations accumulate bytes and bump the count, with the observation
//! count as the publish word.

use crate::buffer::{align_up, AtomicBuffer};

const OBSERVATION_COUNT_OFFSET: usize = 0;
const TOTAL_BYTES_LOST_OFFSET: usize = 8;
const FIRST_OBSERVATION_OFFSET: usize = 16;
const LAST_OBSERVATION_OFFSET: usize = 24;
const SESSION_ID_OFFSET: usize = 32;
const STREAM_ID_OFFSET: usize = 36;
const CHANNEL_LENGTH_OFFSET: usize = 40;
const CHANNEL_OFFSET: usize = 44;
const ENTRY_ALIGNMENT: usize = 8;

/// Handle onto one report entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHandle {
    offset: usize,
}

pub struct LossReport {
    buffer: AtomicBuffer,
    next_entry_offset: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LossEntry {
    pub observation_count: i64,
    pub total_bytes_lost: i64,
    pub first_observation_ms: i64,
    pub last_observation_ms: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub source: String,
}

impl LossReport {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer, next_entry_offset: 0 }
    }

    pub fn create_entry(
        &mut self,
        initial_bytes_lost: i64,
        now_ms: i64,
        session_id: i32,
        stream_id: i32,
        channel: &str,
        source: &str,
    ) -> Option<EntryHandle> {
        let required = align_up(
            CHANNEL_OFFSET + channel.len() + 4 + source.len(),
            ENTRY_ALIGNMENT,
        );
        let offset = self.next_entry_offset;
        if offset + required > self.buffer.len() {
            return None;
        }

        self.buffer.put_i64(offset + TOTAL_BYTES_LOST_OFFSET, initial_bytes_lost);
        self.buffer.put_i64(offset + FIRST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i64(offset + LAST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i32(offset + SESSION_ID_OFFSET, session_id);
        self.buffer.put_i32(offset + STREAM_ID_OFFSET, stream_id);
        self.buffer.put_i32(offset + CHANNEL_LENGTH_OFFSET, channel.len() as i32);
        self.buffer.put_bytes(offset + CHANNEL_OFFSET, channel.as_bytes());
        let source_length_offset = offset + CHANNEL_OFFSET + channel.len();
        self.buffer.put_i32(source_length_offset, source.len() as i32);
        self.buffer.put_bytes(source_length_offset + 4, source.as_bytes());
        self.buffer
            .put_i64_ordered(offset + OBSERVATION_COUNT_OFFSET, 1);

        self.next_entry_offset = offset + required;
        Some(EntryHandle { offset })
    }

    pub fn record_observation(&self, entry: EntryHandle, bytes_lost: i64, now_ms: i64) {
        let offset = entry.offset;
        self.buffer.put_i64(offset + LAST_OBSERVATION_OFFSET, now_ms);
        let total = self.buffer.get_i64(offset + TOTAL_BYTES_LOST_OFFSET);
        self.buffer.put_i64(offset + TOTAL_BYTES_LOST_OFFSET, total + bytes_lost);
        let count = self.buffer.get_i64(offset + OBSERVATION_COUNT_OFFSET);
        self.buffer
            .put_i64_ordered(offset + OBSERVATION_COUNT_OFFSET, count + 1);
    }

    /// Reads the entries back, tooling-side.
    pub fn read(buffer: &AtomicBuffer) -> Vec<LossEntry> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + CHANNEL_OFFSET < buffer.len() {
            let observation_count = buffer.get_i64_volatile(offset + OBSERVATION_COUNT_OFFSET);
            if observation_count == 0 {
                break;
            }
            let channel_length = buffer.get_i32(offset + CHANNEL_LENGTH_OFFSET) as usize;
            let mut channel = vec![0u8; channel_length];
            buffer.get_bytes(offset + CHANNEL_OFFSET, &mut channel);
            let source_length_offset = offset + CHANNEL_OFFSET + channel_length;
            let source_length = buffer.get_i32(source_length_offset) as usize;
            let mut source = vec![0u8; source_length];
            buffer.get_bytes(source_length_offset + 4, &mut source);

            entries.push(LossEntry {
                observation_count,
                total_bytes_lost: buffer.get_i64(offset + TOTAL_BYTES_LOST_OFFSET),
                first_observation_ms: buffer.get_i64(offset + FIRST_OBSERVATION_OFFSET),
                last_observation_ms: buffer.get_i64(offset + LAST_OBSERVATION_OFFSET),
                session_id: buffer.get_i32(offset + SESSION_ID_OFFSET),
                stream_id: buffer.get_i32(offset + STREAM_ID_OFFSET),
                channel: String::from_utf8_lossy(&channel).into_owned(),
                source: String::from_utf8_lossy(&source).into_owned(),
            });

            offset += align_up(
                CHANNEL_OFFSET + channel_length + 4 + source_length,
                ENTRY_ALIGNMENT,
            );
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    #[test]
    fn entry_accumulates_observations() {
        let owned = AlignedBuffer::new(1024);
        let mut report = LossReport::new(owned.buffer());
        let entry = report
            .create_entry(1024, 100, 888, 101010, "aqueduct:udp?endpoint=h:1", "10.0.0.1:4000")
            .unwrap();
        report.record_observation(entry, 128, 400);
        report.record_observation(entry, 160, 500);

        let entries = LossReport::read(&owned.buffer());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].observation_count, 3);
        assert_eq!(entries[0].total_bytes_lost, 1024 + 128 + 160);
        assert_eq!(entries[0].first_observation_ms, 100);
        assert_eq!(entries[0].last_observation_ms, 500);
        assert_eq!(entries[0].source, "10.0.0.1:4000");
    }

    #[test]
    fn entries_pack_sequentially() {
        let owned = AlignedBuffer::new(1024);
        let mut report = LossReport::new(owned.buffer());
        report.create_entry(10, 1, 1, 1, "a", "s1").unwrap();
        report.create_entry(20, 2, 2, 2, "b", "s2").unwrap();
        let entries = LossReport::read(&owned.buffer());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].total_bytes_lost, 20);
        assert_eq!(entries[1].channel, "b");
    }

    #[test]
    fn full_report_returns_none() {
        let owned = AlignedBuffer::new(64);
        let mut report = LossReport::new(owned.buffer());
        assert!(report.create_entry(1, 1, 1, 1, "channel", "src").is_some());
        assert!(report.create_entry(1, 1, 1, 1, "channel", "src").is_none());
    }
}
