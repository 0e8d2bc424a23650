//! Single-producer/single-consumer ring with log-buffer framing.
//!
//! Backs the client-to-driver command region. Records carry the standard
//! 32-byte frame header with the message type in the type field; the frame
//! length is the commit word, release-stored last by the producer and zeroed
//! by the consumer after handling. Padding records fill the wrap gap.

use crate::buffer::{align_up, AtomicBuffer};
use crate::logbuffer::frame::{
    frame_length_ordered, frame_length_volatile, frame_type, write_header_without_length,
    FRAME_ALIGNMENT, HDR_TYPE_PAD, HEADER_LENGTH,
};
use crate::{Error, Result};

pub const TRAILER_LENGTH: usize = 128;
const TAIL_POSITION_OFFSET: usize = 0;
const HEAD_POSITION_OFFSET: usize = 64;

pub struct RingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
}

impl RingBuffer {
    /// Wraps a region, using the largest power-of-two capacity that leaves
    /// room for the trailer.
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let available = buffer.len().saturating_sub(TRAILER_LENGTH);
        if available < 256 {
            return Err(Error::Generic("ring buffer region too short".into()));
        }
        let capacity = if available.is_power_of_two() {
            available
        } else {
            available.next_power_of_two() >> 1
        };
        Ok(Self { buffer, capacity, mask: capacity - 1 })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_message_length(&self) -> usize {
        self.capacity / 8
    }

    fn tail(&self) -> i64 {
        self.buffer.get_i64_volatile(self.capacity + TAIL_POSITION_OFFSET)
    }

    fn head(&self) -> i64 {
        self.buffer.get_i64_volatile(self.capacity + HEAD_POSITION_OFFSET)
    }

    fn set_tail(&self, tail: i64) {
        self.buffer.put_i64_ordered(self.capacity + TAIL_POSITION_OFFSET, tail);
    }

    fn set_head(&self, head: i64) {
        self.buffer.put_i64_ordered(self.capacity + HEAD_POSITION_OFFSET, head);
    }

    /// Producer side. Fails with a back-pressure error when the consumer has
    /// fallen a full capacity behind.
    pub fn write(&self, msg_type: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message_length() {
            return Err(Error::MessageTooLong {
                length: payload.len(),
                max: self.max_message_length(),
            });
        }
        let record_length = align_up(HEADER_LENGTH + payload.len(), FRAME_ALIGNMENT);

        let mut tail = self.tail();
        let head = self.head();
        let tail_offset = tail as usize & self.mask;
        let to_end = self.capacity - tail_offset;

        let mut required = record_length;
        let padding = if record_length > to_end { to_end } else { 0 };
        required += padding;

        if (tail - head) as usize + required > self.capacity {
            return Err(Error::Generic("command ring temporarily full".into()));
        }

        if padding > 0 {
            write_header_without_length(&self.buffer, tail_offset, HDR_TYPE_PAD, 0, 0, 0, 0, 0);
            frame_length_ordered(&self.buffer, tail_offset, padding as i32);
            tail += padding as i64;
        }

        let record_offset = tail as usize & self.mask;
        self.buffer.put_bytes(record_offset + HEADER_LENGTH, payload);
        write_header_without_length(
            &self.buffer,
            record_offset,
            msg_type,
            0,
            0,
            0,
            0,
            0,
        );
        frame_length_ordered(
            &self.buffer,
            record_offset,
            (HEADER_LENGTH + payload.len()) as i32,
        );
        self.set_tail(tail + record_length as i64);
        Ok(())
    }

    /// Consumer side: handles up to `limit` records, zeroing each behind it.
    pub fn read(&self, limit: usize, mut handler: impl FnMut(u16, &[u8])) -> usize {
        let mut head = self.head();
        let mut count = 0;

        while count < limit {
            let head_offset = head as usize & self.mask;
            let frame_length = frame_length_volatile(&self.buffer, head_offset);
            if frame_length <= 0 {
                break;
            }
            let record_length = align_up(frame_length as usize, FRAME_ALIGNMENT);
            let msg_type = frame_type(&self.buffer, head_offset);
            if msg_type != HDR_TYPE_PAD {
                let payload_length = frame_length as usize - HEADER_LENGTH;
                let mut payload = vec![0u8; payload_length];
                self.buffer.get_bytes(head_offset + HEADER_LENGTH, &mut payload);
                handler(msg_type, &payload);
                count += 1;
            }
            self.buffer.set_memory(head_offset, record_length, 0);
            head += record_length as i64;
            self.set_head(head);
        }

        count
    }

    /// Bytes of unconsumed records.
    pub fn size(&self) -> usize {
        (self.tail() - self.head()) as usize
    }
}

/// Single-producer/many-consumer broadcast for driver-to-client events.
///
/// The transmitter overwrites oldest records; each receiver chases the tail
/// sequence and detects being lapped. Record framing matches the ring; the
/// tail sequence doubles as the seqlock word (odd while a write is in
/// flight).
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
    tail: i64,
}

const BROADCAST_TAIL_OFFSET: usize = 0;

impl BroadcastTransmitter {
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let available = buffer.len().saturating_sub(TRAILER_LENGTH);
        if available < 256 {
            return Err(Error::Generic("broadcast region too short".into()));
        }
        let capacity = if available.is_power_of_two() {
            available
        } else {
            available.next_power_of_two() >> 1
        };
        Ok(Self { buffer, capacity, mask: capacity - 1, tail: 0 })
    }

    fn tail_word(&self) -> usize {
        self.capacity + BROADCAST_TAIL_OFFSET
    }

    pub fn transmit(&mut self, msg_type: u16, payload: &[u8]) -> Result<()> {
        let record_length = align_up(HEADER_LENGTH + payload.len(), FRAME_ALIGNMENT);
        if record_length > self.capacity / 4 {
            return Err(Error::MessageTooLong {
                length: payload.len(),
                max: self.capacity / 4 - HEADER_LENGTH,
            });
        }

        let mut tail = self.tail;
        let tail_offset = tail as usize & self.mask;
        if tail_offset + record_length > self.capacity {
            // Wrap with a padding record to the end.
            let padding = self.capacity - tail_offset;
            self.buffer.put_i64_ordered(self.tail_word(), tail + 1); // in flight
            write_header_without_length(&self.buffer, tail_offset, HDR_TYPE_PAD, 0, 0, 0, 0, 0);
            frame_length_ordered(&self.buffer, tail_offset, padding as i32);
            tail += padding as i64;
            self.buffer.put_i64_ordered(self.tail_word(), tail);
        }

        let record_offset = tail as usize & self.mask;
        self.buffer.put_i64_ordered(self.tail_word(), tail + 1);
        self.buffer.put_bytes(record_offset + HEADER_LENGTH, payload);
        write_header_without_length(&self.buffer, record_offset, msg_type, 0, 0, 0, 0, 0);
        frame_length_ordered(
            &self.buffer,
            record_offset,
            (HEADER_LENGTH + payload.len()) as i32,
        );
        self.tail = tail + record_length as i64;
        self.buffer.put_i64_ordered(self.tail_word(), self.tail);
        Ok(())
    }
}

/// One client's cursor over a broadcast region.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
    cursor: i64,
    pub lapped_count: u64,
}

impl BroadcastReceiver {
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let transmitter = BroadcastTransmitter::new(buffer)?;
        let cursor = transmitter
            .buffer
            .get_i64_volatile(transmitter.tail_word());
        Ok(Self {
            buffer: transmitter.buffer,
            capacity: transmitter.capacity,
            mask: transmitter.mask,
            cursor,
            lapped_count: 0,
        })
    }

    /// Reads forward from the cursor; a receiver lapped by the transmitter
    /// snaps to the live tail and counts the loss.
    pub fn receive(&mut self, limit: usize, mut handler: impl FnMut(u16, &[u8])) -> usize {
        let mut count = 0;
        while count < limit {
            let tail = self.buffer.get_i64_volatile(self.capacity + BROADCAST_TAIL_OFFSET);
            if tail & 1 == 1 || self.cursor >= tail {
                break;
            }
            if tail - self.cursor > self.capacity as i64 {
                self.cursor = tail;
                self.lapped_count += 1;
                break;
            }

            let record_offset = self.cursor as usize & self.mask;
            let frame_length = frame_length_volatile(&self.buffer, record_offset);
            if frame_length <= 0 {
                break;
            }
            let record_length = align_up(frame_length as usize, FRAME_ALIGNMENT);
            let msg_type = frame_type(&self.buffer, record_offset);
            if msg_type != HDR_TYPE_PAD {
                let payload_length = frame_length as usize - HEADER_LENGTH;
                let mut payload = vec![0u8; payload_length];
                self.buffer
                    .get_bytes(record_offset + HEADER_LENGTH, &mut payload);
                // Validate after the copy: a concurrent overwrite invalidates
                // the record and the cursor snaps forward next pass.
                let tail_after =
                    self.buffer.get_i64_volatile(self.capacity + BROADCAST_TAIL_OFFSET);
                if tail_after - self.cursor > self.capacity as i64 {
                    self.cursor = tail_after;
                    self.lapped_count += 1;
                    break;
                }
                handler(msg_type, &payload);
                count += 1;
            }
            self.cursor += record_length as i64;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    fn ring(capacity: usize) -> (AlignedBuffer, RingBuffer) {
        let owned = AlignedBuffer::new(capacity + TRAILER_LENGTH);
        let ring = RingBuffer::new(owned.buffer()).unwrap();
        (owned, ring)
    }

    #[test]
    fn writes_are_read_in_order() {
        let (_owned, ring) = ring(1024);
        ring.write(0x01, b"alpha").unwrap();
        ring.write(0x02, b"bravo-bravo").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(10, |msg_type, payload| {
            seen.push((msg_type, payload.to_vec()));
        });
        assert_eq!(count, 2);
        assert_eq!(seen[0], (0x01, b"alpha".to_vec()));
        assert_eq!(seen[1], (0x02, b"bravo-bravo".to_vec()));
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn full_ring_back_pressures() {
        let (_owned, ring) = ring(256);
        let payload = [0u8; 96]; // 128-byte records
        ring.write(1, &payload).unwrap_err(); // over max message length

        let payload = [0u8; 16]; // 48 -> 64-byte records
        for _ in 0..4 {
            ring.write(1, &payload).unwrap();
        }
        assert!(ring.write(1, &payload).is_err());

        ring.read(1, |_, _| {});
        ring.write(1, &payload).unwrap();
    }

    #[test]
    fn broadcast_fans_out_to_independent_receivers() {
        let owned = AlignedBuffer::new(1024 + TRAILER_LENGTH);
        let mut transmitter = BroadcastTransmitter::new(owned.buffer()).unwrap();
        let mut receiver_a = BroadcastReceiver::new(owned.buffer()).unwrap();
        let mut receiver_b = BroadcastReceiver::new(owned.buffer()).unwrap();

        transmitter.transmit(0x0F03, b"publication ready").unwrap();
        transmitter.transmit(0x0F02, b"available image").unwrap();

        let mut seen_a = Vec::new();
        assert_eq!(receiver_a.receive(10, |t, p| seen_a.push((t, p.to_vec()))), 2);
        let mut seen_b = Vec::new();
        assert_eq!(receiver_b.receive(10, |t, p| seen_b.push((t, p.to_vec()))), 2);
        assert_eq!(seen_a, seen_b);
        assert_eq!(seen_a[0], (0x0F03, b"publication ready".to_vec()));

        // A receiver joining late starts at the live tail.
        let mut late = BroadcastReceiver::new(owned.buffer()).unwrap();
        assert_eq!(late.receive(10, |_, _| {}), 0);
    }

    #[test]
    fn lapped_broadcast_receiver_snaps_to_tail() {
        let owned = AlignedBuffer::new(256 + TRAILER_LENGTH);
        let mut transmitter = BroadcastTransmitter::new(owned.buffer()).unwrap();
        let mut receiver = BroadcastReceiver::new(owned.buffer()).unwrap();

        // More than a full capacity of records without the receiver reading.
        for _ in 0..8 {
            transmitter.transmit(1, &[0u8; 32]).unwrap();
        }
        receiver.receive(100, |_, _| {});
        assert_eq!(receiver.lapped_count, 1);

        // After snapping, new records flow again.
        transmitter.transmit(2, b"fresh").unwrap();
        let mut seen = Vec::new();
        receiver.receive(10, |t, p| seen.push((t, p.to_vec())));
        assert_eq!(seen, vec![(2, b"fresh".to_vec())]);
    }

    #[test]
    fn wrap_inserts_padding_record() {
        let (_owned, ring) = ring(256);
        let payload = [7u8; 16];
        for _ in 0..3 {
            ring.write(1, &payload).unwrap();
        }
        ring.read(2, |_, _| {});
        // Tail at 192 with 64 bytes to the end: a 96-byte record wraps.
        ring.write(2, &[9u8; 64]).unwrap();

        let mut seen = Vec::new();
        ring.read(10, |msg_type, payload| seen.push((msg_type, payload.len())));
        assert_eq!(seen, vec![(1, 16), (2, 64)]);
        assert_eq!(ring.size(), 0);
    }
}
