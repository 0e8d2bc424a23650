//! Append, clean, unblock and rebuild operations over term buffers.
//!
//! The appender is the producer face of a log buffer: claim a frame slot by
//! advancing the raw tail, write the payload, then release-publish the frame
//! length. A frame that would cross the term end becomes a padding frame and
//! the log rotates. The rebuilder is the receive-side mirror: packets land at
//! their term offset, idempotently, and a gap scanner walks the committed
//! frames to find loss.

use crate::buffer::{align_up, AtomicBuffer};
use crate::logbuffer::frame::{
    self, frame_length_ordered, frame_length_volatile, write_header_without_length,
    FRAME_ALIGNMENT, HDR_TYPE_DATA, HDR_TYPE_PAD, HEADER_LENGTH, UNFRAGMENTED,
};
use crate::logbuffer::meta::RawLog;
use crate::logbuffer::position::{
    self, compute_position, compute_term_count, index_by_position, index_by_term_count,
    position_bits_to_shift, term_id, term_offset,
};
use crate::{Error, Result};

/// Outcome of a claim attempt that did not produce a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Position is at or past the publisher limit; retry later.
    BackPressured,
    /// The term rolled (padding written, log rotated); retry immediately.
    AdminAction,
}

/// A claimed frame slot awaiting payload and commit.
pub struct Claim<'a> {
    term: &'a AtomicBuffer,
    pub term_id: i32,
    pub term_offset: i32,
    pub position: i64,
    frame_length: i32,
    session_id: i32,
    stream_id: i32,
}

impl Claim<'_> {
    pub fn put_payload(&self, payload: &[u8]) {
        debug_assert!(HEADER_LENGTH + payload.len() <= self.frame_length as usize);
        self.term
            .put_bytes(self.term_offset as usize + HEADER_LENGTH, payload);
    }

    /// Publishes the frame. The length is release-stored last so a reader
    /// sees either the whole frame or a zero length.
    pub fn commit(self) {
        self.commit_with_flags(UNFRAGMENTED);
    }

    pub fn commit_with_flags(self, flags: u8) {
        write_header_without_length(
            self.term,
            self.term_offset as usize,
            HDR_TYPE_DATA,
            flags,
            self.term_offset,
            self.session_id,
            self.stream_id,
            self.term_id,
        );
        frame_length_ordered(self.term, self.term_offset as usize, self.frame_length);
    }

    /// Replaces the claimed slot with padding so readers can pass over it.
    pub fn abort(self) {
        let aligned = align_up(self.frame_length as usize, FRAME_ALIGNMENT);
        write_header_without_length(
            self.term,
            self.term_offset as usize,
            HDR_TYPE_PAD,
            UNFRAGMENTED,
            self.term_offset,
            self.session_id,
            self.stream_id,
            self.term_id,
        );
        frame_length_ordered(self.term, self.term_offset as usize, aligned as i32);
    }
}

/// Producer face of a raw log.
pub struct Appender<'a> {
    log: &'a RawLog,
    is_exclusive: bool,
}

impl<'a> Appender<'a> {
    pub fn new(log: &'a RawLog, is_exclusive: bool) -> Self {
        Self { log, is_exclusive }
    }

    /// Claims a slot for `length` payload bytes.
    ///
    /// Returns the claim, a flow-control outcome, or `MessageTooLong` when
    /// `length` exceeds `min(termLength / 8, 16 MiB)`.
    pub fn claim(
        &self,
        length: usize,
        publisher_limit: i64,
    ) -> Result<std::result::Result<Claim<'a>, ClaimOutcome>> {
        let term_length = self.log.term_length();
        let max_message = frame::compute_max_message_length(term_length);
        if length > max_message {
            return Err(Error::MessageTooLong { length, max: max_message });
        }

        let meta = self.log.meta();
        let bits = position_bits_to_shift(term_length);
        let initial_term_id = meta.initial_term_id();
        let frame_length = (HEADER_LENGTH + length) as i32;
        let aligned_length = align_up(frame_length as usize, FRAME_ALIGNMENT);

        let term_count = meta.active_term_count();
        let index = index_by_term_count(term_count);

        let raw_tail = meta.raw_tail_volatile(index);
        let tail_term_id = term_id(raw_tail);
        if compute_term_count(tail_term_id, initial_term_id) != term_count {
            // Another producer rotated between the two loads; retry.
            return Ok(Err(ClaimOutcome::AdminAction));
        }
        let tail_offset = term_offset(raw_tail, term_length);
        let position = compute_position(tail_term_id, tail_offset, bits, initial_term_id);
        if position >= publisher_limit {
            return Ok(Err(ClaimOutcome::BackPressured));
        }

        let claimed_raw = if self.is_exclusive {
            let updated = position::pack_tail(tail_term_id, tail_offset + aligned_length as i32);
            meta.set_raw_tail(index, updated);
            raw_tail
        } else {
            meta.get_and_add_raw_tail(index, aligned_length as i64)
        };

        let claim_term_id = term_id(claimed_raw);
        let claim_offset = term_offset(claimed_raw, term_length);
        if claim_term_id != tail_term_id {
            // Lost the race to a rotation; the winner pads and rotates.
            return Ok(Err(ClaimOutcome::AdminAction));
        }

        if claim_offset as usize + aligned_length > term_length {
            self.pad_to_term_end(claim_term_id, claim_offset);
            meta.rotate_log(term_count, claim_term_id);
            return Ok(Err(ClaimOutcome::AdminAction));
        }

        Ok(Ok(Claim {
            term: self.log.term(index_by_term_count(term_count)),
            term_id: claim_term_id,
            term_offset: claim_offset,
            position: compute_position(claim_term_id, claim_offset, bits, initial_term_id),
            frame_length,
            session_id: meta.session_id(),
            stream_id: meta.stream_id(),
        }))
    }

    /// Claim, copy, commit in one step.
    pub fn append(
        &self,
        payload: &[u8],
        publisher_limit: i64,
    ) -> Result<std::result::Result<i64, ClaimOutcome>> {
        match self.claim(payload.len(), publisher_limit)? {
            Ok(claim) => {
                let position = claim.position;
                claim.put_payload(payload);
                claim.commit();
                Ok(Ok(position))
            }
            Err(outcome) => Ok(Err(outcome)),
        }
    }

    /// Appends a message larger than `max_payload` as a fragment chain with
    /// the begin flag on the first frame and the end flag on the last.
    pub fn append_fragmented(
        &self,
        payload: &[u8],
        max_payload: usize,
        publisher_limit: i64,
    ) -> Result<std::result::Result<i64, ClaimOutcome>> {
        if payload.len() <= max_payload {
            return self.append(payload, publisher_limit);
        }

        let mut remaining = payload;
        let mut flags = frame::BEGIN_FRAG_FLAG;
        let mut last_position = 0;
        while !remaining.is_empty() {
            let take = std::cmp::min(max_payload, remaining.len());
            if take == remaining.len() {
                flags |= frame::END_FRAG_FLAG;
            }
            loop {
                match self.claim(take, publisher_limit)? {
                    Ok(claim) => {
                        last_position = claim.position + align_up(HEADER_LENGTH + take, FRAME_ALIGNMENT) as i64;
                        claim.put_payload(&remaining[..take]);
                        claim.commit_with_flags(flags);
                        break;
                    }
                    Err(ClaimOutcome::AdminAction) => continue,
                    Err(ClaimOutcome::BackPressured) => {
                        return Ok(Err(ClaimOutcome::BackPressured))
                    }
                }
            }
            remaining = &remaining[take..];
            flags = 0;
        }
        Ok(Ok(last_position))
    }

    fn pad_to_term_end(&self, pad_term_id: i32, pad_offset: i32) {
        let term_length = self.log.term_length();
        if (pad_offset as usize) < term_length {
            let meta = self.log.meta();
            let index = position::index_by_term(meta.initial_term_id(), pad_term_id);
            let term = self.log.term(index);
            write_header_without_length(
                term,
                pad_offset as usize,
                HDR_TYPE_PAD,
                UNFRAGMENTED,
                pad_offset,
                meta.session_id(),
                meta.stream_id(),
                pad_term_id,
            );
            frame_length_ordered(term, pad_offset as usize, (term_length - pad_offset as usize) as i32);
        }
    }
}

/// Producer position implied by the active partition's raw tail.
pub fn producer_position(log: &RawLog) -> i64 {
    let meta = log.meta();
    let term_length = log.term_length();
    let bits = position_bits_to_shift(term_length);
    let term_count = meta.active_term_count();
    let raw_tail = meta.raw_tail_volatile(index_by_term_count(term_count));
    compute_position(
        term_id(raw_tail),
        term_offset(raw_tail, term_length),
        bits,
        meta.initial_term_id(),
    )
}

/// Frees a publication blocked by an unfinished claim.
///
/// If the frame at `blocked_position` still has a zero length while the tail
/// (or the term count) has moved past it, the missing gap is replaced with a
/// padding frame and readers can make progress again.
pub fn unblock(log: &RawLog, blocked_position: i64) -> bool {
    let term_length = log.term_length();
    let bits = position_bits_to_shift(term_length);
    let meta = log.meta();
    let index = index_by_position(blocked_position, bits);
    let blocked_offset = (blocked_position & (term_length as i64 - 1)) as i32;
    let term = log.term(index);

    if frame_length_volatile(term, blocked_offset as usize) != 0 {
        return false;
    }

    let raw_tail = meta.raw_tail_volatile(index);
    let tail_offset = term_offset(raw_tail, term_length);
    let blocked_term_id = term_id(raw_tail);

    let expected_term_count = (blocked_position >> bits) as i32;
    let pad_length = if meta.active_term_count() > expected_term_count {
        term_length as i32 - blocked_offset
    } else if tail_offset > blocked_offset {
        tail_offset - blocked_offset
    } else {
        return false;
    };

    write_header_without_length(
        term,
        blocked_offset as usize,
        HDR_TYPE_PAD,
        UNFRAGMENTED,
        blocked_offset,
        meta.session_id(),
        meta.stream_id(),
        blocked_term_id,
    );
    frame_length_ordered(term, blocked_offset as usize, pad_length);
    true
}

/// Zeroes one term-bounded chunk of `(clean_position, position]`.
///
/// The first 8 bytes of the frame are written last with release order, so a
/// concurrent reader never observes a half-zeroed header. Returns the new
/// clean position.
pub fn clean_to(log: &RawLog, clean_position: i64, position: i64) -> i64 {
    if position <= clean_position {
        return clean_position;
    }
    let term_length = log.term_length();
    let bits = position_bits_to_shift(term_length);
    let term = log.term(index_by_position(clean_position, bits));
    let term_offset = (clean_position & (term_length as i64 - 1)) as usize;
    let bytes = (position - clean_position) as usize;
    let length = std::cmp::min(bytes, term_length - term_offset);

    if length > 8 {
        term.set_memory(term_offset + 8, length - 8, 0);
    }
    term.put_i64_ordered(term_offset, 0);
    clean_position + length as i64
}

/// Receive-side insert of a packet (one or more frames) at its term offset.
/// Idempotent: an already-started slot is left untouched.
pub fn insert_into_term(term: &AtomicBuffer, term_offset: usize, packet: &[u8]) {
    debug_assert!(packet.len() >= 8);
    if frame_length_volatile(term, term_offset) == 0 {
        term.put_bytes(term_offset + 8, &packet[8..]);
        let first_word = i64::from_le_bytes(packet[0..8].try_into().expect("slice length"));
        term.put_i64_ordered(term_offset, first_word);
    }
}

/// A detected loss range within one term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gap {
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

/// Walks committed frames from `rebuild_offset` up to `limit_offset`.
///
/// Returns the new contiguous offset and the first gap, if any. The gap end
/// is found by probing each frame-alignment boundary for a non-zero length.
pub fn scan_for_gap(
    term: &AtomicBuffer,
    gap_term_id: i32,
    rebuild_offset: usize,
    limit_offset: usize,
) -> (usize, Option<Gap>) {
    let mut offset = rebuild_offset;
    while offset < limit_offset {
        let frame_length = frame_length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }
        offset += align_up(frame_length as usize, FRAME_ALIGNMENT);
    }

    if offset >= limit_offset {
        return (std::cmp::min(offset, limit_offset), None);
    }

    let gap_start = offset;
    let mut gap_end = gap_start + FRAME_ALIGNMENT;
    while gap_end < limit_offset && frame_length_volatile(term, gap_end) == 0 {
        gap_end += FRAME_ALIGNMENT;
    }

    (
        gap_start,
        Some(Gap {
            term_id: gap_term_id,
            term_offset: gap_start as i32,
            length: (gap_end - gap_start) as i32,
        }),
    )
}
