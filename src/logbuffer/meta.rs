//! Log buffer metadata and the mapped raw log.
//!
//! A raw log is a single region holding three term buffers followed by one
//! metadata page. The metadata block is shared between the publisher process,
//! the driver and every subscriber, so every mutable field is an atomic and
//! field groups are padded apart by write frequency.

use std::path::Path;

use crate::buffer::{is_power_of_two, AlignedBuffer, AtomicBuffer};
use crate::logbuffer::position::{
    index_by_term, index_by_term_count, pack_tail, term_id, PARTITION_COUNT,
};
use crate::mmap::MmapFile;
use crate::{Error, Result};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;
pub const PAGE_MIN_SIZE: usize = 4 * 1024;
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;
pub const LOG_META_LENGTH: usize = PAGE_MIN_SIZE;

pub const NULL_POSITION: i64 = -1;

const FLAG_SIGNAL_EOS: u32 = 1 << 0;
const FLAG_SPIES_SIMULATE_CONNECTION: u32 = 1 << 1;
const FLAG_TETHER: u32 = 1 << 2;
const FLAG_REJOIN: u32 = 1 << 3;
const FLAG_RELIABLE: u32 = 1 << 4;
const FLAG_SPARSE: u32 = 1 << 5;
const FLAG_GROUP: u32 = 1 << 6;

/// Shared metadata block at the end of a raw log.
#[repr(C, align(64))]
pub struct LogMeta {
    // Tail counters and rotation word, the producer-hot line.
    term_tail: [AtomicI64; PARTITION_COUNT],
    active_term_count: AtomicI32,
    _pad0: [u8; 36],

    // Stream state, written on lifecycle edges.
    end_of_stream_position: AtomicI64,
    is_connected: AtomicI32,
    active_transport_count: AtomicI32,
    is_publication_revoked: AtomicI32,
    _pad1: [u8; 44],

    // Geometry and options, written once at initialisation.
    correlation_id: AtomicI64,
    initial_term_id: AtomicI32,
    mtu_length: AtomicI32,
    term_length: AtomicI32,
    page_size: AtomicI32,
    publication_window_length: AtomicI32,
    receiver_window_length: AtomicI32,
    session_id: AtomicI32,
    stream_id: AtomicI32,
    max_resend: AtomicI32,
    _pad_align: [u8; 4],
    linger_timeout_ns: AtomicI64,
    untethered_window_limit_timeout_ns: AtomicI64,
    untethered_linger_timeout_ns: AtomicI64,
    untethered_resting_timeout_ns: AtomicI64,
    flags: AtomicU32,
    _pad2: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<LogMeta>() == 256);
const _: () = assert!(std::mem::size_of::<LogMeta>() <= LOG_META_LENGTH);

/// Initialisation parameters for a fresh raw log.
#[derive(Clone, Debug)]
pub struct LogMetaInit {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub starting_term_id: i32,
    pub starting_term_offset: i32,
    pub mtu_length: usize,
    pub page_size: usize,
    pub publication_window_length: usize,
    pub receiver_window_length: usize,
    pub max_resend: usize,
    pub linger_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
    pub signal_eos: bool,
    pub spies_simulate_connection: bool,
    pub tether: bool,
    pub rejoin: bool,
    pub reliable: bool,
    pub sparse: bool,
    pub group: bool,
}

impl LogMeta {
    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.term_tail[index].load(Ordering::Acquire)
    }

    pub fn raw_tail(&self, index: usize) -> i64 {
        self.term_tail[index].load(Ordering::Relaxed)
    }

    pub fn set_raw_tail(&self, index: usize, raw_tail: i64) {
        self.term_tail[index].store(raw_tail, Ordering::Release);
    }

    pub fn get_and_add_raw_tail(&self, index: usize, aligned_length: i64) -> i64 {
        self.term_tail[index].fetch_add(aligned_length, Ordering::AcqRel)
    }

    pub fn cas_raw_tail(&self, index: usize, expected: i64, update: i64) -> bool {
        self.term_tail[index]
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn active_term_count(&self) -> i32 {
        self.active_term_count.load(Ordering::Acquire)
    }

    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.active_term_count
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Prepares the next partition and advances the active term count.
    /// Idempotent under concurrent rotation attempts.
    pub fn rotate_log(&self, current_term_count: i32, current_term_id: i32) -> bool {
        let next_term_id = current_term_id.wrapping_add(1);
        let next_term_count = current_term_count.wrapping_add(1);
        let next_index = index_by_term_count(next_term_count);
        let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);
        let new_raw_tail = pack_tail(next_term_id, 0);

        loop {
            let raw_tail = self.raw_tail_volatile(next_index);
            if term_id(raw_tail) != expected_term_id {
                break;
            }
            if self.cas_raw_tail(next_index, raw_tail, new_raw_tail) {
                break;
            }
        }

        self.cas_active_term_count(current_term_count, next_term_count)
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    pub fn set_end_of_stream_position(&self, position: i64) {
        self.end_of_stream_position.store(position, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire) == 1
    }

    pub fn set_is_connected(&self, connected: bool) {
        self.is_connected
            .store(if connected { 1 } else { 0 }, Ordering::Release);
    }

    pub fn active_transport_count(&self) -> i32 {
        self.active_transport_count.load(Ordering::Acquire)
    }

    pub fn set_active_transport_count(&self, count: i32) {
        self.active_transport_count.store(count, Ordering::Release);
    }

    pub fn is_publication_revoked(&self) -> bool {
        self.is_publication_revoked.load(Ordering::Acquire) == 1
    }

    pub fn set_publication_revoked(&self) {
        self.is_publication_revoked.store(1, Ordering::Release);
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id.load(Ordering::Relaxed)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id.load(Ordering::Relaxed)
    }

    pub fn mtu_length(&self) -> usize {
        self.mtu_length.load(Ordering::Relaxed) as usize
    }

    pub fn term_length(&self) -> usize {
        self.term_length.load(Ordering::Relaxed) as usize
    }

    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed) as usize
    }

    pub fn publication_window_length(&self) -> usize {
        self.publication_window_length.load(Ordering::Relaxed) as usize
    }

    pub fn receiver_window_length(&self) -> usize {
        self.receiver_window_length.load(Ordering::Relaxed) as usize
    }

    pub fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::Relaxed)
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id.load(Ordering::Relaxed)
    }

    pub fn max_resend(&self) -> usize {
        self.max_resend.load(Ordering::Relaxed) as usize
    }

    pub fn linger_timeout_ns(&self) -> u64 {
        self.linger_timeout_ns.load(Ordering::Relaxed) as u64
    }

    pub fn untethered_window_limit_timeout_ns(&self) -> u64 {
        self.untethered_window_limit_timeout_ns.load(Ordering::Relaxed) as u64
    }

    pub fn untethered_linger_timeout_ns(&self) -> u64 {
        self.untethered_linger_timeout_ns.load(Ordering::Relaxed) as u64
    }

    pub fn untethered_resting_timeout_ns(&self) -> u64 {
        self.untethered_resting_timeout_ns.load(Ordering::Relaxed) as u64
    }

    fn flag(&self, mask: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & mask != 0
    }

    pub fn signal_eos(&self) -> bool {
        self.flag(FLAG_SIGNAL_EOS)
    }

    pub fn spies_simulate_connection(&self) -> bool {
        self.flag(FLAG_SPIES_SIMULATE_CONNECTION)
    }

    pub fn tether(&self) -> bool {
        self.flag(FLAG_TETHER)
    }

    pub fn rejoin(&self) -> bool {
        self.flag(FLAG_REJOIN)
    }

    pub fn reliable(&self) -> bool {
        self.flag(FLAG_RELIABLE)
    }

    pub fn is_sparse(&self) -> bool {
        self.flag(FLAG_SPARSE)
    }

    pub fn is_group(&self) -> bool {
        self.flag(FLAG_GROUP)
    }

    fn init(&self, init: &LogMetaInit, term_length: usize) {
        let active_index = index_by_term(init.initial_term_id, init.starting_term_id);
        self.term_tail[active_index].store(
            pack_tail(init.starting_term_id, init.starting_term_offset),
            Ordering::Relaxed,
        );
        for i in 1..PARTITION_COUNT {
            let index = (active_index + i) % PARTITION_COUNT;
            let expected_term_id =
                init.starting_term_id.wrapping_add(i as i32).wrapping_sub(PARTITION_COUNT as i32);
            self.term_tail[index].store(pack_tail(expected_term_id, 0), Ordering::Relaxed);
        }
        self.active_term_count.store(
            init.starting_term_id.wrapping_sub(init.initial_term_id),
            Ordering::Relaxed,
        );

        self.end_of_stream_position.store(i64::MAX, Ordering::Relaxed);
        self.is_connected.store(0, Ordering::Relaxed);
        self.active_transport_count.store(0, Ordering::Relaxed);
        self.is_publication_revoked.store(0, Ordering::Relaxed);

        self.correlation_id.store(init.correlation_id, Ordering::Relaxed);
        self.initial_term_id.store(init.initial_term_id, Ordering::Relaxed);
        self.mtu_length.store(init.mtu_length as i32, Ordering::Relaxed);
        self.page_size.store(init.page_size as i32, Ordering::Relaxed);
        self.publication_window_length
            .store(init.publication_window_length as i32, Ordering::Relaxed);
        self.receiver_window_length
            .store(init.receiver_window_length as i32, Ordering::Relaxed);
        self.session_id.store(init.session_id, Ordering::Relaxed);
        self.stream_id.store(init.stream_id, Ordering::Relaxed);
        self.max_resend.store(init.max_resend as i32, Ordering::Relaxed);
        self.linger_timeout_ns
            .store(init.linger_timeout_ns as i64, Ordering::Relaxed);
        self.untethered_window_limit_timeout_ns
            .store(init.untethered_window_limit_timeout_ns as i64, Ordering::Relaxed);
        self.untethered_linger_timeout_ns
            .store(init.untethered_linger_timeout_ns as i64, Ordering::Relaxed);
        self.untethered_resting_timeout_ns
            .store(init.untethered_resting_timeout_ns as i64, Ordering::Relaxed);

        let mut flags = 0u32;
        for (set, mask) in [
            (init.signal_eos, FLAG_SIGNAL_EOS),
            (init.spies_simulate_connection, FLAG_SPIES_SIMULATE_CONNECTION),
            (init.tether, FLAG_TETHER),
            (init.rejoin, FLAG_REJOIN),
            (init.reliable, FLAG_RELIABLE),
            (init.sparse, FLAG_SPARSE),
            (init.group, FLAG_GROUP),
        ] {
            if set {
                flags |= mask;
            }
        }
        self.flags.store(flags, Ordering::Relaxed);

        // Publish the term length last: readers treat a non-zero term length
        // as the mapped-log-is-initialised marker.
        self.term_length.store(term_length as i32, Ordering::Release);
    }
}

pub fn check_term_length(term_length: usize) -> Result<()> {
    if term_length < TERM_MIN_LENGTH || term_length > TERM_MAX_LENGTH {
        return Err(Error::Generic(format!(
            "term length {term_length} outside [{TERM_MIN_LENGTH}, {TERM_MAX_LENGTH}]"
        )));
    }
    if !is_power_of_two(term_length) {
        return Err(Error::Generic(format!("term length {term_length} not a power of two")));
    }
    Ok(())
}

pub fn check_page_size(page_size: usize) -> Result<()> {
    if page_size < PAGE_MIN_SIZE || page_size > PAGE_MAX_SIZE {
        return Err(Error::Generic(format!(
            "page size {page_size} outside [{PAGE_MIN_SIZE}, {PAGE_MAX_SIZE}]"
        )));
    }
    if !is_power_of_two(page_size) {
        return Err(Error::Generic(format!("page size {page_size} not a power of two")));
    }
    Ok(())
}

pub fn compute_log_length(term_length: usize) -> usize {
    PARTITION_COUNT * term_length + LOG_META_LENGTH
}

enum Backing {
    Mapped(MmapFile),
    Heap(AlignedBuffer),
}

/// A partitioned log: three terms plus the metadata page, owned by exactly
/// one publication or image.
pub struct RawLog {
    _backing: Backing,
    term_length: usize,
    terms: [AtomicBuffer; PARTITION_COUNT],
    meta_buffer: AtomicBuffer,
}

impl RawLog {
    pub fn create(path: &Path, init: LogMetaInit, term_length: usize, sparse: bool) -> Result<Self> {
        check_term_length(term_length)?;
        check_page_size(init.page_size)?;
        let log_length = compute_log_length(term_length);
        let mmap = MmapFile::create(path, log_length, sparse)?;
        let log = Self::wrap(Backing::Mapped(mmap), term_length)?;
        log.meta().init(&init, term_length);
        Ok(log)
    }

    /// Maps an existing raw log read-write (subscriber side, inspector).
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        let len = mmap.len();
        if len <= LOG_META_LENGTH || (len - LOG_META_LENGTH) % PARTITION_COUNT != 0 {
            return Err(Error::Corrupt("raw log length mismatch"));
        }
        let term_length = (len - LOG_META_LENGTH) / PARTITION_COUNT;
        check_term_length(term_length).map_err(|_| Error::Corrupt("raw log length mismatch"))?;
        let log = Self::wrap(Backing::Mapped(mmap), term_length)?;
        if log.meta().term_length() != term_length {
            return Err(Error::Corrupt("raw log term length mismatch"));
        }
        Ok(log)
    }

    /// Heap-backed log for driver-internal streams and tests.
    pub fn heap(init: LogMetaInit, term_length: usize) -> Result<Self> {
        check_term_length(term_length)?;
        let log_length = PARTITION_COUNT * term_length + LOG_META_LENGTH;
        let owned = AlignedBuffer::new(log_length);
        let log = Self::wrap(Backing::Heap(owned), term_length)?;
        log.meta().init(&init, term_length);
        Ok(log)
    }

    fn wrap(mut backing: Backing, term_length: usize) -> Result<Self> {
        let whole = match &mut backing {
            // SAFETY: the backing owns the allocation for the life of RawLog.
            Backing::Mapped(mmap) => unsafe { AtomicBuffer::new(mmap.as_mut_ptr(), mmap.len()) },
            Backing::Heap(owned) => owned.buffer(),
        };
        if whole.len() < PARTITION_COUNT * term_length + LOG_META_LENGTH {
            return Err(Error::Corrupt("raw log backing too short"));
        }
        let terms = [
            whole.view(0, term_length),
            whole.view(term_length, term_length),
            whole.view(2 * term_length, term_length),
        ];
        let meta_buffer = whole.view(PARTITION_COUNT * term_length, LOG_META_LENGTH);
        Ok(Self {
            _backing: backing,
            term_length,
            terms,
            meta_buffer,
        })
    }

    pub fn meta(&self) -> &LogMeta {
        // SAFETY: the metadata view is LOG_META_LENGTH >= size_of::<LogMeta>()
        // bytes, 64-byte aligned (terms are page multiples), and only accessed
        // through atomics.
        unsafe { &*(self.meta_buffer.as_slice().as_ptr() as *const LogMeta) }
    }

    pub fn term(&self, index: usize) -> &AtomicBuffer {
        &self.terms[index]
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn free(self) {
        drop(self);
    }
}

#[cfg(test)]
pub(crate) fn test_init(term_length: usize) -> LogMetaInit {
    LogMetaInit {
        correlation_id: 42,
        session_id: 7,
        stream_id: 1001,
        initial_term_id: 0,
        starting_term_id: 0,
        starting_term_offset: 0,
        mtu_length: 1408,
        page_size: PAGE_MIN_SIZE,
        publication_window_length: term_length / 2,
        receiver_window_length: term_length / 2,
        max_resend: 16,
        linger_timeout_ns: 5_000_000_000,
        untethered_window_limit_timeout_ns: 10_000_000_000,
        untethered_linger_timeout_ns: 10_000_000_000,
        untethered_resting_timeout_ns: 10_000_000_000,
        signal_eos: true,
        spies_simulate_connection: false,
        tether: true,
        rejoin: true,
        reliable: true,
        sparse: false,
        group: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuffer::position;
    use tempfile::TempDir;

    #[test]
    fn meta_field_offsets_are_stable() {
        let log = RawLog::heap(test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH).unwrap();
        let meta = log.meta();
        let base = meta as *const LogMeta as usize;
        assert_eq!(&meta.active_term_count as *const _ as usize - base, 24);
        assert_eq!(&meta.end_of_stream_position as *const _ as usize - base, 64);
        assert_eq!(&meta.correlation_id as *const _ as usize - base, 128);
        assert_eq!(&meta.linger_timeout_ns as *const _ as usize - base, 176);
        assert_eq!(&meta.flags as *const _ as usize - base, 212);
    }

    #[test]
    fn init_seeds_tails_for_rotation() {
        let log = RawLog::heap(test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH).unwrap();
        let meta = log.meta();
        assert_eq!(position::term_id(meta.raw_tail_volatile(0)), 0);
        assert_eq!(position::term_id(meta.raw_tail_volatile(1)), -2);
        assert_eq!(position::term_id(meta.raw_tail_volatile(2)), -1);
        assert_eq!(meta.active_term_count(), 0);
        assert_eq!(meta.end_of_stream_position(), i64::MAX);
    }

    #[test]
    fn rotate_log_prepares_next_partition() {
        let log = RawLog::heap(test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH).unwrap();
        let meta = log.meta();
        assert!(meta.rotate_log(0, 0));
        assert_eq!(meta.active_term_count(), 1);
        assert_eq!(position::term_id(meta.raw_tail_volatile(1)), 1);
        // A repeated rotation attempt for the stale term count is a no-op.
        assert!(!meta.rotate_log(0, 0));
        assert_eq!(meta.active_term_count(), 1);
    }

    #[test]
    fn create_and_reopen_mapped_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1001-7.logbuffer");
        {
            let log = RawLog::create(&path, test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH, false)
                .unwrap();
            log.meta().set_end_of_stream_position(4096);
        }
        let log = RawLog::open(&path).unwrap();
        assert_eq!(log.term_length(), TERM_MIN_LENGTH);
        assert_eq!(log.meta().session_id(), 7);
        assert_eq!(log.meta().end_of_stream_position(), 4096);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(check_term_length(TERM_MIN_LENGTH - 1).is_err());
        assert!(check_term_length(96 * 1024).is_err());
        assert!(check_term_length(TERM_MAX_LENGTH * 2).is_err());
        assert!(check_page_size(1024).is_err());
    }
}
